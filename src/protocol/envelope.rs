//! Envelope codec
//!
//! Four shapes share one flat JSON record and are told apart by which
//! fields are present:
//! - Request: `{reqId, moduleId, body}`
//! - Notify: `{moduleId, body}`
//! - Response: `{respId, error, body}`
//! - Command: `{reqId?, command, moduleId, body}`

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Request identifier, allocated per agent and never reused while it lives
pub type ReqId = u64;

// ─────────────────────────────────────────────────────────────────
// Envelope
// ─────────────────────────────────────────────────────────────────

/// A message exchanged on the `monitor` and `client` topics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawEnvelope", into = "RawEnvelope")]
pub enum Envelope {
    /// Expects exactly one Response carrying the same id
    Request {
        req_id: ReqId,
        module_id: String,
        body: Value,
    },

    /// Fire-and-forget; never answered
    Notify { module_id: String, body: Value },

    /// Answer to a Request or an identified Command
    Response {
        resp_id: ReqId,
        error: Option<RemoteError>,
        body: Value,
    },

    /// Administrative command (`list`, `enable`, `disable`)
    Command {
        req_id: Option<ReqId>,
        command: String,
        module_id: String,
        body: Value,
    },
}

impl Envelope {
    /// True iff the envelope carries an id and is not itself a response
    pub fn is_request(&self) -> bool {
        self.req_id().is_some()
    }

    /// Id a Response to this envelope must carry, if any
    pub fn req_id(&self) -> Option<ReqId> {
        match self {
            Envelope::Request { req_id, .. } => Some(*req_id),
            Envelope::Command { req_id, .. } => *req_id,
            Envelope::Notify { .. } | Envelope::Response { .. } => None,
        }
    }

    pub fn module_id(&self) -> Option<&str> {
        match self {
            Envelope::Request { module_id, .. }
            | Envelope::Notify { module_id, .. }
            | Envelope::Command { module_id, .. } => Some(module_id),
            Envelope::Response { .. } => None,
        }
    }

    pub fn body(&self) -> &Value {
        match self {
            Envelope::Request { body, .. }
            | Envelope::Notify { body, .. }
            | Envelope::Response { body, .. }
            | Envelope::Command { body, .. } => body,
        }
    }

    /// Encode into the JSON value sent as a frame payload
    pub fn to_value(&self) -> Result<Value> {
        serde_json::to_value(self)
            .map_err(|e| Error::Internal(format!("Failed to encode envelope: {}", e)))
    }
}

/// Build a Request (with an id) or a Notify (without)
pub fn compose(req_id: Option<ReqId>, module_id: impl Into<String>, body: Value) -> Envelope {
    let module_id = module_id.into();
    match req_id {
        Some(req_id) => Envelope::Request {
            req_id,
            module_id,
            body,
        },
        None => Envelope::Notify { module_id, body },
    }
}

pub fn compose_command(
    req_id: Option<ReqId>,
    command: impl Into<String>,
    module_id: impl Into<String>,
    body: Value,
) -> Envelope {
    Envelope::Command {
        req_id,
        command: command.into(),
        module_id: module_id.into(),
        body,
    }
}

/// Build the Response to `original`
///
/// Returns `None` when `original` carried no id: notifies are never answered.
pub fn compose_response(
    original: &Envelope,
    error: Option<RemoteError>,
    body: Value,
) -> Option<Envelope> {
    original.req_id().map(|resp_id| Envelope::Response {
        resp_id,
        error,
        body,
    })
}

/// Decode a frame payload
///
/// Accepts the envelope object itself or a JSON string holding one, since
/// some transports deliver payloads pre-encoded.
pub fn parse(raw: &Value) -> Result<Envelope> {
    let decoded = match raw {
        Value::String(text) => serde_json::from_str::<Envelope>(text),
        Value::Object(_) => Envelope::deserialize(raw),
        other => {
            return Err(Error::malformed(format!(
                "expected an object, got {}",
                json_kind(other)
            )))
        }
    };
    decoded.map_err(|e| Error::malformed(e.to_string()))
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

// ─────────────────────────────────────────────────────────────────
// Remote Error
// ─────────────────────────────────────────────────────────────────

/// Error carried inside a Response
///
/// Peers may send either a bare string or an object with a `message` field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RawRemoteError")]
pub struct RemoteError {
    pub message: String,
}

impl RemoteError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<&Error> for RemoteError {
    fn from(err: &Error) -> Self {
        Self::new(err.to_string())
    }
}

impl From<RemoteError> for Error {
    fn from(err: RemoteError) -> Self {
        Error::Remote {
            message: err.message,
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawRemoteError {
    Text(String),
    Object { message: String },
    Other(Value),
}

impl From<RawRemoteError> for RemoteError {
    fn from(raw: RawRemoteError) -> Self {
        match raw {
            RawRemoteError::Text(message) | RawRemoteError::Object { message } => {
                Self { message }
            }
            RawRemoteError::Other(value) => Self {
                message: value.to_string(),
            },
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Flat wire record
// ─────────────────────────────────────────────────────────────────

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawEnvelope {
    #[serde(default, alias = "id", skip_serializing_if = "Option::is_none")]
    req_id: Option<ReqId>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    resp_id: Option<ReqId>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    module_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    command: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<RemoteError>,

    #[serde(default)]
    body: Value,
}

impl TryFrom<RawEnvelope> for Envelope {
    type Error = String;

    fn try_from(raw: RawEnvelope) -> std::result::Result<Self, Self::Error> {
        if let Some(resp_id) = raw.resp_id {
            return Ok(Envelope::Response {
                resp_id,
                error: raw.error,
                body: raw.body,
            });
        }

        if let Some(command) = raw.command {
            return Ok(Envelope::Command {
                req_id: raw.req_id,
                command,
                module_id: raw.module_id.unwrap_or_default(),
                body: raw.body,
            });
        }

        match raw.module_id {
            Some(module_id) => Ok(compose(raw.req_id, module_id, raw.body)),
            None => Err("envelope has neither respId, command nor moduleId".to_string()),
        }
    }
}

impl From<Envelope> for RawEnvelope {
    fn from(envelope: Envelope) -> Self {
        match envelope {
            Envelope::Request {
                req_id,
                module_id,
                body,
            } => RawEnvelope {
                req_id: Some(req_id),
                module_id: Some(module_id),
                body,
                ..Default::default()
            },
            Envelope::Notify { module_id, body } => RawEnvelope {
                module_id: Some(module_id),
                body,
                ..Default::default()
            },
            Envelope::Response {
                resp_id,
                error,
                body,
            } => RawEnvelope {
                resp_id: Some(resp_id),
                error,
                body,
                ..Default::default()
            },
            Envelope::Command {
                req_id,
                command,
                module_id,
                body,
            } => RawEnvelope {
                req_id,
                command: Some(command),
                module_id: Some(module_id),
                body,
                ..Default::default()
            },
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_compose_request_and_notify() {
        let req = compose(Some(7), "echo", json!({"v": 1}));
        assert!(req.is_request());
        assert_eq!(
            req.to_value().unwrap(),
            json!({"reqId": 7, "moduleId": "echo", "body": {"v": 1}})
        );

        let notify = compose(None, "ping", json!({}));
        assert!(!notify.is_request());
        let value = notify.to_value().unwrap();
        assert!(value.get("reqId").is_none());
        assert_eq!(value["moduleId"], "ping");
    }

    #[test]
    fn test_response_only_for_requests() {
        let req = compose(Some(3), "echo", json!(null));
        let resp = compose_response(&req, None, json!("ok")).unwrap();
        assert_eq!(
            resp,
            Envelope::Response {
                resp_id: 3,
                error: None,
                body: json!("ok")
            }
        );
        assert!(!resp.is_request());

        let notify = compose(None, "echo", json!(null));
        assert!(compose_response(&notify, None, json!("ok")).is_none());

        let anonymous_cmd = compose_command(None, "enable", "diag", json!({}));
        assert!(compose_response(&anonymous_cmd, None, json!(1)).is_none());
    }

    #[test]
    fn test_parse_legacy_id_field() {
        let env = parse(&json!({"id": 12, "moduleId": "systemInfo", "body": {}})).unwrap();
        assert_eq!(env.req_id(), Some(12));
        assert_eq!(env.module_id(), Some("systemInfo"));
    }

    #[test]
    fn test_parse_command() {
        let env = parse(&json!({"command": "list", "moduleId": null, "body": {"clientId": "c1"}}))
            .unwrap();
        match env {
            Envelope::Command {
                req_id,
                command,
                module_id,
                body,
            } => {
                assert_eq!(req_id, None);
                assert_eq!(command, "list");
                assert!(module_id.is_empty());
                assert_eq!(body["clientId"], "c1");
            }
            other => panic!("Expected Command, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_response_error_shapes() {
        let env = parse(&json!({"respId": 1, "error": "boom", "body": null})).unwrap();
        match env {
            Envelope::Response { error, .. } => {
                assert_eq!(error, Some(RemoteError::new("boom")));
            }
            other => panic!("Expected Response, got {:?}", other),
        }

        let env = parse(&json!({"respId": 2, "error": {"message": "bad", "stack": "..."}}))
            .unwrap();
        match env {
            Envelope::Response { error, body, .. } => {
                assert_eq!(error.unwrap().message, "bad");
                assert_eq!(body, Value::Null);
            }
            other => panic!("Expected Response, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_string_payload() {
        let raw = Value::String(r#"{"reqId":5,"moduleId":"echo","body":[1,2]}"#.to_string());
        let env = parse(&raw).unwrap();
        assert_eq!(env.req_id(), Some(5));
        assert_eq!(env.body(), &json!([1, 2]));
    }

    #[test]
    fn test_parse_malformed() {
        let err = parse(&json!({"body": {}})).unwrap_err();
        assert!(matches!(err, Error::MalformedEnvelope { .. }));

        let err = parse(&json!(42)).unwrap_err();
        assert!(err.to_string().contains("a number"));

        let err = parse(&Value::String("{not json".into())).unwrap_err();
        assert!(matches!(err, Error::MalformedEnvelope { .. }));
    }
}
