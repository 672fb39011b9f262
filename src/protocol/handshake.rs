//! Registration and reconnect handshake payloads

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

/// Free-form description of a process (`host`, `port`, ...)
pub type ServerInfo = Map<String, Value>;

/// Registration `type` for monitor processes
pub const TYPE_MONITOR: &str = "monitor";

/// Registration `type` for admin clients
pub const TYPE_CLIENT: &str = "client";

/// Whether two infos describe the same process instance
///
/// Instances are identified by `host` and `port`; other fields are ignored.
pub fn same_instance(a: &ServerInfo, b: &ServerInfo) -> bool {
    a.get("host") == b.get("host") && a.get("port") == b.get("port")
}

// ─────────────────────────────────────────────────────────────────
// Status Code
// ─────────────────────────────────────────────────────────────────

/// Handshake and command status, `1` on the wire for OK and `-1` for FAIL
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    Ok,
    Fail,
}

impl StatusCode {
    pub fn as_i64(&self) -> i64 {
        match self {
            StatusCode::Ok => 1,
            StatusCode::Fail => -1,
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, StatusCode::Ok)
    }
}

impl Serialize for StatusCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(self.as_i64())
    }
}

impl<'de> Deserialize<'de> for StatusCode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let code = i64::deserialize(deserializer)?;
        Ok(if code == 1 { StatusCode::Ok } else { StatusCode::Fail })
    }
}

impl From<StatusCode> for Value {
    fn from(code: StatusCode) -> Self {
        Value::from(code.as_i64())
    }
}

// ─────────────────────────────────────────────────────────────────
// Registration
// ─────────────────────────────────────────────────────────────────

/// Payload of `register` (and `reconnect`) sent to the master
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RegisterRequest {
    Monitor(MonitorRegistration),
    Client(ClientRegistration),
}

impl RegisterRequest {
    pub fn id(&self) -> &str {
        match self {
            RegisterRequest::Monitor(m) => &m.id,
            RegisterRequest::Client(c) => &c.id,
        }
    }
}

/// A monitor process announcing itself
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorRegistration {
    pub id: String,
    pub server_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default)]
    pub info: ServerInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

/// An admin client logging in
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientRegistration {
    pub id: String,
    pub username: String,
    #[serde(default)]
    pub password: String,
    /// `password` is already a digest rather than plain text
    #[serde(default)]
    pub md5: bool,
}

/// Master's answer on `register` and `reconnect_ok`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterReply {
    pub code: StatusCode,
    #[serde(default)]
    pub msg: String,
}

impl RegisterReply {
    pub fn ok() -> Self {
        Self {
            code: StatusCode::Ok,
            msg: "ok".to_string(),
        }
    }

    pub fn fail(msg: impl Into<String>) -> Self {
        Self {
            code: StatusCode::Fail,
            msg: msg.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_monitor_registration_wire_shape() {
        let mut info = ServerInfo::new();
        info.insert("host".into(), json!("127.0.0.1"));
        info.insert("port".into(), json!(3150));

        let req = RegisterRequest::Monitor(MonitorRegistration {
            id: "connector-1".into(),
            server_type: "connector".into(),
            pid: Some(4242),
            info,
            token: Some("secret".into()),
        });

        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(value["type"], "monitor");
        assert_eq!(value["serverType"], "connector");
        assert_eq!(value["pid"], 4242);
        assert_eq!(value["info"]["port"], 3150);
    }

    #[test]
    fn test_client_registration_parse() {
        let req: RegisterRequest = serde_json::from_value(json!({
            "type": "client",
            "id": "admin-1",
            "username": "admin",
            "password": "pw",
            "md5": false
        }))
        .unwrap();
        assert_eq!(req.id(), "admin-1");
        assert!(matches!(req, RegisterRequest::Client(ref c) if c.username == "admin"));
    }

    #[test]
    fn test_unknown_registration_type() {
        let result = serde_json::from_value::<RegisterRequest>(json!({"type": "robot", "id": "x"}));
        assert!(result.is_err());
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(serde_json::to_value(RegisterReply::ok()).unwrap(), json!({"code": 1, "msg": "ok"}));
        let reply: RegisterReply = serde_json::from_value(json!({"code": -1, "msg": "nope"})).unwrap();
        assert_eq!(reply.code, StatusCode::Fail);
    }

    #[test]
    fn test_same_instance() {
        let a: ServerInfo = serde_json::from_value(json!({"host": "h", "port": 1, "pid": 9})).unwrap();
        let b: ServerInfo = serde_json::from_value(json!({"host": "h", "port": 1})).unwrap();
        let c: ServerInfo = serde_json::from_value(json!({"host": "h", "port": 2})).unwrap();
        assert!(same_instance(&a, &b));
        assert!(!same_instance(&a, &c));
    }
}
