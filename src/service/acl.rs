//! Access control for module calls and commands
//!
//! Rules, in order:
//! 1. `monitorHandler` / `masterHandler` executes are inter-agent traffic:
//!    allowed from peers and locally, denied to admin clients.
//! 2. Anything relayed by the master to a monitor is allowed; the master
//!    has already checked it.
//! 3. A local `clientHandler` call on the console module carrying a
//!    lifecycle signal (`stop`, `add`, `kill`) is allowed.
//! 4. Everything else needs a registered client with level 0 or 1.

use std::fmt;

use serde::Serialize;
use serde_json::Value;

use super::module::{HandlerKind, CONSOLE_MODULE_ID};

/// Highest client level permitted to run commands and client handlers
pub const MAX_PRIVILEGED_LEVEL: u64 = 1;

const LIFECYCLE_SIGNALS: &[&str] = &["stop", "add", "kill"];

/// Where a call came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    /// An admin client connection
    Client,
    /// The other agent (master for a monitor, monitor for the master)
    Peer,
    /// The hosting process itself
    Local,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AclAction {
    Execute,
    Command,
}

/// A call awaiting an access decision
#[derive(Debug, Clone, Copy)]
pub struct AclRequest<'a> {
    pub action: AclAction,
    /// Handler for executes; `None` for commands
    pub method: Option<HandlerKind>,
    pub module_id: &'a str,
    pub body: &'a Value,
    pub origin: Origin,
}

/// Why a call was refused
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Denial {
    /// Inter-agent handler called by an admin client
    PeerOnly(HandlerKind),
    MissingClientId,
    /// Client not registered, or registered without a level
    UnknownClient,
    PermissionDenied { level: u64 },
}

impl fmt::Display for Denial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Denial::PeerOnly(kind) => write!(f, "{} is not available to clients", kind),
            Denial::MissingClientId => f.write_str("unknown clientId"),
            Denial::UnknownClient => f.write_str("client info error"),
            Denial::PermissionDenied { .. } => f.write_str("command permission denied"),
        }
    }
}

/// Outcome of the rule set before the generic client check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AclVerdict {
    Allow,
    Deny(Denial),
    NotApplicable,
}

/// Apply the explicit rules to `req`
pub fn evaluate(req: &AclRequest<'_>) -> AclVerdict {
    if req.action == AclAction::Execute {
        if let Some(kind @ (HandlerKind::MonitorHandler | HandlerKind::MasterHandler)) = req.method
        {
            return match req.origin {
                Origin::Client => AclVerdict::Deny(Denial::PeerOnly(kind)),
                Origin::Peer | Origin::Local => AclVerdict::Allow,
            };
        }
    }

    if req.origin == Origin::Peer {
        return AclVerdict::Allow;
    }

    if req.origin == Origin::Local
        && req.method == Some(HandlerKind::ClientHandler)
        && req.module_id == CONSOLE_MODULE_ID
        && is_lifecycle_signal(req.body)
    {
        return AclVerdict::Allow;
    }

    AclVerdict::NotApplicable
}

/// Full decision: explicit rules, then the client level check
///
/// `client_level` resolves a registered client's admin level.
pub fn authorize<F>(req: &AclRequest<'_>, client_level: F) -> Result<(), Denial>
where
    F: FnOnce(&str) -> Option<u64>,
{
    match evaluate(req) {
        AclVerdict::Allow => Ok(()),
        AclVerdict::Deny(denial) => Err(denial),
        AclVerdict::NotApplicable => check_client(req.body, client_level),
    }
}

fn check_client<F>(body: &Value, client_level: F) -> Result<(), Denial>
where
    F: FnOnce(&str) -> Option<u64>,
{
    let client_id = body
        .get("clientId")
        .and_then(Value::as_str)
        .ok_or(Denial::MissingClientId)?;
    let level = client_level(client_id).ok_or(Denial::UnknownClient)?;
    if level > MAX_PRIVILEGED_LEVEL {
        return Err(Denial::PermissionDenied { level });
    }
    Ok(())
}

fn is_lifecycle_signal(body: &Value) -> bool {
    body.get("signal")
        .and_then(Value::as_str)
        .map_or(false, |signal| LIFECYCLE_SIGNALS.contains(&signal))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn execute<'a>(kind: HandlerKind, module_id: &'a str, body: &'a Value, origin: Origin) -> AclRequest<'a> {
        AclRequest {
            action: AclAction::Execute,
            method: Some(kind),
            module_id,
            body,
            origin,
        }
    }

    fn command<'a>(module_id: &'a str, body: &'a Value, origin: Origin) -> AclRequest<'a> {
        AclRequest {
            action: AclAction::Command,
            method: None,
            module_id,
            body,
            origin,
        }
    }

    fn levels(id: &str) -> Option<u64> {
        match id {
            "root" => Some(0),
            "ops" => Some(1),
            "viewer" => Some(2),
            _ => None,
        }
    }

    #[test]
    fn test_inter_agent_handlers_allowed() {
        let body = json!({});
        let req = execute(HandlerKind::MasterHandler, "systemInfo", &body, Origin::Peer);
        assert_eq!(evaluate(&req), AclVerdict::Allow);

        let req = execute(HandlerKind::MonitorHandler, "systemInfo", &body, Origin::Local);
        assert_eq!(evaluate(&req), AclVerdict::Allow);

        let req = execute(HandlerKind::MasterHandler, "systemInfo", &body, Origin::Client);
        assert!(matches!(evaluate(&req), AclVerdict::Deny(Denial::PeerOnly(_))));
    }

    #[test]
    fn test_console_lifecycle_bypass() {
        let stop = json!({"signal": "stop"});
        let req = execute(HandlerKind::ClientHandler, CONSOLE_MODULE_ID, &stop, Origin::Local);
        assert_eq!(evaluate(&req), AclVerdict::Allow);
        assert!(authorize(&req, |_| None).is_ok());

        // Same signal from a remote client goes through the level check
        let req = execute(HandlerKind::ClientHandler, CONSOLE_MODULE_ID, &stop, Origin::Client);
        assert_eq!(evaluate(&req), AclVerdict::NotApplicable);
        assert_eq!(authorize(&req, levels), Err(Denial::MissingClientId));

        let restart = json!({"signal": "restart"});
        let req = execute(HandlerKind::ClientHandler, CONSOLE_MODULE_ID, &restart, Origin::Local);
        assert_eq!(evaluate(&req), AclVerdict::NotApplicable);
    }

    #[test]
    fn test_client_level_check() {
        let ok = json!({"clientId": "ops"});
        assert!(authorize(&command("m", &ok, Origin::Client), levels).is_ok());

        let viewer = json!({"clientId": "viewer"});
        let denied = authorize(&command("m", &viewer, Origin::Client), levels).unwrap_err();
        assert_eq!(denied, Denial::PermissionDenied { level: 2 });
        assert_eq!(denied.to_string(), "command permission denied");

        let ghost = json!({"clientId": "ghost"});
        let denied = authorize(&command("m", &ghost, Origin::Client), levels).unwrap_err();
        assert_eq!(denied.to_string(), "client info error");

        let anonymous = json!({});
        let denied = authorize(&command("m", &anonymous, Origin::Client), levels).unwrap_err();
        assert_eq!(denied.to_string(), "unknown clientId");
    }

    #[test]
    fn test_relayed_commands_allowed() {
        let body = json!({"clientId": "viewer"});
        assert_eq!(evaluate(&command("m", &body, Origin::Peer)), AclVerdict::Allow);
    }
}
