//! Console service: modules, access control and the role facade
//!
//! - [`ConsoleService`]: one per process, wrapping a master or monitor agent
//! - [`ModuleTable`]: module registration, timers and dispatch
//! - [`acl`]: access decisions for module calls and commands
//! - [`auth`]: authentication collaborators and their config-backed defaults

pub mod acl;
pub mod auth;
mod console;
mod module;
mod ordered;
mod table;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::master::PeerKind;
use crate::protocol::ServerInfo;

pub use acl::{AclAction, Origin};
pub use console::{master_options, monitor_options, ConsoleService, Role};
pub use module::{
    is_reserved_module_id, AgentRef, HandlerKind, HandlerSet, Module, Schedule, ScheduleKind,
    CONSOLE_MODULE_ID, MAX_SCHEDULE_SECS,
};
pub use table::{ModuleTable, DEFAULT_EVENT_CAPACITY};

pub(crate) use ordered::OrderedQueue;

/// Audit entry for an admin call, emitted as [`ServiceEvent::AdminLog`]
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditRecord {
    pub time: DateTime<Utc>,
    pub action: AclAction,
    pub origin: Origin,
    pub module_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<HandlerKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    pub body: Value,
    /// Set when the call was denied
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Lifecycle notifications broadcast by a console service
#[derive(Debug, Clone)]
pub enum ServiceEvent {
    /// A monitor registered with the master
    Register {
        id: String,
        server_type: String,
        info: ServerInfo,
    },

    /// A monitor came back through `reconnect`
    Reconnect {
        id: String,
        server_type: String,
        info: ServerInfo,
    },

    /// A registered monitor or client went away
    Disconnect {
        id: String,
        kind: PeerKind,
        server_type: String,
        reason: String,
    },

    AdminLog(AuditRecord),

    /// Non-fatal failure, e.g. a monitor losing the master
    Error { message: String },

    /// The agent was closed
    Close,
}
