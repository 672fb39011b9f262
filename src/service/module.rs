//! Module trait and scheduling metadata
//!
//! A module is a named bundle of up to three handlers:
//! - `monitor_handler`: runs inside a monitor, invoked by the master
//! - `master_handler`: runs inside the master, invoked by monitors or its timer
//! - `client_handler`: runs inside the master, invoked by admin clients
//!
//! Scheduled invocations go through `master_tick`/`monitor_tick`, which by
//! default call the matching handler with `Value::Null` as the body.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::master::MasterAgent;
use crate::monitor::MonitorAgent;

/// Reserved module id for the console itself
pub const CONSOLE_MODULE_ID: &str = "__console__";

/// Whether a module id follows the reserved `__name__` pattern
pub fn is_reserved_module_id(module_id: &str) -> bool {
    module_id.len() > 4
        && module_id.starts_with("__")
        && module_id.ends_with("__")
        && module_id[2..module_id.len() - 2]
            .chars()
            .all(|c| c.is_alphanumeric() || c == '_')
}

// ─────────────────────────────────────────────────────────────────
// Handler Kinds
// ─────────────────────────────────────────────────────────────────

/// Which side of a module a message is addressed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum HandlerKind {
    MonitorHandler,
    MasterHandler,
    ClientHandler,
}

impl HandlerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            HandlerKind::MonitorHandler => "monitorHandler",
            HandlerKind::MasterHandler => "masterHandler",
            HandlerKind::ClientHandler => "clientHandler",
        }
    }
}

impl fmt::Display for HandlerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The handlers a module implements
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HandlerSet {
    monitor: bool,
    master: bool,
    client: bool,
}

impl HandlerSet {
    pub const fn none() -> Self {
        Self {
            monitor: false,
            master: false,
            client: false,
        }
    }

    pub const fn all() -> Self {
        Self {
            monitor: true,
            master: true,
            client: true,
        }
    }

    pub fn with(mut self, kind: HandlerKind) -> Self {
        match kind {
            HandlerKind::MonitorHandler => self.monitor = true,
            HandlerKind::MasterHandler => self.master = true,
            HandlerKind::ClientHandler => self.client = true,
        }
        self
    }

    pub fn contains(&self, kind: HandlerKind) -> bool {
        match kind {
            HandlerKind::MonitorHandler => self.monitor,
            HandlerKind::MasterHandler => self.master,
            HandlerKind::ClientHandler => self.client,
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Schedule
// ─────────────────────────────────────────────────────────────────

/// Which side drives a module's timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleKind {
    /// The master's `master_handler` fires periodically
    Pull,
    /// Each monitor's `monitor_handler` fires periodically
    Push,
}

/// Longest delay or period a timer will wait, one year
pub const MAX_SCHEDULE_SECS: u64 = 365 * 24 * 60 * 60;

/// Periodic invocation settings, in seconds
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Schedule {
    pub kind: ScheduleKind,
    pub delay_secs: f64,
    pub interval_secs: f64,
}

impl Schedule {
    pub fn pull(delay_secs: f64, interval_secs: f64) -> Self {
        Self {
            kind: ScheduleKind::Pull,
            delay_secs,
            interval_secs,
        }
    }

    pub fn push(delay_secs: f64, interval_secs: f64) -> Self {
        Self {
            kind: ScheduleKind::Push,
            delay_secs,
            interval_secs,
        }
    }

    /// Initial delay; negative or non-finite values mean no delay
    ///
    /// Capped at [`MAX_SCHEDULE_SECS`].
    pub fn delay(&self) -> Duration {
        if !(self.delay_secs.is_finite() && self.delay_secs > 0.0) {
            return Duration::ZERO;
        }
        let max = Duration::from_secs(MAX_SCHEDULE_SECS);
        Duration::try_from_secs_f64(self.delay_secs)
            .map(|d| d.min(max))
            .unwrap_or(max)
    }

    /// Period between runs, rounded up to whole seconds; at least one second
    ///
    /// Capped at [`MAX_SCHEDULE_SECS`].
    pub fn interval(&self) -> Duration {
        let secs = if self.interval_secs.is_finite() && self.interval_secs > 0.0 {
            self.interval_secs.ceil().min(MAX_SCHEDULE_SECS as f64)
        } else {
            1.0
        };
        Duration::from_secs(secs as u64)
    }
}

// ─────────────────────────────────────────────────────────────────
// Module Trait
// ─────────────────────────────────────────────────────────────────

fn unsupported(kind: HandlerKind) -> Error {
    Error::UnknownMethod {
        module_id: "<module>".to_string(),
        method: kind.to_string(),
    }
}

/// A pluggable administrative module
///
/// Only the handlers reported by [`handlers`](Module::handlers) are ever
/// called; the rest keep their default bodies.
#[async_trait]
pub trait Module: Send + Sync + 'static {
    fn handlers(&self) -> HandlerSet;

    /// Timer settings, if the module runs periodically
    fn schedule(&self) -> Option<Schedule> {
        None
    }

    async fn monitor_handler(&self, _agent: &MonitorAgent, _body: Value) -> Result<Value> {
        Err(unsupported(HandlerKind::MonitorHandler))
    }

    async fn master_handler(&self, _agent: &MasterAgent, _body: Value) -> Result<Value> {
        Err(unsupported(HandlerKind::MasterHandler))
    }

    async fn client_handler(&self, _agent: &MasterAgent, _body: Value) -> Result<Value> {
        Err(unsupported(HandlerKind::ClientHandler))
    }

    /// Scheduled run on the master for `pull` modules
    async fn master_tick(&self, agent: &MasterAgent) -> Result<()> {
        self.master_handler(agent, Value::Null).await.map(|_| ())
    }

    /// Scheduled run on a monitor for `push` modules
    async fn monitor_tick(&self, agent: &MonitorAgent) -> Result<()> {
        self.monitor_handler(agent, Value::Null).await.map(|_| ())
    }
}

/// The agent a module handler runs against
#[derive(Clone)]
pub enum AgentRef {
    Master(MasterAgent),
    Monitor(MonitorAgent),
}

impl AgentRef {
    pub fn is_master(&self) -> bool {
        matches!(self, AgentRef::Master(_))
    }

    /// Admin level of a registered client, when running on a master
    pub fn client_level(&self, client_id: &str) -> Option<u64> {
        match self {
            AgentRef::Master(agent) => agent.client_level(client_id),
            AgentRef::Monitor(_) => None,
        }
    }
}

impl fmt::Debug for AgentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentRef::Master(_) => f.write_str("AgentRef::Master"),
            AgentRef::Monitor(agent) => write!(f, "AgentRef::Monitor({})", agent.id()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserved_ids() {
        assert!(is_reserved_module_id("__console__"));
        assert!(is_reserved_module_id("__watch_dog__"));
        assert!(!is_reserved_module_id("systemInfo"));
        assert!(!is_reserved_module_id("____"));
        assert!(!is_reserved_module_id("__a-b__"));
    }

    #[test]
    fn test_handler_set() {
        let set = HandlerSet::none()
            .with(HandlerKind::MasterHandler)
            .with(HandlerKind::ClientHandler);
        assert!(set.contains(HandlerKind::MasterHandler));
        assert!(set.contains(HandlerKind::ClientHandler));
        assert!(!set.contains(HandlerKind::MonitorHandler));
        assert!(HandlerSet::all().contains(HandlerKind::MonitorHandler));
    }

    #[test]
    fn test_schedule_normalization() {
        let s = Schedule::pull(-3.0, 0.0);
        assert_eq!(s.delay(), Duration::ZERO);
        assert_eq!(s.interval(), Duration::from_secs(1));

        let s = Schedule::push(2.5, 4.2);
        assert_eq!(s.delay(), Duration::from_millis(2500));
        assert_eq!(s.interval(), Duration::from_secs(5));
    }

    #[test]
    fn test_schedule_caps_huge_values() {
        let max = Duration::from_secs(MAX_SCHEDULE_SECS);
        let s = Schedule::pull(1e300, 1e300);
        assert_eq!(s.delay(), max);
        assert_eq!(s.interval(), max);

        let s = Schedule::push(f64::MAX, f64::INFINITY);
        assert_eq!(s.delay(), max);
        assert_eq!(s.interval(), Duration::from_secs(1));
    }

    #[test]
    fn test_handler_kind_wire_names() {
        assert_eq!(
            serde_json::to_value(HandlerKind::ClientHandler).unwrap(),
            serde_json::json!("clientHandler")
        );
        assert_eq!(HandlerKind::MonitorHandler.to_string(), "monitorHandler");
    }
}
