//! Module table: registration, enablement, timers and dispatch
//!
//! Dispatch order for an execute:
//! 1. unknown module id
//! 2. module disabled
//! 3. handler not implemented
//! 4. access control
//!
//! Masters drive `pull` schedules and monitors drive `push` schedules. A
//! timer runs the handler to completion before waiting for the next tick,
//! so runs of one module never overlap.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::acl::{self, AclAction, AclRequest, Origin};
use super::module::{is_reserved_module_id, AgentRef, HandlerKind, Module, Schedule, ScheduleKind};
use super::{AuditRecord, ServiceEvent};
use crate::error::{Error, Result};
use crate::protocol::StatusCode;

/// Default buffered events per subscriber
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

struct ModuleRecord {
    module: Arc<dyn Module>,
    enabled: bool,
    timer: Option<JoinHandle<()>>,
}

impl ModuleRecord {
    fn stop_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

struct TableInner {
    records: Mutex<BTreeMap<String, ModuleRecord>>,
    values: Mutex<HashMap<String, Value>>,
    events: broadcast::Sender<ServiceEvent>,
}

/// Registered modules of one agent, shared by its connections and timers
#[derive(Clone)]
pub struct ModuleTable {
    inner: Arc<TableInner>,
}

impl Default for ModuleTable {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ModuleTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleTable")
            .field("modules", &self.module_ids())
            .finish()
    }
}

impl ModuleTable {
    pub fn new() -> Self {
        Self::with_event_capacity(DEFAULT_EVENT_CAPACITY)
    }

    /// Table whose event subscribers buffer up to `capacity` events
    pub fn with_event_capacity(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity.max(1));
        Self {
            inner: Arc::new(TableInner {
                records: Mutex::new(BTreeMap::new()),
                values: Mutex::new(HashMap::new()),
                events,
            }),
        }
    }

    // ─────────────────────────────────────────────────────────────
    // Registration
    // ─────────────────────────────────────────────────────────────

    /// Add a module, disabled; replaces (and stops) any module with that id
    pub fn register(&self, module_id: impl Into<String>, module: Arc<dyn Module>) {
        let module_id = module_id.into();
        let replaced = self.inner.records.lock().insert(
            module_id.clone(),
            ModuleRecord {
                module,
                enabled: false,
                timer: None,
            },
        );
        if let Some(mut old) = replaced {
            old.stop_timer();
            debug!(module_id = %module_id, "Replaced module registration");
        }
    }

    /// All module ids in ascending order
    pub fn module_ids(&self) -> Vec<String> {
        self.inner.records.lock().keys().cloned().collect()
    }

    /// Module ids shown by `list`: reserved `__name__` ids are hidden
    pub fn public_module_ids(&self) -> Vec<String> {
        self.inner
            .records
            .lock()
            .keys()
            .filter(|id| !is_reserved_module_id(id))
            .cloned()
            .collect()
    }

    pub fn contains(&self, module_id: &str) -> bool {
        self.inner.records.lock().contains_key(module_id)
    }

    pub fn is_enabled(&self, module_id: &str) -> bool {
        self.inner
            .records
            .lock()
            .get(module_id)
            .map_or(false, |r| r.enabled)
    }

    /// Whether the module's timer is currently scheduled
    pub fn has_timer(&self, module_id: &str) -> bool {
        self.inner
            .records
            .lock()
            .get(module_id)
            .map_or(false, |r| r.timer.is_some())
    }

    // ─────────────────────────────────────────────────────────────
    // Enable / Disable
    // ─────────────────────────────────────────────────────────────

    /// Enable a module and start its timer when `agent` drives its schedule
    ///
    /// Returns false for an unknown id. Enabling twice keeps one timer.
    pub fn enable(&self, module_id: &str, agent: &AgentRef) -> bool {
        let mut records = self.inner.records.lock();
        let Some(record) = records.get_mut(module_id) else {
            return false;
        };
        if record.enabled {
            return true;
        }
        record.enabled = true;

        if let Some(schedule) = record.module.schedule() {
            if drives(&schedule, agent) {
                record.timer = Some(spawn_timer(
                    module_id.to_string(),
                    record.module.clone(),
                    schedule,
                    agent.clone(),
                ));
            }
        }
        info!(module_id = %module_id, "Module enabled");
        true
    }

    /// Disable a module and cancel its timer; false for an unknown id
    pub fn disable(&self, module_id: &str) -> bool {
        let mut records = self.inner.records.lock();
        let Some(record) = records.get_mut(module_id) else {
            return false;
        };
        record.enabled = false;
        record.stop_timer();
        info!(module_id = %module_id, "Module disabled");
        true
    }

    pub fn enable_all(&self, agent: &AgentRef) {
        for module_id in self.module_ids() {
            self.enable(&module_id, agent);
        }
    }

    pub fn disable_all(&self) {
        for module_id in self.module_ids() {
            self.disable(&module_id);
        }
    }

    // ─────────────────────────────────────────────────────────────
    // Dispatch
    // ─────────────────────────────────────────────────────────────

    /// Run one of a module's handlers
    pub async fn execute(
        &self,
        agent: &AgentRef,
        module_id: &str,
        kind: HandlerKind,
        body: Value,
        origin: Origin,
    ) -> Result<Value> {
        let module = {
            let records = self.inner.records.lock();
            let record = records.get(module_id).ok_or_else(|| Error::UnknownModule {
                module_id: module_id.to_string(),
            })?;
            if !record.enabled {
                return Err(Error::ModuleDisabled {
                    module_id: module_id.to_string(),
                });
            }
            if !record.module.handlers().contains(kind) {
                return Err(Error::UnknownMethod {
                    module_id: module_id.to_string(),
                    method: kind.to_string(),
                });
            }
            record.module.clone()
        };

        let request = AclRequest {
            action: AclAction::Execute,
            method: Some(kind),
            module_id,
            body: &body,
            origin,
        };
        if let Err(denial) = acl::authorize(&request, |id| agent.client_level(id)) {
            let reason = denial.to_string();
            self.audit(&request, None, Some(reason.clone()));
            return Err(Error::AccessDenied { reason });
        }
        if kind == HandlerKind::ClientHandler {
            self.audit(&request, None, None);
        }

        match (kind, agent) {
            (HandlerKind::MonitorHandler, AgentRef::Monitor(monitor)) => {
                module.monitor_handler(monitor, body).await
            }
            (HandlerKind::MasterHandler, AgentRef::Master(master)) => {
                module.master_handler(master, body).await
            }
            (HandlerKind::ClientHandler, AgentRef::Master(master)) => {
                module.client_handler(master, body).await
            }
            _ => Err(Error::UnknownMethod {
                module_id: module_id.to_string(),
                method: kind.to_string(),
            }),
        }
    }

    /// Run an administrative command: `list`, `enable` or `disable`
    ///
    /// On a master, successful `enable`/`disable` commands are relayed to
    /// every registered monitor.
    pub async fn command(
        &self,
        agent: &AgentRef,
        command: &str,
        module_id: &str,
        body: Value,
        origin: Origin,
    ) -> Result<Value> {
        if !matches!(command, "list" | "enable" | "disable") {
            return Err(Error::UnknownCommand {
                command: command.to_string(),
            });
        }

        let request = AclRequest {
            action: AclAction::Command,
            method: None,
            module_id,
            body: &body,
            origin,
        };
        if let Err(denial) = acl::authorize(&request, |id| agent.client_level(id)) {
            let reason = denial.to_string();
            self.audit(&request, Some(command), Some(reason.clone()));
            return Err(Error::AccessDenied { reason });
        }
        self.audit(&request, Some(command), None);

        if command == "list" {
            return Ok(json!({ "modules": self.public_module_ids() }));
        }

        if module_id.is_empty() {
            return Err(Error::handler("empty moduleId"));
        }
        let applied = if command == "enable" {
            self.enable(module_id, agent)
        } else {
            self.disable(module_id)
        };
        if !applied {
            return Ok(StatusCode::Fail.into());
        }

        if let AgentRef::Master(master) = agent {
            master.notify_command(command, module_id, body);
        }
        Ok(StatusCode::Ok.into())
    }

    // ─────────────────────────────────────────────────────────────
    // Values
    // ─────────────────────────────────────────────────────────────

    /// Store a value under a module id, replacing any previous one
    pub fn set(&self, module_id: impl Into<String>, value: Value) {
        self.inner.values.lock().insert(module_id.into(), value);
    }

    pub fn get(&self, module_id: &str) -> Option<Value> {
        self.inner.values.lock().get(module_id).cloned()
    }

    /// Modify a stored value in place; starts from `null` when absent
    pub fn update<F>(&self, module_id: &str, f: F)
    where
        F: FnOnce(&mut Value),
    {
        let mut values = self.inner.values.lock();
        f(values.entry(module_id.to_string()).or_insert(Value::Null));
    }

    // ─────────────────────────────────────────────────────────────
    // Events
    // ─────────────────────────────────────────────────────────────

    pub fn subscribe(&self) -> broadcast::Receiver<ServiceEvent> {
        self.inner.events.subscribe()
    }

    pub(crate) fn emit(&self, event: ServiceEvent) {
        // No subscribers is fine
        let _ = self.inner.events.send(event);
    }

    fn audit(&self, request: &AclRequest<'_>, command: Option<&str>, error: Option<String>) {
        let record = AuditRecord {
            time: Utc::now(),
            action: request.action,
            origin: request.origin,
            module_id: request.module_id.to_string(),
            method: request.method,
            command: command.map(str::to_string),
            client_id: request
                .body
                .get("clientId")
                .and_then(Value::as_str)
                .map(str::to_string),
            body: request.body.clone(),
            error,
        };

        match &record.error {
            Some(error) => warn!(
                module_id = %record.module_id,
                command = ?record.command,
                client_id = ?record.client_id,
                error = %error,
                "Admin call denied"
            ),
            None => info!(
                module_id = %record.module_id,
                command = ?record.command,
                client_id = ?record.client_id,
                "Admin call"
            ),
        }
        self.emit(ServiceEvent::AdminLog(record));
    }
}

fn drives(schedule: &Schedule, agent: &AgentRef) -> bool {
    match schedule.kind {
        ScheduleKind::Pull => agent.is_master(),
        ScheduleKind::Push => !agent.is_master(),
    }
}

fn spawn_timer(
    module_id: String,
    module: Arc<dyn Module>,
    schedule: Schedule,
    agent: AgentRef,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(schedule.delay()).await;

        let mut ticker = tokio::time::interval(schedule.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            let result = match &agent {
                AgentRef::Master(master) => module.master_tick(master).await,
                AgentRef::Monitor(monitor) => module.monitor_tick(monitor).await,
            };
            if let Err(e) = result {
                warn!(module_id = %module_id, error = %e, "Scheduled run failed");
            }
        }
    })
}
