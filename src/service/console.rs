//! Role facade over the master and monitor agents

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::broadcast;
use tracing::info;

use super::auth::{ServerAuthenticator, SharedToken, StaticUsers, TokenProvider, UserAuthenticator};
use super::module::{AgentRef, HandlerKind, Module};
use super::table::ModuleTable;
use super::{Origin, ServiceEvent};
use crate::channel::{Acceptor, Connector};
use crate::config::{ConsoleConfig, MasterSettings, MonitorSettings};
use crate::error::{Error, Result};
use crate::master::{MasterAgent, MasterOptions};
use crate::monitor::{MonitorAgent, MonitorOptions};
use crate::protocol::ServerInfo;

/// Which agent a service runs
#[derive(Debug, Clone)]
pub enum Role {
    Master(MasterAgent),
    Monitor(MonitorAgent),
}

/// One console per process: a module table plus its agent
#[derive(Debug, Clone)]
pub struct ConsoleService {
    role: Role,
    modules: ModuleTable,
}

impl ConsoleService {
    pub fn master(
        options: MasterOptions,
        user_auth: Arc<dyn UserAuthenticator>,
        server_auth: Arc<dyn ServerAuthenticator>,
    ) -> Self {
        Self::master_with_table(options, ModuleTable::new(), user_auth, server_auth)
    }

    fn master_with_table(
        options: MasterOptions,
        modules: ModuleTable,
        user_auth: Arc<dyn UserAuthenticator>,
        server_auth: Arc<dyn ServerAuthenticator>,
    ) -> Self {
        let agent = MasterAgent::new(options, modules.clone(), user_auth, server_auth);
        Self {
            role: Role::Master(agent),
            modules,
        }
    }

    pub fn monitor(options: MonitorOptions, tokens: Arc<dyn TokenProvider>) -> Self {
        let modules = ModuleTable::new();
        let agent = MonitorAgent::new(options, modules.clone(), tokens);
        Self {
            role: Role::Monitor(agent),
            modules,
        }
    }

    /// Master with config-backed authentication
    pub fn master_from_config(config: &ConsoleConfig) -> Self {
        Self::master_with_table(
            master_options(&config.master),
            ModuleTable::with_event_capacity(config.master.event_capacity),
            Arc::new(StaticUsers::from_settings(&config.auth)),
            Arc::new(SharedToken::from_settings(&config.auth)),
        )
    }

    /// Monitor presenting the configured server token
    pub fn monitor_from_config(config: &ConsoleConfig) -> Self {
        Self::monitor(
            monitor_options(&config.monitor),
            Arc::new(SharedToken::from_settings(&config.auth)),
        )
    }

    pub fn role(&self) -> &Role {
        &self.role
    }

    pub fn is_master(&self) -> bool {
        matches!(self.role, Role::Master(_))
    }

    pub fn agent(&self) -> AgentRef {
        match &self.role {
            Role::Master(agent) => AgentRef::Master(agent.clone()),
            Role::Monitor(agent) => AgentRef::Monitor(agent.clone()),
        }
    }

    pub fn master_agent(&self) -> Option<&MasterAgent> {
        match &self.role {
            Role::Master(agent) => Some(agent),
            Role::Monitor(_) => None,
        }
    }

    pub fn monitor_agent(&self) -> Option<&MonitorAgent> {
        match &self.role {
            Role::Monitor(agent) => Some(agent),
            Role::Master(_) => None,
        }
    }

    pub fn modules(&self) -> &ModuleTable {
        &self.modules
    }

    // ─────────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────────

    /// Start the master on `acceptor` and enable every module
    pub fn listen<A: Acceptor>(&self, acceptor: A) -> Result<Option<SocketAddr>> {
        let Role::Master(agent) = &self.role else {
            return Err(Error::Internal("listen requires a master console".to_string()));
        };
        let addr = agent.listen(acceptor)?;
        self.modules.enable_all(&self.agent());
        Ok(addr)
    }

    /// Register the monitor through `connector` and enable every module
    pub async fn connect<C: Connector>(&self, connector: C) -> Result<()> {
        let Role::Monitor(agent) = &self.role else {
            return Err(Error::Internal("connect requires a monitor console".to_string()));
        };
        agent.connect(connector).await?;
        self.modules.enable_all(&self.agent());
        Ok(())
    }

    /// Disable every module and close the agent
    pub fn stop(&self) {
        self.modules.disable_all();
        match &self.role {
            Role::Master(agent) => agent.close(),
            Role::Monitor(agent) => agent.close(),
        }
        info!("Console stopped");
    }

    // ─────────────────────────────────────────────────────────────
    // Modules
    // ─────────────────────────────────────────────────────────────

    pub fn register<M: Module>(&self, module_id: impl Into<String>, module: M) {
        self.modules.register(module_id, Arc::new(module));
    }

    pub fn register_shared(&self, module_id: impl Into<String>, module: Arc<dyn Module>) {
        self.modules.register(module_id, module);
    }

    pub fn enable(&self, module_id: &str) -> bool {
        self.modules.enable(module_id, &self.agent())
    }

    pub fn disable(&self, module_id: &str) -> bool {
        self.modules.disable(module_id)
    }

    /// Invoke a handler from inside this process
    pub async fn execute(&self, module_id: &str, kind: HandlerKind, body: Value) -> Result<Value> {
        self.modules
            .execute(&self.agent(), module_id, kind, body, Origin::Local)
            .await
    }

    /// Run an administrative command from inside this process
    pub async fn command(&self, command: &str, module_id: &str, body: Value) -> Result<Value> {
        self.modules
            .command(&self.agent(), command, module_id, body, Origin::Local)
            .await
    }

    pub fn set(&self, module_id: &str, value: Value) {
        self.modules.set(module_id, value);
    }

    pub fn get(&self, module_id: &str) -> Option<Value> {
        self.modules.get(module_id)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServiceEvent> {
        self.modules.subscribe()
    }
}

/// Master options from the `[master]` section
pub fn master_options(settings: &MasterSettings) -> MasterOptions {
    MasterOptions {
        env: settings.env.clone(),
        trust_reconnect: settings.trust_reconnect,
        redelivery_limit: settings.redelivery_limit,
    }
}

/// Monitor options from the `[monitor]` section
pub fn monitor_options(settings: &MonitorSettings) -> MonitorOptions {
    let mut info = ServerInfo::new();
    info.insert("host".into(), Value::from(settings.host.clone()));
    info.insert("port".into(), Value::from(settings.port));
    info.insert("serverType".into(), Value::from(settings.server_type.clone()));

    MonitorOptions {
        id: settings.id.clone(),
        server_type: settings.server_type.clone(),
        pid: Some(std::process::id()),
        info,
        reconnect: settings.reconnect,
        initial_reconnect_delay: Duration::from_millis(settings.reconnect_interval_ms),
        max_reconnect_delay: Duration::from_millis(settings.max_reconnect_delay_ms),
        max_reconnect_attempts: settings.max_reconnect_attempts,
        register_timeout: Duration::from_millis(settings.register_timeout_ms),
    }
}
