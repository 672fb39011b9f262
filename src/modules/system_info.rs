//! `systemInfo`: host facts pulled from every monitor
//!
//! The master's timer broadcasts an empty notify to all primaries. Each
//! monitor answers with a notify of its own carrying
//! `{serverId, body: HostFacts}`, which the master folds into a map keyed by
//! server id. Admin clients read that map through the client handler.

use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::master::MasterAgent;
use crate::monitor::MonitorAgent;
use crate::service::{HandlerSet, Module, Schedule};

pub const SYSTEM_INFO_MODULE_ID: &str = "systemInfo";

const DEFAULT_DELAY_SECS: f64 = 10.0;
const DEFAULT_INTERVAL_SECS: f64 = 300.0;

/// What a monitor reports about its host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostFacts {
    pub hostname: String,
    pub cpus: usize,
    pub pid: u32,
    pub uptime_secs: u64,
    pub os: String,
    pub arch: String,
    pub collected_at: chrono::DateTime<chrono::Utc>,
}

impl HostFacts {
    fn collect(started: Instant) -> Self {
        let hostname = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown".to_string());

        Self {
            hostname,
            cpus: num_cpus::get(),
            pid: std::process::id(),
            uptime_secs: started.elapsed().as_secs(),
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            collected_at: chrono::Utc::now(),
        }
    }
}

pub struct SystemInfo {
    schedule: Schedule,
    started: Instant,
}

impl Default for SystemInfo {
    fn default() -> Self {
        Self::with_schedule(Schedule::pull(DEFAULT_DELAY_SECS, DEFAULT_INTERVAL_SECS))
    }
}

impl SystemInfo {
    pub fn with_schedule(schedule: Schedule) -> Self {
        Self {
            schedule,
            started: Instant::now(),
        }
    }
}

#[async_trait]
impl Module for SystemInfo {
    fn handlers(&self) -> HandlerSet {
        HandlerSet::all()
    }

    fn schedule(&self) -> Option<Schedule> {
        Some(self.schedule)
    }

    async fn monitor_handler(&self, agent: &MonitorAgent, _body: Value) -> Result<Value> {
        let facts = HostFacts::collect(self.started);
        debug!(server_id = %agent.id(), cpus = facts.cpus, "Reporting host facts");
        agent.notify(
            SYSTEM_INFO_MODULE_ID,
            json!({ "serverId": agent.id(), "body": facts }),
        )?;
        Ok(Value::Null)
    }

    /// Ask every monitor to report
    async fn master_tick(&self, agent: &MasterAgent) -> Result<()> {
        if !agent.notify_all(SYSTEM_INFO_MODULE_ID, Value::Null) {
            debug!("No monitors registered for systemInfo");
        }
        Ok(())
    }

    async fn master_handler(&self, agent: &MasterAgent, body: Value) -> Result<Value> {
        let Some(server_id) = body.get("serverId").and_then(Value::as_str) else {
            warn!(body = %body, "systemInfo report without serverId");
            return Err(Error::handler("systemInfo report without serverId"));
        };
        let report = body.get("body").cloned().unwrap_or(Value::Null);
        let server_id = server_id.to_string();

        agent.update(SYSTEM_INFO_MODULE_ID, move |stored| {
            if !stored.is_object() {
                *stored = Value::Object(Map::new());
            }
            if let Some(map) = stored.as_object_mut() {
                map.insert(server_id, report);
            }
        });
        Ok(Value::Null)
    }

    async fn client_handler(&self, agent: &MasterAgent, _body: Value) -> Result<Value> {
        Ok(agent
            .get(SYSTEM_INFO_MODULE_ID)
            .unwrap_or_else(|| Value::Object(Map::new())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::master::MasterOptions;
    use crate::service::auth::{SharedToken, StaticUsers};
    use crate::service::{HandlerKind, ModuleTable};
    use std::sync::Arc;

    fn master() -> MasterAgent {
        MasterAgent::new(
            MasterOptions::default(),
            ModuleTable::new(),
            Arc::new(StaticUsers::new(Vec::new())),
            Arc::new(SharedToken::new(None)),
        )
    }

    #[test]
    fn test_default_schedule_is_pull() {
        let module = SystemInfo::default();
        let schedule = module.schedule().unwrap();
        assert_eq!(schedule.kind, crate::service::ScheduleKind::Pull);
        assert_eq!(schedule.interval().as_secs(), 300);
        assert_eq!(schedule.delay().as_secs(), 10);
        assert!(module.handlers().contains(HandlerKind::ClientHandler));
    }

    #[test]
    fn test_host_facts_shape() {
        let facts = HostFacts::collect(Instant::now());
        assert!(facts.cpus >= 1);
        assert_eq!(facts.pid, std::process::id());

        let json = serde_json::to_value(&facts).unwrap();
        assert!(json.get("uptimeSecs").is_some());
        assert!(json.get("collectedAt").is_some());
    }

    #[tokio::test]
    async fn test_report_without_server_id_is_rejected() {
        let agent = master();
        let module = SystemInfo::default();

        assert!(module.master_handler(&agent, Value::Null).await.is_err());
        assert!(module.master_handler(&agent, json!({ "body": {} })).await.is_err());
        assert!(agent.get(SYSTEM_INFO_MODULE_ID).is_none());

        module
            .master_handler(&agent, json!({ "serverId": "area-1", "body": { "cpus": 4 } }))
            .await
            .unwrap();
        assert_eq!(agent.get(SYSTEM_INFO_MODULE_ID).unwrap()["area-1"]["cpus"], 4);
    }

    #[tokio::test]
    async fn test_tick_with_no_monitors_is_quiet() {
        let agent = master();
        SystemInfo::default().master_tick(&agent).await.unwrap();
        assert!(agent.get(SYSTEM_INFO_MODULE_ID).is_none());
    }
}
