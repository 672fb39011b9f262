//! Shared fixtures for the end-to-end suites
//!
//! Everything runs over the in-memory transport unless a test wires up
//! WebSocket itself.

#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::mpsc::UnboundedReceiver;

use fleet_console::channel::memory::{self, MemoryConnector};
use fleet_console::channel::{Channel, ChannelEvent, ChannelHandle, Connector};
use fleet_console::client::{AdminClient, ClientCredentials};
use fleet_console::config::AdminUserEntry;
use fleet_console::error::{Error, Result};
use fleet_console::master::{MasterAgent, MasterOptions};
use fleet_console::monitor::{MonitorAgent, MonitorOptions};
use fleet_console::protocol::{
    parse, Envelope, MonitorRegistration, RegisterReply, RegisterRequest, ServerInfo, Topic,
};
use fleet_console::service::auth::{SharedToken, StaticUsers};
use fleet_console::service::{ConsoleService, HandlerSet, Module};

pub const TOKEN: &str = "fleet-secret";
pub const ECHO: &str = "echo";
const WAIT: Duration = Duration::from_secs(5);

// ─────────────────────────────────────────────────────────────────
// Recorder module
// ─────────────────────────────────────────────────────────────────

/// Records every call and echoes it back
///
/// A body with `"fail": true` makes the handler return an error.
#[derive(Clone, Default)]
pub struct Recorder {
    calls: Arc<Mutex<Vec<Value>>>,
}

impl Recorder {
    pub fn calls(&self) -> Vec<Value> {
        self.calls.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.calls.lock().len()
    }

    fn record(&self, body: &Value) -> Result<()> {
        self.calls.lock().push(body.clone());
        if body.get("fail").and_then(Value::as_bool) == Some(true) {
            return Err(Error::handler("asked to fail"));
        }
        Ok(())
    }
}

#[async_trait]
impl Module for Recorder {
    fn handlers(&self) -> HandlerSet {
        HandlerSet::all()
    }

    async fn monitor_handler(&self, agent: &MonitorAgent, body: Value) -> Result<Value> {
        self.record(&body)?;
        Ok(json!({ "server": agent.id(), "port": agent.info().get("port"), "body": body }))
    }

    async fn master_handler(&self, _agent: &MasterAgent, body: Value) -> Result<Value> {
        self.record(&body)?;
        Ok(json!({ "ack": true }))
    }

    async fn client_handler(&self, agent: &MasterAgent, body: Value) -> Result<Value> {
        self.record(&body)?;
        Ok(json!({ "servers": agent.server_ids() }))
    }
}

// ─────────────────────────────────────────────────────────────────
// Master / monitor fixtures
// ─────────────────────────────────────────────────────────────────

pub fn admin_users() -> Vec<AdminUserEntry> {
    vec![
        AdminUserEntry {
            username: "admin".to_string(),
            password: "admin-pw".to_string(),
            level: 1,
        },
        AdminUserEntry {
            username: "viewer".to_string(),
            password: "viewer-pw".to_string(),
            level: 2,
        },
    ]
}

pub struct TestMaster {
    pub service: ConsoleService,
    pub connector: MemoryConnector,
    pub recorder: Recorder,
}

impl TestMaster {
    pub fn agent(&self) -> &MasterAgent {
        self.service.master_agent().unwrap()
    }
}

/// Master with the echo module, listening on a fresh memory transport
pub fn start_master(options: MasterOptions) -> TestMaster {
    start_master_with(options, |_| {})
}

/// Like [`start_master`], with extra registrations before `listen`
pub fn start_master_with<F>(options: MasterOptions, setup: F) -> TestMaster
where
    F: FnOnce(&ConsoleService),
{
    let (acceptor, connector) = memory::transport();
    let service = ConsoleService::master(
        options,
        Arc::new(StaticUsers::new(admin_users())),
        Arc::new(SharedToken::new(Some(TOKEN.to_string()))),
    );
    let recorder = Recorder::default();
    service.register(ECHO, recorder.clone());
    setup(&service);
    service.listen(acceptor).unwrap();

    TestMaster {
        service,
        connector,
        recorder,
    }
}

pub fn instance_info(port: u16) -> ServerInfo {
    let mut info = ServerInfo::new();
    info.insert("host".into(), json!("127.0.0.1"));
    info.insert("port".into(), json!(port));
    info
}

/// Monitor options with quick reconnects
pub fn monitor_options(id: &str, server_type: &str, port: u16) -> MonitorOptions {
    let mut options = MonitorOptions::new(id, server_type);
    options.info = instance_info(port);
    options.initial_reconnect_delay = Duration::from_millis(20);
    options.max_reconnect_delay = Duration::from_millis(200);
    options.register_timeout = Duration::from_secs(2);
    options
}

pub struct TestMonitor {
    pub service: ConsoleService,
    pub recorder: Recorder,
}

impl TestMonitor {
    pub fn agent(&self) -> &MonitorAgent {
        self.service.monitor_agent().unwrap()
    }
}

/// Monitor with the echo module, registered through `connector`
pub async fn start_monitor<C: Connector>(
    connector: C,
    options: MonitorOptions,
    token: Option<&str>,
) -> Result<TestMonitor> {
    let service = ConsoleService::monitor(options, Arc::new(SharedToken::new(token.map(String::from))));
    let recorder = Recorder::default();
    service.register(ECHO, recorder.clone());
    service.connect(connector).await?;
    Ok(TestMonitor { service, recorder })
}

pub async fn login(connector: MemoryConnector, id: &str, username: &str, password: &str) -> Result<AdminClient> {
    AdminClient::connect(
        connector,
        id,
        ClientCredentials::new(username, password),
        Duration::from_secs(2),
    )
    .await
}

// ─────────────────────────────────────────────────────────────────
// Raw peers
// ─────────────────────────────────────────────────────────────────

/// A monitor driven frame by frame
pub struct RawMonitor {
    pub handle: ChannelHandle,
    pub events: UnboundedReceiver<ChannelEvent>,
}

impl RawMonitor {
    /// Open a channel and send `register` or `reconnect`; returns the reply
    pub async fn handshake(
        connector: &MemoryConnector,
        topic: Topic,
        id: &str,
        port: u16,
    ) -> (Self, RegisterReply) {
        let Channel { handle, events } = connector.connect().await.unwrap();
        let mut raw = Self { handle, events };

        let registration = RegisterRequest::Monitor(MonitorRegistration {
            id: id.to_string(),
            server_type: "raw".to_string(),
            pid: None,
            info: instance_info(port),
            token: Some(TOKEN.to_string()),
        });
        raw.handle.send(topic, &registration).unwrap();

        let reply_topic = match topic {
            Topic::Reconnect => Topic::ReconnectOk,
            _ => Topic::Register,
        };
        let frame = raw.next_frame().await.expect("handshake reply");
        assert_eq!(frame.0, reply_topic);
        let reply: RegisterReply = serde_json::from_value(frame.1).unwrap();
        (raw, reply)
    }

    /// Next frame as (topic, payload), or `None` once closed
    pub async fn next_frame(&mut self) -> Option<(Topic, Value)> {
        let event = tokio::time::timeout(WAIT, self.events.recv())
            .await
            .expect("timed out waiting for a frame")?;
        match event {
            ChannelEvent::Message(frame) => Some((frame.event, frame.data.clone())),
            ChannelEvent::Closed { .. } => None,
        }
    }

    /// Next envelope on the `monitor` topic
    pub async fn next_envelope(&mut self) -> Envelope {
        loop {
            match self.next_frame().await {
                Some((Topic::Monitor, data)) => return parse(&data).unwrap(),
                Some(_) => continue,
                None => panic!("channel closed while waiting for an envelope"),
            }
        }
    }

    pub fn respond(&self, resp_id: u64, body: Value) {
        self.handle
            .send(Topic::Monitor, &json!({ "respId": resp_id, "body": body }))
            .unwrap();
    }
}

// ─────────────────────────────────────────────────────────────────
// Waiting
// ─────────────────────────────────────────────────────────────────

/// Poll `condition` until it holds; panics after a few seconds
pub async fn wait_until<F>(what: &str, mut condition: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + WAIT;
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Await `future` with the shared timeout
pub async fn within<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(WAIT, future)
        .await
        .expect("operation timed out")
}
