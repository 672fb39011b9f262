//! Monitor agent: one process's connection to the master
//!
//! Features:
//! - `register` handshake with a token from a [`TokenProvider`]
//! - Automatic reconnection with exponential backoff using `reconnect`
//! - Requests and notifies to the master's `master_handler`s
//! - Dispatch of the master's requests and relayed commands

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use backoff::{backoff::Backoff, ExponentialBackoff};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::channel::{await_handshake, ChannelEvent, ChannelHandle, Connector};
use crate::error::{Error, Result};
use crate::master::answer;
use crate::protocol::{
    compose, parse, Envelope, MonitorRegistration, RegisterRequest, ReqId, ServerInfo, Topic,
};
use crate::service::acl::Origin;
use crate::service::auth::TokenProvider;
use crate::service::{AgentRef, HandlerKind, ModuleTable, OrderedQueue, ServiceEvent};

type Completion = oneshot::Sender<Result<Value>>;

// ─────────────────────────────────────────────────────────────────
// Options
// ─────────────────────────────────────────────────────────────────

/// Identity and connection behavior of a monitor
#[derive(Debug, Clone)]
pub struct MonitorOptions {
    pub id: String,
    pub server_type: String,
    pub pid: Option<u32>,
    /// Sent to the master; `host` and `port` identify this instance
    pub info: ServerInfo,
    /// Reconnect after losing the master
    pub reconnect: bool,
    pub initial_reconnect_delay: Duration,
    pub max_reconnect_delay: Duration,
    /// 0 retries forever
    pub max_reconnect_attempts: u32,
    /// How long to wait for the master's handshake reply
    pub register_timeout: Duration,
}

impl MonitorOptions {
    pub fn new(id: impl Into<String>, server_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            server_type: server_type.into(),
            pid: Some(std::process::id()),
            info: ServerInfo::new(),
            reconnect: true,
            initial_reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(60),
            max_reconnect_attempts: 0,
            register_timeout: Duration::from_secs(30),
        }
    }
}

/// Lifecycle of the monitor agent
///
/// `Connected` also covers the window between losing the master and
/// completing a reconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MonitorPhase {
    Inited,
    Connected,
    Registered,
    Closed,
}

impl MonitorPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            MonitorPhase::Inited => "inited",
            MonitorPhase::Connected => "connected",
            MonitorPhase::Registered => "registered",
            MonitorPhase::Closed => "closed",
        }
    }
}

impl fmt::Display for MonitorPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─────────────────────────────────────────────────────────────────
// Agent
// ─────────────────────────────────────────────────────────────────

struct MonitorState {
    phase: MonitorPhase,
    channel: Option<ChannelHandle>,
    next_req_id: ReqId,
    completions: HashMap<ReqId, Completion>,
}

struct MonitorInner {
    options: MonitorOptions,
    state: Mutex<MonitorState>,
    modules: ModuleTable,
    tokens: Arc<dyn TokenProvider>,
    session: Mutex<Option<JoinHandle<()>>>,
}

/// The monitor side of the console
#[derive(Clone)]
pub struct MonitorAgent {
    inner: Arc<MonitorInner>,
}

impl fmt::Debug for MonitorAgent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MonitorAgent")
            .field("id", &self.inner.options.id)
            .field("phase", &self.phase())
            .finish()
    }
}

impl MonitorAgent {
    pub fn new(options: MonitorOptions, modules: ModuleTable, tokens: Arc<dyn TokenProvider>) -> Self {
        Self {
            inner: Arc::new(MonitorInner {
                options,
                state: Mutex::new(MonitorState {
                    phase: MonitorPhase::Inited,
                    channel: None,
                    next_req_id: 1,
                    completions: HashMap::new(),
                }),
                modules,
                tokens,
                session: Mutex::new(None),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.options.id
    }

    pub fn server_type(&self) -> &str {
        &self.inner.options.server_type
    }

    pub fn info(&self) -> &ServerInfo {
        &self.inner.options.info
    }

    pub fn phase(&self) -> MonitorPhase {
        self.inner.state.lock().phase
    }

    pub fn modules(&self) -> &ModuleTable {
        &self.inner.modules
    }

    pub fn set(&self, module_id: &str, value: Value) {
        self.inner.modules.set(module_id, value);
    }

    pub fn get(&self, module_id: &str) -> Option<Value> {
        self.inner.modules.get(module_id)
    }

    // ─────────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────────

    /// Connect and register with the master
    ///
    /// Resolves once the master accepted the registration. A rejection
    /// closes the agent for good; a transport failure leaves it `Inited`
    /// so the caller may try again.
    pub async fn connect<C: Connector>(&self, connector: C) -> Result<()> {
        match self.phase() {
            MonitorPhase::Inited => {}
            MonitorPhase::Closed => return Err(Error::AgentClosed),
            phase => {
                return Err(Error::Internal(format!(
                    "monitor agent already connected ({})",
                    phase
                )))
            }
        }

        info!(master = %connector.describe(), id = %self.id(), "Connecting to master");
        let channel = connector.connect().await?;
        let (handle, mut events) = channel.into_parts();
        self.set_phase(MonitorPhase::Connected);

        let registration = self.registration().await;
        let handshake = match handle.send(Topic::Register, &registration) {
            Ok(()) => {
                await_handshake(&mut events, Topic::Register, self.inner.options.register_timeout).await
            }
            Err(e) => Err(e),
        };

        let reply = match handshake {
            Ok(reply) => reply,
            Err(e) => {
                handle.disconnect("registration incomplete");
                self.set_phase(MonitorPhase::Inited);
                return Err(e);
            }
        };

        if !reply.code.is_ok() {
            error!(id = %self.id(), reason = %reply.msg, "Master rejected registration");
            handle.disconnect("registration rejected");
            self.close();
            return Err(Error::auth_failed(reply.msg));
        }

        {
            let mut state = self.inner.state.lock();
            if state.phase == MonitorPhase::Closed {
                drop(state);
                handle.disconnect("monitor closed");
                return Err(Error::AgentClosed);
            }
            state.phase = MonitorPhase::Registered;
            state.channel = Some(handle);
        }
        info!(id = %self.id(), server_type = %self.server_type(), "Registered with master");

        let session = tokio::spawn(self.clone().run_session(Arc::new(connector), events));
        *self.inner.session.lock() = Some(session);
        Ok(())
    }

    /// Disconnect and fail every outstanding request
    pub fn close(&self) {
        let (channel, completions) = {
            let mut state = self.inner.state.lock();
            if state.phase == MonitorPhase::Closed {
                return;
            }
            state.phase = MonitorPhase::Closed;
            let completions: Vec<_> = state.completions.drain().map(|(_, c)| c).collect();
            (state.channel.take(), completions)
        };

        if let Some(session) = self.inner.session.lock().take() {
            session.abort();
        }
        if let Some(channel) = channel {
            channel.disconnect("monitor closed");
        }
        for completion in completions {
            let _ = completion.send(Err(Error::AgentClosed));
        }

        info!(id = %self.id(), "Monitor agent closed");
        self.inner.modules.emit(ServiceEvent::Close);
    }

    fn set_phase(&self, phase: MonitorPhase) {
        let mut state = self.inner.state.lock();
        if state.phase != MonitorPhase::Closed {
            state.phase = phase;
        }
    }

    async fn registration(&self) -> RegisterRequest {
        let options = &self.inner.options;
        let token = self.inner.tokens.token(&options.id, &options.server_type).await;
        RegisterRequest::Monitor(MonitorRegistration {
            id: options.id.clone(),
            server_type: options.server_type.clone(),
            pid: options.pid,
            info: options.info.clone(),
            token,
        })
    }

    // ─────────────────────────────────────────────────────────────
    // Outbound
    // ─────────────────────────────────────────────────────────────

    /// Send a request to the master's `master_handler` of `module_id`
    pub async fn request(&self, module_id: &str, body: Value) -> Result<Value> {
        let rx = {
            let mut state = self.inner.state.lock();
            let channel = registered_channel(&state, "request")?;
            let req_id = state.next_req_id;
            state.next_req_id += 1;

            channel.send(Topic::Monitor, &compose(Some(req_id), module_id, body))?;
            let (tx, rx) = oneshot::channel();
            state.completions.insert(req_id, tx);
            rx
        };
        rx.await.map_err(|_| Error::AgentClosed)?
    }

    /// Fire-and-forget message to the master's `master_handler` of `module_id`
    pub fn notify(&self, module_id: &str, body: Value) -> Result<()> {
        let state = self.inner.state.lock();
        let channel = registered_channel(&state, "notify")?;
        channel.send(Topic::Monitor, &compose(None, module_id, body))
    }

    // ─────────────────────────────────────────────────────────────
    // Session
    // ─────────────────────────────────────────────────────────────

    async fn run_session(
        self,
        connector: Arc<dyn Connector>,
        mut events: mpsc::UnboundedReceiver<ChannelEvent>,
    ) {
        let ordered = OrderedQueue::spawn();
        loop {
            let reason = self.serve(&mut events, &ordered).await;
            if !self.connection_lost(&reason) {
                break;
            }

            if !self.inner.options.reconnect {
                warn!(id = %self.id(), "Reconnect disabled, closing");
                self.close();
                break;
            }

            match self.reconnect(connector.as_ref()).await {
                Some(next) => events = next,
                None => {
                    self.close();
                    break;
                }
            }
        }
        debug!(id = %self.id(), "Monitor session ended");
    }

    /// Handle traffic until the channel closes; returns the close reason
    async fn serve(
        &self,
        events: &mut mpsc::UnboundedReceiver<ChannelEvent>,
        ordered: &OrderedQueue,
    ) -> String {
        while let Some(event) = events.recv().await {
            match event {
                ChannelEvent::Message(frame) if frame.event == Topic::Monitor => {
                    self.on_monitor(&frame.data, ordered)
                }
                ChannelEvent::Message(frame) => {
                    debug!(topic = %frame.event, "Ignoring frame on foreign topic");
                }
                ChannelEvent::Closed { reason } => return reason,
            }
        }
        "event stream ended".to_string()
    }

    /// Returns false when the agent is closed and the session should end
    fn connection_lost(&self, reason: &str) -> bool {
        let completions = {
            let mut state = self.inner.state.lock();
            if state.phase == MonitorPhase::Closed {
                return false;
            }
            state.phase = MonitorPhase::Connected;
            state.channel = None;
            state.completions.drain().map(|(_, c)| c).collect::<Vec<_>>()
        };

        warn!(id = %self.id(), reason = %reason, pending = completions.len(), "Lost connection to master");
        for completion in completions {
            let _ = completion.send(Err(Error::ConnectionLost {
                message: reason.to_string(),
            }));
        }
        self.inner.modules.emit(ServiceEvent::Error {
            message: format!("connection to master lost: {}", reason),
        });
        true
    }

    /// Retry with backoff until a reconnect is accepted or attempts run out
    async fn reconnect(
        &self,
        connector: &dyn Connector,
    ) -> Option<mpsc::UnboundedReceiver<ChannelEvent>> {
        let options = &self.inner.options;
        let mut backoff = ExponentialBackoff {
            initial_interval: options.initial_reconnect_delay,
            max_interval: options.max_reconnect_delay,
            max_elapsed_time: None,
            ..Default::default()
        };

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            if options.max_reconnect_attempts > 0 && attempt > options.max_reconnect_attempts {
                error!(
                    attempts = attempt - 1,
                    max = options.max_reconnect_attempts,
                    "Max reconnection attempts reached"
                );
                return None;
            }

            let delay = backoff.next_backoff().unwrap_or(options.max_reconnect_delay);
            info!(delay_ms = delay.as_millis() as u64, attempt, "Waiting before reconnection");
            tokio::time::sleep(delay).await;

            if self.phase() == MonitorPhase::Closed {
                return None;
            }
            match self.try_reconnect(connector).await {
                Ok(events) => return Some(events),
                Err(e) => warn!(attempt, error = %e, "Reconnect attempt failed"),
            }
        }
    }

    async fn try_reconnect(
        &self,
        connector: &dyn Connector,
    ) -> Result<mpsc::UnboundedReceiver<ChannelEvent>> {
        let (handle, mut events) = connector.connect().await?.into_parts();

        let registration = self.registration().await;
        let handshake = match handle.send(Topic::Reconnect, &registration) {
            Ok(()) => {
                await_handshake(&mut events, Topic::ReconnectOk, self.inner.options.register_timeout)
                    .await
            }
            Err(e) => Err(e),
        };
        let reply = match handshake {
            Ok(reply) => reply,
            Err(e) => {
                handle.disconnect("reconnect incomplete");
                return Err(e);
            }
        };
        if !reply.code.is_ok() {
            handle.disconnect("reconnect rejected");
            return Err(Error::auth_failed(reply.msg));
        }

        {
            let mut state = self.inner.state.lock();
            if state.phase == MonitorPhase::Closed {
                drop(state);
                handle.disconnect("monitor closed");
                return Err(Error::AgentClosed);
            }
            state.phase = MonitorPhase::Registered;
            state.channel = Some(handle);
        }
        info!(id = %self.id(), "Reconnected to master");
        Ok(events)
    }

    // ─────────────────────────────────────────────────────────────
    // Inbound
    // ─────────────────────────────────────────────────────────────

    /// Requests run concurrently; notifies and commands run in arrival order
    fn on_monitor(&self, data: &Value, ordered: &OrderedQueue) {
        let envelope = match parse(data) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, "Dropping malformed message from master");
                return;
            }
        };
        if self.phase() != MonitorPhase::Registered {
            debug!("Dropping message received before registration");
            return;
        }

        match envelope {
            Envelope::Response { resp_id, error, body } => {
                let completion = self.inner.state.lock().completions.remove(&resp_id);
                match completion {
                    Some(completion) => {
                        let result = match error {
                            Some(error) => Err(error.into()),
                            None => Ok(body),
                        };
                        let _ = completion.send(result);
                    }
                    None => warn!(resp_id, "Dropping response to unknown request"),
                }
            }
            Envelope::Request { .. } => {
                tokio::spawn(self.clone().dispatch(envelope));
            }
            Envelope::Notify { .. } => ordered.push(self.clone().dispatch(envelope)),
            Envelope::Command { .. } => ordered.push(self.clone().dispatch_command(envelope)),
        }
    }

    async fn dispatch(self, envelope: Envelope) {
        let module_id = envelope.module_id().unwrap_or_default().to_string();
        let result = self
            .modules()
            .execute(
                &AgentRef::Monitor(self.clone()),
                &module_id,
                HandlerKind::MonitorHandler,
                envelope.body().clone(),
                Origin::Peer,
            )
            .await;
        self.answer(&envelope, result);
    }

    async fn dispatch_command(self, envelope: Envelope) {
        let Envelope::Command { command, module_id, body, .. } = &envelope else {
            return;
        };
        let result = self
            .modules()
            .command(
                &AgentRef::Monitor(self.clone()),
                command,
                module_id,
                body.clone(),
                Origin::Peer,
            )
            .await;
        self.answer(&envelope, result);
    }

    /// Reply on whichever channel is current when the handler finishes
    fn answer(&self, original: &Envelope, result: Result<Value>) {
        let channel = self.inner.state.lock().channel.clone();
        match channel {
            Some(channel) => answer(&channel, Topic::Monitor, original, result),
            None if original.is_request() => {
                debug!(req_id = ?original.req_id(), "No connection for response, master will resend");
            }
            None => {}
        }
    }
}

fn registered_channel(state: &MonitorState, operation: &str) -> Result<ChannelHandle> {
    match (&state.channel, state.phase) {
        (Some(channel), MonitorPhase::Registered) => Ok(channel.clone()),
        _ => Err(Error::NotRegistered {
            operation: operation.to_string(),
            state: state.phase.to_string(),
        }),
    }
}
