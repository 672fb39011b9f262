//! Master agent: registry owner and request router
//!
//! One mutex guards the registry, the pending table and the agent phase.
//! Sends are non-blocking queue pushes, so they happen under that lock;
//! this keeps a registration's OK reply and its replayed requests ahead of
//! any request issued after the registration became visible.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::connection::MasterConnection;
use super::pending::{OutboundRequest, PendingTable};
use super::registry::{ConnectionRecord, ConnectionRegistry, PeerKind, Placement};
use crate::channel::{Acceptor, Channel, ChannelHandle, ChannelId};
use crate::error::{Error, Result};
use crate::protocol::{
    compose, compose_command, ClientRegistration, Envelope, Frame, MonitorRegistration,
    RegisterReply, RemoteError, ReqId, ServerInfo, Topic, TYPE_CLIENT,
};
use crate::service::auth::{ServerAuthStatus, ServerAuthenticator, UserAuthenticator};
use crate::service::{ModuleTable, ServiceEvent};

/// Default cap on outstanding requests kept per target
pub const DEFAULT_REDELIVERY_LIMIT: usize = 1024;

// ─────────────────────────────────────────────────────────────────
// Options
// ─────────────────────────────────────────────────────────────────

/// Master agent behavior
#[derive(Debug, Clone)]
pub struct MasterOptions {
    /// Deployment environment handed to the authenticators
    pub env: String,
    /// Accept `reconnect` without re-running server authentication
    pub trust_reconnect: bool,
    /// Outstanding requests kept per target; 0 keeps all of them
    pub redelivery_limit: usize,
}

impl Default for MasterOptions {
    fn default() -> Self {
        Self {
            env: "development".to_string(),
            trust_reconnect: true,
            redelivery_limit: DEFAULT_REDELIVERY_LIMIT,
        }
    }
}

/// Lifecycle of the master agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MasterPhase {
    Inited,
    Started,
    Closed,
}

/// How a monitor is asking to be admitted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Admission {
    Register,
    Reconnect,
}

impl Admission {
    pub(crate) fn reply_topic(&self) -> Topic {
        match self {
            Admission::Register => Topic::Register,
            Admission::Reconnect => Topic::ReconnectOk,
        }
    }
}

/// Public view of a registered peer
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerSummary {
    pub id: String,
    pub server_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub info: ServerInfo,
}

impl From<&ConnectionRecord> for PeerSummary {
    fn from(record: &ConnectionRecord) -> Self {
        Self {
            id: record.id.clone(),
            server_type: record.server_type.clone(),
            pid: record.pid,
            info: record.info.clone(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Agent
// ─────────────────────────────────────────────────────────────────

struct MasterState {
    phase: MasterPhase,
    registry: ConnectionRegistry,
    pending: PendingTable,
    /// Every live accepted channel, registered or not
    channels: HashMap<ChannelId, ChannelHandle>,
}

struct MasterInner {
    options: MasterOptions,
    state: Mutex<MasterState>,
    modules: ModuleTable,
    user_auth: Arc<dyn UserAuthenticator>,
    server_auth: Arc<dyn ServerAuthenticator>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

/// The master side of the console
///
/// Cheap to clone; all clones share one registry.
#[derive(Clone)]
pub struct MasterAgent {
    inner: Arc<MasterInner>,
}

impl fmt::Debug for MasterAgent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("MasterAgent")
            .field("phase", &state.phase)
            .field("monitors", &state.registry.monitor_count())
            .field("clients", &state.registry.client_count())
            .finish()
    }
}

impl MasterAgent {
    pub fn new(
        options: MasterOptions,
        modules: ModuleTable,
        user_auth: Arc<dyn UserAuthenticator>,
        server_auth: Arc<dyn ServerAuthenticator>,
    ) -> Self {
        let pending = PendingTable::new(options.redelivery_limit);
        Self {
            inner: Arc::new(MasterInner {
                options,
                state: Mutex::new(MasterState {
                    phase: MasterPhase::Inited,
                    registry: ConnectionRegistry::new(),
                    pending,
                    channels: HashMap::new(),
                }),
                modules,
                user_auth,
                server_auth,
                accept_task: Mutex::new(None),
            }),
        }
    }

    pub fn phase(&self) -> MasterPhase {
        self.inner.state.lock().phase
    }

    pub fn options(&self) -> &MasterOptions {
        &self.inner.options
    }

    pub fn modules(&self) -> &ModuleTable {
        &self.inner.modules
    }

    // ─────────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────────

    /// Start accepting connections from `acceptor`
    ///
    /// Returns the acceptor's bound address, if it has one.
    pub fn listen<A: Acceptor>(&self, mut acceptor: A) -> Result<Option<SocketAddr>> {
        {
            let mut state = self.inner.state.lock();
            match state.phase {
                MasterPhase::Inited => state.phase = MasterPhase::Started,
                MasterPhase::Started => {
                    return Err(Error::Internal("master agent already started".to_string()))
                }
                MasterPhase::Closed => return Err(Error::AgentClosed),
            }
        }

        let addr = acceptor.local_addr();
        let agent = self.clone();
        let task = tokio::spawn(async move {
            while let Some(channel) = acceptor.accept().await {
                agent.attach(channel);
            }
            debug!("Acceptor finished");
        });
        *self.inner.accept_task.lock() = Some(task);

        info!(addr = ?addr, "Master agent listening");
        Ok(addr)
    }

    /// Serve one already-established channel
    pub fn attach(&self, channel: Channel) {
        let (handle, events) = channel.into_parts();
        {
            let mut state = self.inner.state.lock();
            if state.phase == MasterPhase::Closed {
                drop(state);
                handle.disconnect("master closed");
                return;
            }
            state.channels.insert(handle.id(), handle.clone());
        }

        debug!(channel_id = handle.id(), peer = ?handle.peer(), "Accepted channel");
        let connection = MasterConnection::new(self.clone(), handle);
        tokio::spawn(connection.run(events));
    }

    /// Stop listening, drop every connection and fail every pending request
    pub fn close(&self) {
        let (completions, channels) = {
            let mut state = self.inner.state.lock();
            if state.phase == MasterPhase::Closed {
                return;
            }
            state.phase = MasterPhase::Closed;
            state.registry = ConnectionRegistry::new();
            let channels: Vec<_> = state.channels.drain().map(|(_, c)| c).collect();
            (state.pending.drain(), channels)
        };

        if let Some(task) = self.inner.accept_task.lock().take() {
            task.abort();
        }
        for channel in channels {
            channel.disconnect("master closed");
        }
        for completion in completions {
            let _ = completion.send(Err(Error::AgentClosed));
        }

        info!("Master agent closed");
        self.inner.modules.emit(ServiceEvent::Close);
    }

    // ─────────────────────────────────────────────────────────────
    // Requests
    // ─────────────────────────────────────────────────────────────

    /// Send a request to the primary registered under `server_id`
    ///
    /// The request is kept until answered and replayed if that id
    /// registers again before the answer arrives.
    pub async fn request(&self, server_id: &str, module_id: &str, body: Value) -> Result<Value> {
        let rx = self.dispatch_request(server_id, None, module_id, body)?;
        rx.await.map_err(|_| Error::AgentClosed)?
    }

    /// Send a request to the one process of `server_id` described by `info`
    pub async fn request_to_instance(
        &self,
        server_id: &str,
        info: &ServerInfo,
        module_id: &str,
        body: Value,
    ) -> Result<Value> {
        let rx = self.dispatch_request(server_id, Some(info), module_id, body)?;
        rx.await.map_err(|_| Error::AgentClosed)?
    }

    fn dispatch_request(
        &self,
        target: &str,
        instance: Option<&ServerInfo>,
        module_id: &str,
        body: Value,
    ) -> Result<oneshot::Receiver<Result<Value>>> {
        let (tx, rx) = oneshot::channel();

        let evicted = {
            let mut state = self.inner.state.lock();
            if state.phase == MasterPhase::Closed {
                return Err(Error::AgentClosed);
            }

            let record = match instance {
                None => state.registry.lookup_by_id(target),
                Some(info) => state.registry.lookup_instance(target, info),
            };
            let Some(channel) = record.map(|r| r.channel.clone()) else {
                warn!(target = %target, module_id = %module_id, "Request to unknown server");
                return Err(Error::unknown_target(target));
            };

            let req_id = state.pending.allocate();
            let envelope = compose(Some(req_id), module_id, body.clone());
            let request = OutboundRequest {
                module_id: module_id.to_string(),
                body,
                instance: instance.cloned(),
            };
            let evicted = state.pending.insert(target, req_id, request, tx);

            if let Err(e) = channel.send(Topic::Monitor, &envelope) {
                debug!(target = %target, req_id, error = %e, "Send failed, kept for redelivery");
            }
            evicted
        };

        if let Some((req_id, completion)) = evicted {
            warn!(target = %target, req_id, "Redelivery log full, evicting oldest request");
            let _ = completion.send(Err(Error::RedeliveryEvicted {
                target: target.to_string(),
                req_id,
            }));
        }
        Ok(rx)
    }

    // ─────────────────────────────────────────────────────────────
    // Notifications
    // ─────────────────────────────────────────────────────────────

    /// Notify the primary registered under `server_id`
    pub fn notify_by_id(&self, server_id: &str, module_id: &str, body: Value) -> bool {
        self.fan_out(Topic::Monitor, compose(None, module_id, body), |registry| {
            registry
                .lookup_by_id(server_id)
                .map(|r| vec![r.channel.clone()])
                .unwrap_or_default()
        })
    }

    /// Notify one process of `server_id`, primary or slave
    pub fn notify_by_instance(
        &self,
        server_id: &str,
        info: &ServerInfo,
        module_id: &str,
        body: Value,
    ) -> bool {
        self.fan_out(Topic::Monitor, compose(None, module_id, body), |registry| {
            registry
                .lookup_instance(server_id, info)
                .map(|r| vec![r.channel.clone()])
                .unwrap_or_default()
        })
    }

    /// Notify every primary of a server type
    pub fn notify_by_type(&self, server_type: &str, module_id: &str, body: Value) -> bool {
        self.fan_out(Topic::Monitor, compose(None, module_id, body), |registry| {
            channels_of(registry.lookup_by_type(server_type))
        })
    }

    /// Notify every primary
    pub fn notify_all(&self, module_id: &str, body: Value) -> bool {
        self.fan_out(Topic::Monitor, compose(None, module_id, body), |registry| {
            registry.primaries().map(|r| r.channel.clone()).collect()
        })
    }

    /// Notify the slaves sharing `server_id` with its primary
    pub fn notify_slaves(&self, server_id: &str, module_id: &str, body: Value) -> bool {
        self.fan_out(Topic::Monitor, compose(None, module_id, body), |registry| {
            channels_of(registry.lookup_slaves(server_id))
        })
    }

    /// Push a message to a registered admin client
    pub fn notify_client(&self, client_id: &str, module_id: &str, body: Value) -> bool {
        self.fan_out(Topic::Client, compose(None, module_id, body), |registry| {
            registry
                .lookup_client(client_id)
                .map(|r| vec![r.channel.clone()])
                .unwrap_or_default()
        })
    }

    /// Relay an administrative command to every registered monitor process
    pub fn notify_command(&self, command: &str, module_id: &str, body: Value) -> bool {
        self.fan_out(
            Topic::Monitor,
            compose_command(None, command, module_id, body),
            |registry| registry.all_monitors().map(|r| r.channel.clone()).collect(),
        )
    }

    /// Send one envelope to every channel `select` resolves
    ///
    /// Returns false when nothing matched. All targets share one encoded frame.
    fn fan_out<F>(&self, topic: Topic, envelope: Envelope, select: F) -> bool
    where
        F: FnOnce(&ConnectionRegistry) -> Vec<ChannelHandle>,
    {
        let channels = {
            let state = self.inner.state.lock();
            if state.phase == MasterPhase::Closed {
                return false;
            }
            select(&state.registry)
        };
        if channels.is_empty() {
            debug!(module_id = ?envelope.module_id(), "Notify matched no connection");
            return false;
        }

        let frame = match envelope.to_value() {
            Ok(data) => Arc::new(Frame::new(topic, data)),
            Err(e) => {
                warn!(error = %e, "Failed to encode notify");
                return false;
            }
        };
        for channel in &channels {
            if let Err(e) = channel.send_frame(frame.clone()) {
                debug!(channel_id = channel.id(), error = %e, "Notify not delivered");
            }
        }
        true
    }

    // ─────────────────────────────────────────────────────────────
    // Introspection
    // ─────────────────────────────────────────────────────────────

    /// Ids of all primaries, in ascending order
    pub fn server_ids(&self) -> Vec<String> {
        self.inner.state.lock().registry.server_ids()
    }

    pub fn servers_of_type(&self, server_type: &str) -> Vec<PeerSummary> {
        let state = self.inner.state.lock();
        state
            .registry
            .lookup_by_type(server_type)
            .iter()
            .map(PeerSummary::from)
            .collect()
    }

    pub fn server(&self, server_id: &str) -> Option<PeerSummary> {
        self.inner
            .state
            .lock()
            .registry
            .lookup_by_id(server_id)
            .map(PeerSummary::from)
    }

    pub fn slaves_of(&self, server_id: &str) -> Vec<PeerSummary> {
        let state = self.inner.state.lock();
        state
            .registry
            .lookup_slaves(server_id)
            .iter()
            .map(PeerSummary::from)
            .collect()
    }

    /// Stored info (`username`, `level`) of a registered admin client
    pub fn client_info(&self, client_id: &str) -> Option<ServerInfo> {
        self.inner
            .state
            .lock()
            .registry
            .lookup_client(client_id)
            .map(|r| r.info.clone())
    }

    pub fn client_level(&self, client_id: &str) -> Option<u64> {
        self.client_info(client_id)
            .and_then(|info| info.get("level").and_then(Value::as_u64))
    }

    /// Whether a primary is registered under `server_id`
    pub fn is_connected(&self, server_id: &str) -> bool {
        self.inner.state.lock().registry.lookup_by_id(server_id).is_some()
    }

    /// Requests still waiting for an answer
    pub fn pending_requests(&self) -> usize {
        self.inner.state.lock().pending.len()
    }

    // ─────────────────────────────────────────────────────────────
    // Module values
    // ─────────────────────────────────────────────────────────────

    pub fn set(&self, module_id: &str, value: Value) {
        self.inner.modules.set(module_id, value);
    }

    pub fn get(&self, module_id: &str) -> Option<Value> {
        self.inner.modules.get(module_id)
    }

    pub fn update<F: FnOnce(&mut Value)>(&self, module_id: &str, f: F) {
        self.inner.modules.update(module_id, f);
    }

    // ─────────────────────────────────────────────────────────────
    // Connection callbacks
    // ─────────────────────────────────────────────────────────────

    pub(crate) async fn admit_client(
        &self,
        channel: &ChannelHandle,
        registration: &ClientRegistration,
    ) -> Result<ConnectionRecord> {
        let user = self
            .inner
            .user_auth
            .authenticate(registration, &self.inner.options.env)
            .await
            .ok_or_else(|| Error::auth_failed("client auth failed"))?;

        let record = {
            let mut state = self.inner.state.lock();
            if state.phase == MasterPhase::Closed {
                return Err(Error::AgentClosed);
            }
            if state.registry.lookup_client(&registration.id).is_some() {
                return Err(Error::DuplicateId {
                    id: registration.id.clone(),
                });
            }
            let (record, _) = state.registry.add_connection(
                &registration.id,
                TYPE_CLIENT,
                None,
                user.to_info(),
                channel.clone(),
                true,
            );
            if let Err(e) = channel.send(Topic::Register, &RegisterReply::ok()) {
                debug!(error = %e, "Client left before its register reply");
            }
            record
        };

        info!(client_id = %record.id, username = %user.username, level = user.level, "Admin client registered");
        Ok(record)
    }

    pub(crate) async fn admit_monitor(
        &self,
        channel: &ChannelHandle,
        registration: &MonitorRegistration,
        admission: Admission,
    ) -> Result<ConnectionRecord> {
        if admission == Admission::Reconnect && self.is_connected(&registration.id) {
            return Err(Error::DuplicateId {
                id: registration.id.clone(),
            });
        }

        if admission == Admission::Register || !self.inner.options.trust_reconnect {
            let status = self
                .inner
                .server_auth
                .authenticate(registration, &self.inner.options.env)
                .await;
            if let ServerAuthStatus::Deny(reason) = status {
                return Err(Error::auth_failed(reason));
            }
        }

        let (record, placement, replayed) = {
            let mut state = self.inner.state.lock();
            if state.phase == MasterPhase::Closed {
                return Err(Error::AgentClosed);
            }
            // The id may have been taken while authentication ran
            if admission == Admission::Reconnect
                && state.registry.lookup_by_id(&registration.id).is_some()
            {
                return Err(Error::DuplicateId {
                    id: registration.id.clone(),
                });
            }

            let (record, placement) = state.registry.add_connection(
                &registration.id,
                &registration.server_type,
                registration.pid,
                registration.info.clone(),
                channel.clone(),
                false,
            );
            if let Err(e) = channel.send(admission.reply_topic(), &RegisterReply::ok()) {
                debug!(error = %e, "Monitor left before its register reply");
            }
            let replayed = replay(&state.pending, &record, placement, channel);
            (record, placement, replayed)
        };

        info!(
            server_id = %record.id,
            server_type = %record.server_type,
            placement = ?placement,
            replayed,
            reconnect = admission == Admission::Reconnect,
            "Monitor registered"
        );

        let event = match admission {
            Admission::Register => ServiceEvent::Register {
                id: record.id.clone(),
                server_type: record.server_type.clone(),
                info: record.info.clone(),
            },
            Admission::Reconnect => ServiceEvent::Reconnect {
                id: record.id.clone(),
                server_type: record.server_type.clone(),
                info: record.info.clone(),
            },
        };
        self.inner.modules.emit(event);
        Ok(record)
    }

    /// Settle a request answered by `target`
    pub(crate) fn complete_request(
        &self,
        target: &str,
        resp_id: ReqId,
        error: Option<RemoteError>,
        body: Value,
    ) {
        let completion = self.inner.state.lock().pending.resolve(target, resp_id);
        match completion {
            Some(completion) => {
                let result = match error {
                    Some(error) => Err(error.into()),
                    None => Ok(body),
                };
                let _ = completion.send(result);
            }
            None => warn!(target = %target, resp_id, "Dropping response to unknown request"),
        }
    }

    /// Forget a registered connection after its channel closed
    pub(crate) fn release(&self, record: &ConnectionRecord, reason: &str) {
        let removed = {
            let mut state = self.inner.state.lock();
            state.channels.remove(&record.channel_id());
            match record.kind {
                PeerKind::Monitor => state.registry.remove_channel(
                    &record.id,
                    &record.server_type,
                    &record.info,
                    record.channel_id(),
                ),
                PeerKind::Client => state.registry.remove_client(&record.id, record.channel_id()),
            }
        };

        if removed.is_none() {
            debug!(id = %record.id, "Connection already superseded or removed");
            return;
        }
        info!(id = %record.id, kind = ?record.kind, reason = %reason, "Connection removed");
        self.inner.modules.emit(ServiceEvent::Disconnect {
            id: record.id.clone(),
            kind: record.kind,
            server_type: record.server_type.clone(),
            reason: reason.to_string(),
        });
    }

    /// Drop an unregistered channel from the live set
    pub(crate) fn forget_channel(&self, channel_id: ChannelId) {
        self.inner.state.lock().channels.remove(&channel_id);
    }
}

fn channels_of(records: &[ConnectionRecord]) -> Vec<ChannelHandle> {
    records.iter().map(|r| r.channel.clone()).collect()
}

/// Resend outstanding requests owed to a newly registered record
fn replay(
    pending: &PendingTable,
    record: &ConnectionRecord,
    placement: Placement,
    channel: &ChannelHandle,
) -> usize {
    let mut sent = 0;
    for (req_id, request) in pending.outstanding_for(&record.id) {
        if !request.targets(&record.info, placement.is_primary()) {
            continue;
        }
        let envelope = compose(Some(req_id), request.module_id, request.body);
        if let Err(e) = channel.send(Topic::Monitor, &envelope) {
            debug!(req_id, error = %e, "Replay interrupted");
            break;
        }
        sent += 1;
    }
    sent
}
