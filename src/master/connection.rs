//! Per-connection handler on the master
//!
//! ```text
//! Unregistered ──register/reconnect ok──▶ Registered
//!      │                                      │
//!      └──── auth failure / stray traffic ────┴── channel closed ──▶ Disconnected
//! ```
//!
//! Inbound requests are dispatched on their own tasks so a handler may
//! itself wait on a request to the same peer. Notifies and commands share
//! one ordered worker per connection and run in arrival order.

use std::future::Future;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::agent::{Admission, MasterAgent};
use super::registry::{ConnectionRecord, PeerKind};
use crate::channel::{ChannelEvent, ChannelHandle};
use crate::error::{Error, Result};
use crate::protocol::{compose_response, parse, Envelope, Frame, RegisterReply, RegisterRequest, RemoteError, Topic};
use crate::service::acl::Origin;
use crate::service::{AgentRef, HandlerKind, OrderedQueue};

/// Registration state of one accepted channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Unregistered,
    Registered,
    Disconnected,
}

pub(crate) struct MasterConnection {
    agent: MasterAgent,
    channel: ChannelHandle,
    state: ConnectionState,
    record: Option<ConnectionRecord>,
    ordered: OrderedQueue,
}

impl MasterConnection {
    pub(crate) fn new(agent: MasterAgent, channel: ChannelHandle) -> Self {
        Self {
            agent,
            channel,
            state: ConnectionState::Unregistered,
            record: None,
            ordered: OrderedQueue::spawn(),
        }
    }

    pub(crate) async fn run(mut self, mut events: mpsc::UnboundedReceiver<ChannelEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                ChannelEvent::Message(frame) => self.on_frame(frame).await,
                ChannelEvent::Closed { reason } => {
                    self.on_disconnect(&reason);
                    return;
                }
            }
            if self.state == ConnectionState::Disconnected {
                return;
            }
        }
        self.on_disconnect("event stream ended");
    }

    async fn on_frame(&mut self, frame: Arc<Frame>) {
        match (self.state, frame.event) {
            (ConnectionState::Disconnected, _) => {}

            (ConnectionState::Unregistered, Topic::Register) => {
                self.on_register(&frame.data, Admission::Register).await
            }
            (ConnectionState::Unregistered, Topic::Reconnect) => {
                self.on_register(&frame.data, Admission::Reconnect).await
            }
            (ConnectionState::Unregistered, topic) => {
                warn!(
                    channel_id = self.channel.id(),
                    topic = %topic,
                    "Traffic before registration, disconnecting"
                );
                self.force_disconnect("unregistered traffic");
            }

            (ConnectionState::Registered, Topic::Register | Topic::Reconnect) => {
                warn!(channel_id = self.channel.id(), "Ignoring repeated registration");
            }
            (ConnectionState::Registered, Topic::Monitor) if self.kind() == Some(PeerKind::Monitor) => {
                self.on_monitor(&frame.data)
            }
            (ConnectionState::Registered, Topic::Client) if self.kind() == Some(PeerKind::Client) => {
                self.on_client(&frame.data)
            }
            (ConnectionState::Registered, topic) => {
                debug!(channel_id = self.channel.id(), topic = %topic, "Ignoring frame on foreign topic");
            }
        }
    }

    fn kind(&self) -> Option<PeerKind> {
        self.record.as_ref().map(|r| r.kind)
    }

    // ─────────────────────────────────────────────────────────────
    // Registration
    // ─────────────────────────────────────────────────────────────

    async fn on_register(&mut self, data: &Value, admission: Admission) {
        let reply_topic = admission.reply_topic();
        let request = match serde_json::from_value::<RegisterRequest>(data.clone()) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "Unrecognised registration");
                self.reject(reply_topic, &format!("unknown registration: {}", e));
                return;
            }
        };

        let admitted = match (&request, admission) {
            (RegisterRequest::Monitor(registration), _) => {
                self.agent.admit_monitor(&self.channel, registration, admission).await
            }
            (RegisterRequest::Client(registration), Admission::Register) => {
                self.agent.admit_client(&self.channel, registration).await
            }
            (RegisterRequest::Client(_), Admission::Reconnect) => {
                Err(Error::Protocol("clients cannot reconnect".to_string()))
            }
        };

        match admitted {
            Ok(record) => {
                self.record = Some(record);
                self.state = ConnectionState::Registered;
            }
            Err(e) => {
                warn!(id = %request.id(), error = %e, "Registration rejected");
                self.reject(reply_topic, &e.to_string());
            }
        }
    }

    fn reject(&mut self, topic: Topic, message: &str) {
        let _ = self.channel.send(topic, &RegisterReply::fail(message));
        self.force_disconnect(message);
    }

    // ─────────────────────────────────────────────────────────────
    // Registered traffic
    // ─────────────────────────────────────────────────────────────

    fn on_monitor(&self, data: &Value) {
        let Some(record) = self.record.as_ref() else {
            return;
        };
        let envelope = match parse(data) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(server_id = %record.id, error = %e, "Dropping malformed monitor message");
                return;
            }
        };

        match envelope {
            Envelope::Response { resp_id, error, body } => {
                self.agent.complete_request(&record.id, resp_id, error, body);
            }
            Envelope::Request { .. } => {
                tokio::spawn(self.execute(envelope, Topic::Monitor, HandlerKind::MasterHandler, Origin::Peer));
            }
            Envelope::Notify { .. } => {
                self.ordered
                    .push(self.execute(envelope, Topic::Monitor, HandlerKind::MasterHandler, Origin::Peer));
            }
            Envelope::Command { command, .. } => {
                warn!(server_id = %record.id, command = %command, "Ignoring command from monitor");
            }
        }
    }

    fn on_client(&self, data: &Value) {
        let mut envelope = match parse(data) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(channel_id = self.channel.id(), error = %e, "Dropping malformed client message");
                return;
            }
        };

        if let Some(record) = self.record.as_ref() {
            stamp_client_id(&mut envelope, &record.id);
        }

        match envelope {
            Envelope::Request { .. } => {
                tokio::spawn(self.execute(envelope, Topic::Client, HandlerKind::ClientHandler, Origin::Client));
            }
            Envelope::Notify { .. } => {
                self.ordered
                    .push(self.execute(envelope, Topic::Client, HandlerKind::ClientHandler, Origin::Client));
            }
            Envelope::Command { .. } => self.ordered.push(self.command(envelope)),
            Envelope::Response { resp_id, .. } => {
                debug!(resp_id, "Ignoring response from admin client");
            }
        }
    }

    /// Run a module handler for `envelope` and answer it
    fn execute(
        &self,
        envelope: Envelope,
        topic: Topic,
        kind: HandlerKind,
        origin: Origin,
    ) -> impl Future<Output = ()> + Send + 'static {
        let agent = self.agent.clone();
        let channel = self.channel.clone();
        async move {
            let module_id = envelope.module_id().unwrap_or_default().to_string();
            let result = agent
                .modules()
                .execute(&AgentRef::Master(agent.clone()), &module_id, kind, envelope.body().clone(), origin)
                .await;
            answer(&channel, topic, &envelope, result);
        }
    }

    fn command(&self, envelope: Envelope) -> impl Future<Output = ()> + Send + 'static {
        let agent = self.agent.clone();
        let channel = self.channel.clone();
        async move {
            let Envelope::Command { command, module_id, body, .. } = &envelope else {
                return;
            };
            let result = agent
                .modules()
                .command(&AgentRef::Master(agent.clone()), command, module_id, body.clone(), Origin::Client)
                .await;
            answer(&channel, Topic::Client, &envelope, result);
        }
    }

    // ─────────────────────────────────────────────────────────────
    // Teardown
    // ─────────────────────────────────────────────────────────────

    fn force_disconnect(&mut self, reason: &str) {
        self.channel.disconnect(reason.to_string());
        self.on_disconnect(reason);
    }

    fn on_disconnect(&mut self, reason: &str) {
        if self.state == ConnectionState::Disconnected {
            return;
        }
        self.state = ConnectionState::Disconnected;
        match self.record.take() {
            Some(record) => self.agent.release(&record, reason),
            None => self.agent.forget_channel(self.channel.id()),
        }
    }
}

/// Overwrite `clientId` in an object body with the id the client registered as
fn stamp_client_id(envelope: &mut Envelope, client_id: &str) {
    let body = match envelope {
        Envelope::Request { body, .. }
        | Envelope::Notify { body, .. }
        | Envelope::Command { body, .. } => body,
        Envelope::Response { .. } => return,
    };
    if let Value::Object(map) = body {
        map.insert("clientId".to_string(), Value::from(client_id));
    }
}

/// Reply to `original` when it expects an answer; failures are logged
pub(crate) fn answer(channel: &ChannelHandle, topic: Topic, original: &Envelope, result: Result<Value>) {
    let (error, body) = match result {
        Ok(body) => (None, body),
        Err(e) => {
            warn!(module_id = ?original.module_id(), error = %e, "Handler failed");
            (Some(RemoteError::from(&e)), Value::Null)
        }
    };
    if let Some(response) = compose_response(original, error, body) {
        if let Err(e) = channel.send(topic, &response) {
            debug!(error = %e, "Response not delivered");
        }
    }
}
