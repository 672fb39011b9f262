//! Duplex message channels
//!
//! Agents talk through a transport-neutral channel:
//! - [`ChannelHandle`]: cloneable write half (`send(topic, payload)`, `disconnect`)
//! - [`ChannelEvent`]: inbound frames and the terminal `Closed` event
//! - [`Acceptor`] / [`Connector`]: server-side and client-side channel factories
//!
//! Two transports are provided: [`memory`] for in-process wiring and tests,
//! and [`websocket`] for real deployments.

pub mod memory;
pub mod websocket;

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::protocol::{Frame, RegisterReply, Topic};

/// Process-unique channel identifier
pub type ChannelId = u64;

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_channel_id() -> ChannelId {
    NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed)
}

// ─────────────────────────────────────────────────────────────────
// Events
// ─────────────────────────────────────────────────────────────────

/// Events delivered to the owner of a channel
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    /// A frame arrived from the peer
    Message(Arc<Frame>),

    /// The channel is gone; no further events follow
    Closed { reason: String },
}

/// Work queued for a transport's writer
#[derive(Debug)]
pub(crate) enum Outbound {
    Frame(Arc<Frame>),
    Close(String),
}

// ─────────────────────────────────────────────────────────────────
// Channel Handle
// ─────────────────────────────────────────────────────────────────

/// Write half of a channel
///
/// Sends never block: frames are queued for the transport in FIFO order.
#[derive(Clone)]
pub struct ChannelHandle {
    id: ChannelId,
    peer: Option<String>,
    tx: mpsc::UnboundedSender<Outbound>,
    closed: Arc<AtomicBool>,
}

impl ChannelHandle {
    pub(crate) fn new(
        peer: Option<String>,
        tx: mpsc::UnboundedSender<Outbound>,
        closed: Arc<AtomicBool>,
    ) -> Self {
        Self {
            id: next_channel_id(),
            peer,
            tx,
            closed,
        }
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    /// Remote address or label, when the transport knows one
    pub fn peer(&self) -> Option<&str> {
        self.peer.as_deref()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Serialize `payload` and queue it under `topic`
    pub fn send<T: Serialize + ?Sized>(&self, topic: Topic, payload: &T) -> Result<()> {
        let data = serde_json::to_value(payload)
            .map_err(|e| Error::Internal(format!("Failed to encode {} payload: {}", topic, e)))?;
        self.send_frame(Arc::new(Frame::new(topic, data)))
    }

    /// Queue an already-built frame; fan-out shares one frame across channels
    pub fn send_frame(&self, frame: Arc<Frame>) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ChannelClosed { channel_id: self.id });
        }
        self.tx
            .send(Outbound::Frame(frame))
            .map_err(|_| Error::ChannelClosed { channel_id: self.id })
    }

    /// Close the channel after already-queued frames are flushed
    ///
    /// Idempotent. Both ends observe `ChannelEvent::Closed`.
    pub fn disconnect(&self, reason: impl Into<String>) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.tx.send(Outbound::Close(reason.into()));
        }
    }
}

impl fmt::Debug for ChannelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelHandle")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// A connected channel: write handle plus its event stream
#[derive(Debug)]
pub struct Channel {
    pub handle: ChannelHandle,
    pub events: mpsc::UnboundedReceiver<ChannelEvent>,
}

impl Channel {
    pub fn into_parts(self) -> (ChannelHandle, mpsc::UnboundedReceiver<ChannelEvent>) {
        (self.handle, self.events)
    }
}

// ─────────────────────────────────────────────────────────────────
// Factories
// ─────────────────────────────────────────────────────────────────

/// Server-side source of freshly accepted channels
#[async_trait]
pub trait Acceptor: Send + 'static {
    /// Next accepted channel, or `None` once the listener is gone
    async fn accept(&mut self) -> Option<Channel>;

    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }
}

/// Client-side factory opening one channel per call
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self) -> Result<Channel>;

    /// Human-readable target for logs
    fn describe(&self) -> String;
}

// ─────────────────────────────────────────────────────────────────
// Handshake
// ─────────────────────────────────────────────────────────────────

/// Wait for the master's reply to `register` or `reconnect`
///
/// Frames on other topics are skipped. Fails if the channel closes or no
/// reply arrives within `timeout`.
pub(crate) async fn await_handshake(
    events: &mut mpsc::UnboundedReceiver<ChannelEvent>,
    topic: Topic,
    timeout: Duration,
) -> Result<RegisterReply> {
    let wait = async {
        while let Some(event) = events.recv().await {
            match event {
                ChannelEvent::Message(frame) if frame.event == topic => {
                    return serde_json::from_value::<RegisterReply>(frame.data.clone())
                        .map_err(|e| Error::malformed(format!("bad {} reply: {}", topic, e)));
                }
                ChannelEvent::Message(frame) => {
                    tracing::debug!(topic = %frame.event, "Ignoring frame during handshake");
                }
                ChannelEvent::Closed { reason } => {
                    return Err(Error::ConnectionLost {
                        message: format!("closed during {}: {}", topic, reason),
                    });
                }
            }
        }
        Err(Error::ConnectionLost {
            message: format!("event stream ended during {}", topic),
        })
    };

    tokio::time::timeout(timeout, wait)
        .await
        .map_err(|_| Error::ConnectionTimeout {
            url: topic.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        })?
}
