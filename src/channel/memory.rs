//! In-process channel transport
//!
//! Wires two endpoints together with unbounded queues. Used by the test
//! suites and by embedders that run master and monitors in one process.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{Acceptor, Channel, ChannelEvent, ChannelHandle, Connector, Outbound};
use crate::error::{Error, Result};

/// Create two connected channel endpoints
///
/// Must be called inside a tokio runtime: each direction is driven by a
/// small forwarding task.
pub fn pair() -> (Channel, Channel) {
    let closed = Arc::new(AtomicBool::new(false));

    let (a_out_tx, a_out_rx) = mpsc::unbounded_channel();
    let (b_out_tx, b_out_rx) = mpsc::unbounded_channel();
    let (a_events_tx, a_events_rx) = mpsc::unbounded_channel();
    let (b_events_tx, b_events_rx) = mpsc::unbounded_channel();

    tokio::spawn(forward(a_out_rx, b_events_tx.clone(), a_events_tx.clone()));
    tokio::spawn(forward(b_out_rx, a_events_tx, b_events_tx));

    let a = Channel {
        handle: ChannelHandle::new(Some("memory".to_string()), a_out_tx, closed.clone()),
        events: a_events_rx,
    };
    let b = Channel {
        handle: ChannelHandle::new(Some("memory".to_string()), b_out_tx, closed),
        events: b_events_rx,
    };
    (a, b)
}

async fn forward(
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    peer_events: mpsc::UnboundedSender<ChannelEvent>,
    local_events: mpsc::UnboundedSender<ChannelEvent>,
) {
    while let Some(item) = outbound.recv().await {
        match item {
            Outbound::Frame(frame) => {
                let _ = peer_events.send(ChannelEvent::Message(frame));
            }
            Outbound::Close(reason) => {
                let _ = local_events.send(ChannelEvent::Closed { reason });
                let _ = peer_events.send(ChannelEvent::Closed {
                    reason: "peer disconnected".to_string(),
                });
                return;
            }
        }
    }
}

/// Create a connected acceptor/connector pair
pub fn transport() -> (MemoryAcceptor, MemoryConnector) {
    let (tx, rx) = mpsc::unbounded_channel();
    (MemoryAcceptor { incoming: rx }, MemoryConnector { outgoing: tx })
}

/// Server side of the in-process transport
pub struct MemoryAcceptor {
    incoming: mpsc::UnboundedReceiver<Channel>,
}

#[async_trait]
impl Acceptor for MemoryAcceptor {
    async fn accept(&mut self) -> Option<Channel> {
        self.incoming.recv().await
    }
}

/// Client side of the in-process transport
#[derive(Clone)]
pub struct MemoryConnector {
    outgoing: mpsc::UnboundedSender<Channel>,
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self) -> Result<Channel> {
        let (local, remote) = pair();
        self.outgoing
            .send(remote)
            .map_err(|_| Error::connection_failed("memory", "acceptor is gone"))?;
        Ok(local)
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}
