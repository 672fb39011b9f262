//! WebSocket channel transport
//!
//! Provides:
//! - [`WsAcceptor`]: TCP listener upgrading each connection to a WebSocket
//! - [`WsConnector`]: outbound client with a connect timeout
//!
//! Each frame travels as one JSON text message. A single pump task per
//! connection interleaves writes from the handle with reads from the socket.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, ToSocketAddrs};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    accept_async, connect_async,
    tungstenite::{Error as WsError, Message as WsMessage},
    WebSocketStream,
};
use tracing::{debug, info, warn};
use url::Url;

use super::{Acceptor, Channel, ChannelEvent, ChannelHandle, Connector, Outbound};
use crate::error::{Error, Result};
use crate::protocol::Frame;

// ─────────────────────────────────────────────────────────────────
// Server
// ─────────────────────────────────────────────────────────────────

/// Listening side of the WebSocket transport
pub struct WsAcceptor {
    local_addr: SocketAddr,
    incoming: mpsc::Receiver<Channel>,
    accept_task: JoinHandle<()>,
}

impl WsAcceptor {
    /// Bind a listener and start accepting connections in the background
    pub async fn bind<A: ToSocketAddrs>(addr: A) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let (tx, incoming) = mpsc::channel(64);

        info!(addr = %local_addr, "WebSocket listener bound");

        let accept_task = tokio::spawn(async move {
            loop {
                let (stream, peer) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(error = %e, "Failed to accept TCP connection");
                        continue;
                    }
                };

                let tx = tx.clone();
                tokio::spawn(async move {
                    match accept_async(stream).await {
                        Ok(ws) => {
                            debug!(peer = %peer, "WebSocket handshake complete");
                            let channel = spawn_pump(ws, Some(peer.to_string()));
                            let _ = tx.send(channel).await;
                        }
                        Err(e) => {
                            warn!(peer = %peer, error = %e, "WebSocket handshake failed");
                        }
                    }
                });
            }
        });

        Ok(Self {
            local_addr,
            incoming,
            accept_task,
        })
    }
}

impl Drop for WsAcceptor {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

#[async_trait]
impl Acceptor for WsAcceptor {
    async fn accept(&mut self) -> Option<Channel> {
        self.incoming.recv().await
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        Some(self.local_addr)
    }
}

// ─────────────────────────────────────────────────────────────────
// Client
// ─────────────────────────────────────────────────────────────────

/// Connecting side of the WebSocket transport
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: Url,
    connect_timeout: Duration,
}

impl WsConnector {
    pub fn new(url: &str, connect_timeout: Duration) -> Result<Self> {
        let url = Url::parse(url).map_err(|e| Error::connection_failed(url, e.to_string()))?;
        match url.scheme() {
            "ws" | "wss" => Ok(Self {
                url,
                connect_timeout,
            }),
            other => Err(Error::connection_failed(
                url.as_str(),
                format!("unsupported scheme '{}'", other),
            )),
        }
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self) -> Result<Channel> {
        let attempt = tokio::time::timeout(self.connect_timeout, connect_async(self.url.clone()));
        let (ws, _response) = attempt
            .await
            .map_err(|_| Error::ConnectionTimeout {
                url: self.url.to_string(),
                timeout_ms: self.connect_timeout.as_millis() as u64,
            })?
            .map_err(|e| Error::connection_failed(self.url.as_str(), e.to_string()))?;

        debug!(url = %self.url, "WebSocket connection established");
        Ok(spawn_pump(ws, Some(self.url.to_string())))
    }

    fn describe(&self) -> String {
        self.url.to_string()
    }
}

// ─────────────────────────────────────────────────────────────────
// Connection Pump
// ─────────────────────────────────────────────────────────────────

fn spawn_pump<S>(ws: WebSocketStream<S>, peer: Option<String>) -> Channel
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let closed = Arc::new(AtomicBool::new(false));
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let (events_tx, events_rx) = mpsc::unbounded_channel();

    let handle = ChannelHandle::new(peer, out_tx, closed.clone());
    let channel_id = handle.id();

    tokio::spawn(async move {
        let reason = pump(ws, out_rx, &events_tx).await;
        closed.store(true, Ordering::SeqCst);
        debug!(channel_id, reason = %reason, "WebSocket channel closed");
        let _ = events_tx.send(ChannelEvent::Closed { reason });
    });

    Channel {
        handle,
        events: events_rx,
    }
}

/// Drive one socket until either side closes it; returns the close reason
async fn pump<S>(
    ws: WebSocketStream<S>,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    events: &mpsc::UnboundedSender<ChannelEvent>,
) -> String
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut write, mut read) = ws.split();

    loop {
        tokio::select! {
            item = outbound.recv() => {
                match item {
                    Some(Outbound::Frame(frame)) => {
                        let text = match frame.to_json() {
                            Ok(text) => text,
                            Err(e) => {
                                warn!(error = %e, "Failed to encode frame");
                                continue;
                            }
                        };
                        if let Err(e) = write.send(WsMessage::Text(text)).await {
                            return format!("write failed: {}", e);
                        }
                    }
                    Some(Outbound::Close(reason)) => {
                        let _ = write.send(WsMessage::Close(None)).await;
                        return reason;
                    }
                    None => {
                        let _ = write.send(WsMessage::Close(None)).await;
                        return "all handles dropped".to_string();
                    }
                }
            }

            msg = read.next() => {
                match msg {
                    Some(Ok(WsMessage::Text(text))) => match Frame::from_json(&text) {
                        Ok(frame) => {
                            let _ = events.send(ChannelEvent::Message(Arc::new(frame)));
                        }
                        Err(e) => warn!(error = %e, "Dropping undecodable frame"),
                    },
                    Some(Ok(WsMessage::Binary(data))) => match Frame::from_json_bytes(&data) {
                        Ok(frame) => {
                            let _ = events.send(ChannelEvent::Message(Arc::new(frame)));
                        }
                        Err(e) => warn!(error = %e, "Dropping undecodable binary frame"),
                    },
                    Some(Ok(WsMessage::Ping(data))) => {
                        let _ = write.send(WsMessage::Pong(data)).await;
                    }
                    Some(Ok(WsMessage::Close(frame))) => {
                        debug!(frame = ?frame, "Received close frame");
                        return "peer closed".to_string();
                    }
                    Some(Ok(_)) => {}
                    Some(Err(WsError::ConnectionClosed)) | None => {
                        return "stream ended".to_string();
                    }
                    Some(Err(e)) => {
                        return format!("read failed: {}", e);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Topic;
    use serde_json::json;

    #[test]
    fn test_connector_rejects_http_scheme() {
        let err = WsConnector::new("http://localhost:3005", Duration::from_secs(1)).unwrap_err();
        assert!(err.to_string().contains("unsupported scheme"));
    }

    #[tokio::test]
    async fn test_loopback_round_trip() {
        let mut acceptor = WsAcceptor::bind("127.0.0.1:0").await.unwrap();
        let addr = acceptor.local_addr().unwrap();

        let connector = WsConnector::new(&format!("ws://{}", addr), Duration::from_secs(5)).unwrap();
        let client = connector.connect().await.unwrap();
        let mut server = acceptor.accept().await.unwrap();

        client.handle.send(Topic::Monitor, &json!({"moduleId": "echo"})).unwrap();
        match server.events.recv().await {
            Some(ChannelEvent::Message(frame)) => {
                assert_eq!(frame.event, Topic::Monitor);
                assert_eq!(frame.data["moduleId"], "echo");
            }
            other => panic!("Expected message, got {:?}", other),
        }

        let (client_handle, mut client_events) = client.into_parts();
        server.handle.disconnect("test done");
        match client_events.recv().await {
            Some(ChannelEvent::Closed { .. }) => {}
            other => panic!("Expected Closed, got {:?}", other),
        }
        assert!(client_handle.is_closed());
    }
}
