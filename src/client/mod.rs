//! Admin client: an operator's session with the master
//!
//! Logs in with a username and password, then calls `client_handler`s,
//! runs commands (`list`, `enable`, `disable`) and receives pushes sent
//! with `MasterAgent::notify_client`.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::channel::{await_handshake, ChannelEvent, ChannelHandle, Connector};
use crate::error::{Error, Result};
use crate::protocol::{
    compose, compose_command, parse, ClientRegistration, Envelope, RegisterRequest, ReqId, Topic,
};

const PUSH_CAPACITY: usize = 64;

type Completion = oneshot::Sender<Result<Value>>;

/// Login for an admin user
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientCredentials {
    pub username: String,
    pub password: String,
    /// `password` is a SHA-256 hex digest rather than plain text
    pub md5: bool,
}

impl ClientCredentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            md5: false,
        }
    }

    /// Credentials whose password is already digested
    pub fn digested(username: impl Into<String>, digest: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: digest.into(),
            md5: true,
        }
    }
}

/// A notify pushed by the master to this client
#[derive(Debug, Clone, PartialEq)]
pub struct ClientPush {
    pub module_id: String,
    pub body: Value,
}

#[derive(Default)]
struct ClientState {
    next_req_id: ReqId,
    completions: HashMap<ReqId, Completion>,
    closed: bool,
}

struct ClientInner {
    id: String,
    username: String,
    channel: ChannelHandle,
    state: Mutex<ClientState>,
    pushes: broadcast::Sender<ClientPush>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

/// A logged-in admin session
#[derive(Clone)]
pub struct AdminClient {
    inner: Arc<ClientInner>,
}

impl fmt::Debug for AdminClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdminClient")
            .field("id", &self.inner.id)
            .field("username", &self.inner.username)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl AdminClient {
    /// Random client id for one-off sessions
    pub fn generate_id() -> String {
        format!("admin-{}", Uuid::new_v4())
    }

    /// Connect and log in
    ///
    /// Fails with `AuthFailed` when the master rejects the credentials or
    /// the id is already taken by another client.
    pub async fn connect<C: Connector>(
        connector: C,
        id: impl Into<String>,
        credentials: ClientCredentials,
        timeout: Duration,
    ) -> Result<Self> {
        let id = id.into();
        info!(master = %connector.describe(), client_id = %id, "Connecting admin client");

        let channel = connector.connect().await?;
        let (handle, mut events) = channel.into_parts();

        let registration = RegisterRequest::Client(ClientRegistration {
            id: id.clone(),
            username: credentials.username.clone(),
            password: credentials.password,
            md5: credentials.md5,
        });
        let handshake = match handle.send(Topic::Register, &registration) {
            Ok(()) => await_handshake(&mut events, Topic::Register, timeout).await,
            Err(e) => Err(e),
        };

        let reply = match handshake {
            Ok(reply) => reply,
            Err(e) => {
                handle.disconnect("login incomplete");
                return Err(e);
            }
        };
        if !reply.code.is_ok() {
            handle.disconnect("login rejected");
            return Err(Error::auth_failed(reply.msg));
        }

        let (pushes, _) = broadcast::channel(PUSH_CAPACITY);
        let client = Self {
            inner: Arc::new(ClientInner {
                id,
                username: credentials.username,
                channel: handle,
                state: Mutex::new(ClientState {
                    next_req_id: 1,
                    ..Default::default()
                }),
                pushes,
                reader: Mutex::new(None),
            }),
        };

        let reader = tokio::spawn(client.clone().read_loop(events));
        *client.inner.reader.lock() = Some(reader);

        info!(client_id = %client.id(), username = %client.username(), "Admin client logged in");
        Ok(client)
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn username(&self) -> &str {
        &self.inner.username
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    /// Pushes from the master, starting now
    pub fn subscribe(&self) -> broadcast::Receiver<ClientPush> {
        self.inner.pushes.subscribe()
    }

    // ─────────────────────────────────────────────────────────────
    // Calls
    // ─────────────────────────────────────────────────────────────

    /// Call the master's `client_handler` of `module_id`
    pub async fn request(&self, module_id: &str, body: Value) -> Result<Value> {
        let body = self.stamp(body)?;
        self.call(|req_id| compose(Some(req_id), module_id, body)).await
    }

    /// Fire-and-forget call to the master's `client_handler` of `module_id`
    pub fn notify(&self, module_id: &str, body: Value) -> Result<()> {
        let body = self.stamp(body)?;
        if self.is_closed() {
            return Err(Error::AgentClosed);
        }
        self.inner
            .channel
            .send(Topic::Client, &compose(None, module_id, body))
    }

    /// Run `list`, `enable` or `disable` on the master
    pub async fn command(&self, command: &str, module_id: &str, body: Value) -> Result<Value> {
        let body = self.stamp(body)?;
        self.call(|req_id| compose_command(Some(req_id), command, module_id, body))
            .await
    }

    async fn call<F>(&self, build: F) -> Result<Value>
    where
        F: FnOnce(ReqId) -> Envelope,
    {
        let rx = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return Err(Error::AgentClosed);
            }
            let req_id = state.next_req_id;
            state.next_req_id += 1;

            self.inner.channel.send(Topic::Client, &build(req_id))?;
            let (tx, rx) = oneshot::channel();
            state.completions.insert(req_id, tx);
            rx
        };
        rx.await.map_err(|_| Error::AgentClosed)?
    }

    /// Attach `clientId` and `username` to an object body
    fn stamp(&self, body: Value) -> Result<Value> {
        let mut map = match body {
            Value::Null => Map::new(),
            Value::Object(map) => map,
            other => {
                return Err(Error::Protocol(format!(
                    "admin request body must be an object, got {}",
                    other
                )))
            }
        };
        map.insert("clientId".to_string(), Value::from(self.id()));
        map.insert("username".to_string(), Value::from(self.username()));
        Ok(Value::Object(map))
    }

    /// Log out and fail every outstanding call
    pub fn close(&self) {
        let reader = self.inner.reader.lock().take();
        if let Some(reader) = reader {
            reader.abort();
        }
        self.shutdown(|| Error::AgentClosed);
        self.inner.channel.disconnect("client closed");
    }

    fn shutdown<F: Fn() -> Error>(&self, error: F) {
        let completions: Vec<Completion> = {
            let mut state = self.inner.state.lock();
            state.closed = true;
            state.completions.drain().map(|(_, c)| c).collect()
        };
        for completion in completions {
            let _ = completion.send(Err(error()));
        }
    }

    // ─────────────────────────────────────────────────────────────
    // Reader
    // ─────────────────────────────────────────────────────────────

    async fn read_loop(self, mut events: mpsc::UnboundedReceiver<ChannelEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                ChannelEvent::Message(frame) if frame.event == Topic::Client => {
                    self.on_client(&frame.data);
                }
                ChannelEvent::Message(frame) => {
                    debug!(topic = %frame.event, "Ignoring frame on unexpected topic");
                }
                ChannelEvent::Closed { reason } => {
                    warn!(client_id = %self.id(), reason = %reason, "Admin client lost the master");
                    self.shutdown(|| Error::ConnectionLost {
                        message: reason.clone(),
                    });
                    return;
                }
            }
        }
        self.shutdown(|| Error::ConnectionLost {
            message: "channel dropped".to_string(),
        });
    }

    fn on_client(&self, data: &Value) {
        let envelope = match parse(data) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, "Dropping malformed message from master");
                return;
            }
        };

        match envelope {
            Envelope::Response {
                resp_id,
                error,
                body,
            } => {
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
            Envelope::Notify { module_id, body } => {
                // No subscribers is fine
                let _ = self.inner.pushes.send(ClientPush { module_id, body });
            }
            other => debug!(envelope = ?other, "Ignoring unexpected envelope"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{memory, Acceptor, Channel};
    use crate::protocol::{Frame, RegisterReply};
    use serde_json::json;

    #[test]
    fn test_generated_ids_are_unique() {
        let a = AdminClient::generate_id();
        let b = AdminClient::generate_id();
        assert!(a.starts_with("admin-"));
        assert_ne!(a, b);
    }

    /// Log in against a hand-driven master end
    async fn fake_master(reply: RegisterReply) -> (AdminClient, Channel) {
        let (mut acceptor, connector) = memory::transport();

        let login = tokio::spawn(async move {
            AdminClient::connect(
                connector,
                "c1",
                ClientCredentials::new("admin", "pw"),
                Duration::from_secs(1),
            )
            .await
        });

        let mut master = acceptor.accept().await.unwrap();
        let Some(ChannelEvent::Message(frame)) = master.events.recv().await else {
            panic!("expected a register frame");
        };
        assert_eq!(frame.event, Topic::Register);
        assert_eq!(frame.data["type"], "client");
        master.handle.send(Topic::Register, &reply).unwrap();

        let client = login.await.unwrap().unwrap();
        (client, master)
    }

    #[tokio::test]
    async fn test_request_injects_identity() {
        let (client, master) = fake_master(RegisterReply::ok()).await;
        let (master_handle, mut master_events) = master.into_parts();

        let call = {
            let client = client.clone();
            tokio::spawn(async move { client.request("systemInfo", Value::Null).await })
        };

        let Some(ChannelEvent::Message(frame)) = master_events.recv().await else {
            panic!("expected a request frame");
        };
        assert_eq!(frame.data["body"]["clientId"], "c1");
        assert_eq!(frame.data["body"]["username"], "admin");
        let req_id = frame.data["reqId"].as_u64().unwrap();

        master_handle
            .send_frame(Arc::new(Frame::new(
                Topic::Client,
                json!({ "respId": req_id, "body": { "ok": true } }),
            )))
            .unwrap();

        assert_eq!(call.await.unwrap().unwrap(), json!({ "ok": true }));
    }

    #[tokio::test]
    async fn test_non_object_body_rejected() {
        let (client, _master) = fake_master(RegisterReply::ok()).await;
        let err = client.notify("systemInfo", json!([1, 2])).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[tokio::test]
    async fn test_pushes_reach_subscribers() {
        let (client, master) = fake_master(RegisterReply::ok()).await;
        let mut pushes = client.subscribe();

        master
            .handle
            .send(Topic::Client, &compose(None, "watch", json!({ "n": 1 })))
            .unwrap();

        let push = pushes.recv().await.unwrap();
        assert_eq!(push.module_id, "watch");
        assert_eq!(push.body["n"], 1);
    }

    #[tokio::test]
    async fn test_loss_fails_outstanding_calls() {
        let (client, master) = fake_master(RegisterReply::ok()).await;
        let (master_handle, mut master_events) = master.into_parts();

        let call = {
            let client = client.clone();
            tokio::spawn(async move { client.command("list", "", Value::Null).await })
        };
        master_events.recv().await.unwrap();
        master_handle.disconnect("master going away");

        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::ConnectionLost { .. }));
        assert!(client.is_closed());
    }

    #[tokio::test]
    async fn test_rejected_login() {
        let (mut acceptor, connector) = memory::transport();

        let login = tokio::spawn(async move {
            AdminClient::connect(
                connector,
                "c1",
                ClientCredentials::new("admin", "wrong"),
                Duration::from_secs(1),
            )
            .await
        });
        let mut master = acceptor.accept().await.unwrap();
        master.events.recv().await.unwrap();
        master
            .handle
            .send(Topic::Register, &RegisterReply::fail("client auth failed"))
            .unwrap();

        let err = login.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::AuthFailed { .. }));
    }
}
