//! Master, monitor and admin client over a loopback WebSocket

mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use fleet_console::channel::websocket::{WsAcceptor, WsConnector};
use fleet_console::channel::Connector;
use fleet_console::client::{AdminClient, ClientCredentials};
use fleet_console::error::Error;
use fleet_console::master::{MasterOptions, PeerKind};
use fleet_console::service::auth::{SharedToken, StaticUsers};
use fleet_console::service::{ConsoleService, ServiceEvent};

use common::*;

struct WsMaster {
    service: ConsoleService,
    recorder: Recorder,
    url: String,
}

async fn start_ws_master() -> WsMaster {
    let service = ConsoleService::master(
        MasterOptions::default(),
        Arc::new(StaticUsers::new(admin_users())),
        Arc::new(SharedToken::new(Some(TOKEN.to_string()))),
    );
    let recorder = Recorder::default();
    service.register(ECHO, recorder.clone());

    let acceptor = WsAcceptor::bind("127.0.0.1:0").await.unwrap();
    let addr = service.listen(acceptor).unwrap().expect("bound address");

    WsMaster {
        service,
        recorder,
        url: format!("ws://{}", addr),
    }
}

fn connector(url: &str) -> WsConnector {
    WsConnector::new(url, Duration::from_secs(2)).unwrap()
}

#[tokio::test]
async fn test_round_trip_over_websocket() {
    let master = start_ws_master().await;
    let monitor = start_monitor(connector(&master.url), monitor_options("area-1", "area", 3101), Some(TOKEN))
        .await
        .unwrap();

    let agent = master.service.master_agent().unwrap();
    let reply = within(agent.request("area-1", ECHO, json!({ "hello": "ws" })))
        .await
        .unwrap();
    assert_eq!(reply["server"], "area-1");
    assert_eq!(reply["body"]["hello"], "ws");
    assert_eq!(monitor.recorder.count(), 1);

    let reply = within(monitor.agent().request(ECHO, Value::Null)).await.unwrap();
    assert_eq!(reply, json!({ "ack": true }));
}

#[tokio::test]
async fn test_admin_client_over_websocket() {
    let master = start_ws_master().await;
    let _monitor = start_monitor(connector(&master.url), monitor_options("area-1", "area", 3101), Some(TOKEN))
        .await
        .unwrap();

    let id = AdminClient::generate_id();
    let admin = AdminClient::connect(
        connector(&master.url),
        id.clone(),
        ClientCredentials::new("admin", "admin-pw"),
        Duration::from_secs(2),
    )
    .await
    .unwrap();

    let listed = within(admin.command("list", "", Value::Null)).await.unwrap();
    assert_eq!(listed, json!({ "modules": [ECHO] }));

    let reply = within(admin.request(ECHO, json!({}))).await.unwrap();
    assert_eq!(reply["servers"], json!(["area-1"]));
    assert_eq!(master.recorder.calls()[0]["clientId"], id.as_str());

    let err = AdminClient::connect(
        connector(&master.url),
        "intruder",
        ClientCredentials::new("admin", "nope"),
        Duration::from_secs(2),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, Error::AuthFailed { .. }));
}

#[tokio::test]
async fn test_monitor_stop_over_websocket() {
    let master = start_ws_master().await;
    let mut events = master.service.subscribe();
    let monitor = start_monitor(connector(&master.url), monitor_options("area-1", "area", 3101), Some(TOKEN))
        .await
        .unwrap();

    monitor.service.stop();

    let (id, kind) = within(async {
        loop {
            if let Ok(ServiceEvent::Disconnect { id, kind, .. }) = events.recv().await {
                return (id, kind);
            }
        }
    })
    .await;
    assert_eq!(id, "area-1");
    assert_eq!(kind, PeerKind::Monitor);
    assert!(!master.service.master_agent().unwrap().is_connected("area-1"));
}

#[tokio::test]
async fn test_connect_to_nothing_fails() {
    let result = connector("ws://127.0.0.1:9").connect().await;
    assert!(result.is_err());

    assert!(WsConnector::new("http://127.0.0.1:3005", Duration::from_secs(1)).is_err());
}
