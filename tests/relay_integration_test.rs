// End-to-end tests against real listeners.
//
// Each test starts one or two relays on reserved loopback ports, drives them
// over HTTP with reqwest and over WebSocket with the bundled push client.

use std::sync::Arc;
use std::time::Duration;

use pushrelay::push::protocol::{ClientMessage, ServerMessage};
use pushrelay::storage::{ChannelStore, MemoryStore};
use pushrelay::ws::{self, PushReader, PushWriter};
use pushrelay::{Relay, RelayConfig, RunningRelay};

const WAIT: Duration = Duration::from_secs(5);

/// Grab a free port. Racy, but good enough for loopback tests.
fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn config(nodes: &[String], shard_port: u16) -> RelayConfig {
    let mut config = RelayConfig {
        host: "127.0.0.1".to_string(),
        port: free_port(),
        shutdown_grace_secs: 2,
        ..RelayConfig::default()
    };
    config.shard.current_host = "127.0.0.1".to_string();
    config.shard.port = shard_port;
    config.shard.nodes = nodes.to_vec();
    config.router.forward_timeout_ms = 1_000;
    config.validate().unwrap();
    config
}

async fn start(config: RelayConfig, store: Arc<dyn ChannelStore>) -> RunningRelay {
    Relay::start(config, store).await.unwrap()
}

async fn start_single() -> RunningRelay {
    start(config(&[], free_port()), Arc::new(MemoryStore::new())).await
}

/// Single node with one-second hello and keepalive windows.
async fn start_impatient() -> RunningRelay {
    let mut config = config(&[], free_port());
    config.push.ping_interval_secs = 1;
    config.push.pong_timeout_secs = 1;
    config.push.hello_timeout_secs = 1;
    start(config, Arc::new(MemoryStore::new())).await
}

/// Two nodes sharing one store. Returns the nodes' shard addresses too.
async fn start_pair() -> (RunningRelay, RunningRelay, Vec<String>) {
    let (shard_a, shard_b) = (free_port(), free_port());
    let nodes = vec![format!("127.0.0.1:{shard_a}"), format!("127.0.0.1:{shard_b}")];
    let store = Arc::new(MemoryStore::new());

    let a = start(config(&nodes, shard_a), Arc::clone(&store) as Arc<dyn ChannelStore>).await;
    let b = start(config(&nodes, shard_b), Arc::clone(&store) as Arc<dyn ChannelStore>).await;
    (a, b, nodes)
}

fn base_url(relay: &RunningRelay) -> String {
    format!("http://{}", relay.local_addr("main").unwrap())
}

/// Connect and handshake as `uaid`, announcing `channels`.
async fn client(relay: &RunningRelay, uaid: &str, channels: &[(&str, u64)]) -> (PushWriter, PushReader) {
    let (mut writer, mut reader) = ws::connect(&format!("{}/", base_url(relay))).await.unwrap();
    writer.hello(Some(uaid), channels).await.unwrap();
    match reader.expect_message(WAIT).await.unwrap() {
        ServerMessage::Hello { uaid: got, status } => {
            assert_eq!(got, uaid);
            assert_eq!(status, 200);
        }
        other => panic!("expected hello reply, got {other:?}"),
    }
    (writer, reader)
}

/// Connect without a UAID and return the one the relay assigned.
async fn fresh_client(relay: &RunningRelay, channels: &[(&str, u64)]) -> (PushWriter, PushReader, String) {
    let (mut writer, mut reader) = ws::connect(&format!("{}/", base_url(relay))).await.unwrap();
    writer.hello(None, channels).await.unwrap();
    match reader.expect_message(WAIT).await.unwrap() {
        ServerMessage::Hello { uaid, status: 200 } => (writer, reader, uaid),
        other => panic!("expected hello reply, got {other:?}"),
    }
}

async fn post_update(relay: &RunningRelay, uaid: &str, chid: &str, body: &str) -> serde_json::Value {
    let response = reqwest::Client::new()
        .post(format!("{}/update/{uaid}/{chid}", base_url(relay)))
        .body(body.to_string())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    response.json().await.unwrap()
}

#[tokio::test]
async fn test_update_reaches_connected_client_once() {
    let relay = start_single().await;
    let (_writer, mut reader) = client(&relay, "u1", &[("c1", 0)]).await;

    let body = post_update(&relay, "u1", "c1", "version=5").await;
    assert_eq!(body["applied"], true);
    assert_eq!(body["delivery"], "delivered");

    assert_eq!(
        reader.expect_message(WAIT).await.unwrap(),
        ServerMessage::Notification {
            chid: "c1".into(),
            version: 5
        }
    );

    let body = post_update(&relay, "u1", "c1", "version=3").await;
    assert_eq!(body["applied"], false);
    assert_eq!(body["delivery"], "skipped");
    assert!(reader.expect_message(Duration::from_millis(300)).await.is_err());

    relay.shutdown().await;
}

#[tokio::test]
async fn test_reconnect_evicts_and_resyncs() {
    let relay = start_single().await;

    let body = post_update(&relay, "u2", "c1", "5").await;
    assert_eq!(body["delivery"], "not_connected");

    let (_old_writer, mut old_reader) = client(&relay, "u2", &[("c1", 5)]).await;
    let (_writer, mut reader) = client(&relay, "u2", &[("c1", 2)]).await;

    assert_eq!(old_reader.expect_close(WAIT).await.unwrap(), 1000);
    assert_eq!(
        reader.expect_message(WAIT).await.unwrap(),
        ServerMessage::Notification {
            chid: "c1".into(),
            version: 5
        }
    );
    assert_eq!(relay.registry().len(), 1);

    relay.shutdown().await;
}

#[tokio::test]
async fn test_malformed_frame_closes_with_protocol_error() {
    let relay = start_single().await;
    let (mut writer, mut reader) = client(&relay, "u3", &[]).await;

    writer.send_raw("{not json").await.unwrap();
    assert_eq!(reader.expect_close(WAIT).await.unwrap(), 1002);

    relay.shutdown().await;
}

#[tokio::test]
async fn test_update_is_forwarded_to_owning_node() {
    let (a, b, nodes) = start_pair().await;

    let uaid = (0..1_000)
        .map(|i| format!("user{i}"))
        .find(|uaid| a.router().resolve(uaid).as_str() == nodes[1])
        .unwrap();
    assert_eq!(b.router().resolve(&uaid).as_str(), nodes[1]);

    let (_writer, mut reader) = client(&b, &uaid, &[("c1", 0)]).await;

    let body = post_update(&a, &uaid, "c1", r#"{"version": 9}"#).await;
    assert_eq!(body["applied"], true);
    assert_eq!(body["delivery"], "forwarded");
    assert_eq!(body["node"], nodes[1].as_str());

    assert_eq!(
        reader.expect_message(WAIT).await.unwrap(),
        ServerMessage::Notification {
            chid: "c1".into(),
            version: 9
        }
    );

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn test_fresh_client_is_assigned_a_locally_owned_uaid() {
    let (a, b, nodes) = start_pair().await;

    for (relay, node) in [(&a, &nodes[0]), (&b, &nodes[1])] {
        let (_writer, mut reader, uaid) = fresh_client(relay, &[("c1", 0)]).await;
        assert_eq!(a.router().resolve(&uaid).as_str(), node.as_str());

        let body = post_update(relay, &uaid, "c1", "5").await;
        assert_eq!(body["delivery"], "delivered");
        assert_eq!(
            reader.expect_message(WAIT).await.unwrap(),
            ServerMessage::Notification {
                chid: "c1".into(),
                version: 5
            }
        );
    }

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn test_connected_client_is_served_by_its_node_whatever_the_owner() {
    let (a, b, nodes) = start_pair().await;

    // Owned by A in the shard map, but connected to B
    let uaid = (0..1_000)
        .map(|i| format!("user{i}"))
        .find(|uaid| a.router().resolve(uaid).as_str() == nodes[0])
        .unwrap();
    let (_writer, mut reader) = client(&b, &uaid, &[("c1", 0)]).await;

    let body = post_update(&b, &uaid, "c1", "3").await;
    assert_eq!(body["applied"], true);
    assert_eq!(body["delivery"], "delivered");
    assert_eq!(
        reader.expect_message(WAIT).await.unwrap(),
        ServerMessage::Notification {
            chid: "c1".into(),
            version: 3
        }
    );

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn test_silent_client_is_pinged_then_dropped() {
    let relay = start_impatient().await;
    let (_writer, mut reader) = client(&relay, "u5", &[]).await;

    assert_eq!(reader.expect_message(WAIT).await.unwrap(), ServerMessage::Ping);
    assert_eq!(reader.expect_close(WAIT).await.unwrap(), 1001);

    let deadline = tokio::time::Instant::now() + WAIT;
    while !relay.registry().is_empty() {
        assert!(tokio::time::Instant::now() < deadline, "dropped client still registered");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    relay.shutdown().await;
}

#[tokio::test]
async fn test_missing_hello_closes_with_protocol_error() {
    let relay = start_impatient().await;
    let (_writer, mut reader) = ws::connect(&format!("{}/", base_url(&relay))).await.unwrap();

    assert_eq!(reader.expect_close(WAIT).await.unwrap(), 1002);
    assert!(relay.registry().is_empty());

    relay.shutdown().await;
}

#[tokio::test]
async fn test_request_before_hello_closes_with_protocol_error() {
    let relay = start_single().await;
    let (mut writer, mut reader) = ws::connect(&format!("{}/", base_url(&relay))).await.unwrap();

    writer.register("c1").await.unwrap();
    assert_eq!(reader.expect_close(WAIT).await.unwrap(), 1002);

    relay.shutdown().await;
}

#[tokio::test]
async fn test_register_ack_and_unregister() {
    let relay = start_single().await;
    let (mut writer, mut reader) = client(&relay, "u6", &[]).await;

    writer.register("c9").await.unwrap();
    assert_eq!(
        reader.expect_message(WAIT).await.unwrap(),
        ServerMessage::Register {
            chid: "c9".into(),
            status: 200
        }
    );

    writer.register("bad.chid").await.unwrap();
    assert_eq!(
        reader.expect_message(WAIT).await.unwrap(),
        ServerMessage::Register {
            chid: "bad.chid".into(),
            status: 400
        }
    );

    // Ack has no reply; the ping round trip orders it
    writer.ack("c9", 4).await.unwrap();
    writer.send(&ClientMessage::Ping).await.unwrap();
    assert_eq!(reader.expect_message(WAIT).await.unwrap(), ServerMessage::Pong);
    let handle = relay.registry().lookup("u6").unwrap();
    assert_eq!(handle.last_acked("c9"), Some(4));

    writer
        .send(&ClientMessage::Unregister { chid: "c9".into() })
        .await
        .unwrap();
    assert_eq!(
        reader.expect_message(WAIT).await.unwrap(),
        ServerMessage::Unregister {
            chid: "c9".into(),
            status: 200
        }
    );
    assert_eq!(handle.last_acked("c9"), None);

    relay.shutdown().await;
}

#[tokio::test]
async fn test_repeated_hello_must_keep_uaid() {
    let relay = start_single().await;
    let (mut writer, mut reader) = client(&relay, "u7", &[]).await;

    writer.hello(Some("u7"), &[]).await.unwrap();
    assert_eq!(
        reader.expect_message(WAIT).await.unwrap(),
        ServerMessage::Hello {
            uaid: "u7".into(),
            status: 200
        }
    );

    writer.hello(Some("u8"), &[]).await.unwrap();
    assert_eq!(reader.expect_close(WAIT).await.unwrap(), 1002);

    relay.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_closes_clients_and_is_single_shot() {
    let relay = start_single().await;
    let (_writer, mut reader) = client(&relay, "u4", &[]).await;
    assert_eq!(relay.registry().len(), 1);

    assert!(relay.shutdown().await);
    assert!(!relay.shutdown().await);

    assert_eq!(reader.expect_close(WAIT).await.unwrap(), 1001);
    assert!(relay.is_stopped());
    assert!(relay.router().is_closed());
    assert_eq!(relay.active_tasks(), 0);
    assert!(relay.registry().is_empty());

    let refused = reqwest::Client::new()
        .post(format!("{}/update/u4/c1", base_url(&relay)))
        .body("1")
        .timeout(Duration::from_secs(1))
        .send()
        .await;
    assert!(refused.is_err(), "listener still accepting after shutdown");
}

#[tokio::test]
async fn test_status_endpoints() {
    let relay = start_single().await;
    let http = reqwest::Client::new();

    let status: serde_json::Value = http
        .get(format!("{}/status/", base_url(&relay)))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["status"], "OK");

    let real: serde_json::Value = http
        .get(format!("{}/realstatus/", base_url(&relay)))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(real["healthy"], true);
    assert_eq!(real["clients"], 0);

    relay.shutdown().await;
}

#[tokio::test]
async fn test_second_relay_on_same_port_fails_to_start() {
    let relay = start_single().await;
    let mut clash = config(&[], free_port());
    clash.port = relay.local_addr("main").unwrap().port();

    let err = Relay::start(clash, Arc::new(MemoryStore::new())).await.unwrap_err();
    assert!(err.to_string().contains("main"), "unexpected error: {err}");

    relay.shutdown().await;
}
