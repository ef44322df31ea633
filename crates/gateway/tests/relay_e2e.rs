//! End-to-end: real HTTP server, real worker WebSocket, real HTTP caller.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use {
    futures::{SinkExt, StreamExt},
    serde_json::{Value, json},
    tokio::net::TcpListener,
    tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message},
    tokio_util::sync::CancellationToken,
};

use {
    botlink_bots::BotRepository,
    botlink_config::BotlinkConfig,
    botlink_gateway::{AppState, RelayService, RelaySettings, build_gateway_app, serve},
    botlink_store::MemoryRecordStore,
};

type WorkerSocket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

struct TestServer {
    addr: SocketAddr,
    relay: Arc<RelayService>,
    shutdown: CancellationToken,
}

impl TestServer {
    async fn start(config: BotlinkConfig) -> Self {
        let bots = Arc::new(BotRepository::new(Arc::new(MemoryRecordStore::new())));
        bots.register("echo-bot", Some("s3cr3t".into()), None)
            .await
            .unwrap();
        let relay = Arc::new(RelayService::new(bots, RelaySettings::from(&config.relay)));
        let app = build_gateway_app(AppState::new(Arc::clone(&relay), &config), &config.server)
            .unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        tokio::spawn(serve(listener, app, shutdown.clone()));
        Self {
            addr,
            relay,
            shutdown,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    async fn connect_worker(&self, name: &str, secret: &str) -> (WorkerSocket, Value) {
        let (mut socket, _) = connect_async(format!("ws://{}/ws", self.addr))
            .await
            .unwrap();
        let handshake = json!({"identityName": name, "secret": secret}).to_string();
        socket.send(Message::text(handshake)).await.unwrap();
        let reply = next_json(&mut socket).await.unwrap();
        (socket, reply)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn next_json(socket: &mut WorkerSocket) -> Option<Value> {
    while let Some(msg) = socket.next().await {
        match msg.ok()? {
            Message::Text(text) => return serde_json::from_str(text.as_str()).ok(),
            Message::Close(_) => return None,
            _ => continue,
        }
    }
    None
}

/// Read until the gateway closes the socket, returning the close code.
async fn next_close_code(socket: &mut WorkerSocket) -> Option<u16> {
    while let Some(msg) = socket.next().await {
        match msg.ok()? {
            Message::Close(frame) => return frame.map(|f| u16::from(f.code)),
            _ => continue,
        }
    }
    None
}

async fn open_socket(addr: SocketAddr) -> WorkerSocket {
    let (socket, _) = connect_async(format!("ws://{addr}/ws")).await.unwrap();
    socket
}

fn spawn_echo_worker(mut socket: WorkerSocket) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(frame) = next_json(&mut socket).await {
            if frame["type"] == "event" {
                let reply = json!({
                    "type": "reply",
                    "correlationId": frame["correlationId"],
                    "payload": frame["payload"],
                });
                if socket.send(Message::text(reply.to_string())).await.is_err() {
                    break;
                }
            }
        }
    })
}

async fn wait_for_connections(relay: &RelayService, n: usize) {
    for _ in 0..100 {
        if relay.registry().len() == n {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("expected {n} connections, have {}", relay.registry().len());
}

#[tokio::test]
async fn echo_bot_round_trip() {
    let server = TestServer::start(BotlinkConfig::default()).await;
    let (socket, hello) = server.connect_worker("echo-bot", "s3cr3t").await;
    assert_eq!(hello["type"], "hello");
    assert_eq!(hello["botName"], "echo-bot");
    spawn_echo_worker(socket);
    wait_for_connections(&server.relay, 1).await;

    let resp = reqwest::Client::new()
        .post(server.url("/api/messages/echo-bot"))
        .json(&json!({"text": "hi"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body, json!({"text": "hi"}));
}

#[tokio::test]
async fn silent_worker_yields_gateway_timeout() {
    let server = TestServer::start(BotlinkConfig::default()).await;
    let (_socket, hello) = server.connect_worker("echo-bot", "s3cr3t").await;
    assert_eq!(hello["type"], "hello");
    wait_for_connections(&server.relay, 1).await;

    let started = std::time::Instant::now();
    let resp = reqwest::Client::new()
        .post(server.url("/api/messages/echo-bot?timeout_ms=100"))
        .json(&json!({"text": "hi"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 504);
    assert!(started.elapsed() >= Duration::from_millis(100));
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "TIMEOUT");
    assert_eq!(server.relay.pending_count(), 0);
}

#[tokio::test]
async fn wrong_secret_is_rejected_and_bot_stays_offline() {
    let server = TestServer::start(BotlinkConfig::default()).await;
    let (mut socket, reply) = server.connect_worker("echo-bot", "nope").await;
    assert_eq!(reply["type"], "error");
    assert_eq!(reply["error"]["code"], "UNAUTHORIZED");
    assert!(next_json(&mut socket).await.is_none());

    let resp = reqwest::Client::new()
        .post(server.url("/api/messages/echo-bot"))
        .json(&json!({}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 503);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "NOT_CONNECTED");
}

#[tokio::test]
async fn worker_disconnect_fails_request_with_bad_gateway() {
    let server = TestServer::start(BotlinkConfig::default()).await;
    let (mut socket, _) = server.connect_worker("echo-bot", "s3cr3t").await;
    wait_for_connections(&server.relay, 1).await;

    let request = tokio::spawn({
        let url = server.url("/api/messages/echo-bot?timeout_ms=30000");
        async move {
            reqwest::Client::new()
                .post(url)
                .json(&json!({"text": "hi"}))
                .send()
                .await
                .unwrap()
        }
    });
    let event = next_json(&mut socket).await.unwrap();
    assert_eq!(event["type"], "event");
    drop(socket);

    let resp = tokio::time::timeout(Duration::from_secs(5), request)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(resp.status(), 502);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "CONNECTION_LOST");
}

#[tokio::test]
async fn reconnect_replaces_previous_socket() {
    let server = TestServer::start(BotlinkConfig::default()).await;
    let (mut first, _) = server.connect_worker("echo-bot", "s3cr3t").await;
    let (second, hello) = server.connect_worker("echo-bot", "s3cr3t").await;
    assert_eq!(hello["type"], "hello");

    // The first socket is closed by the gateway.
    assert!(next_json(&mut first).await.is_none());
    spawn_echo_worker(second);
    wait_for_connections(&server.relay, 1).await;

    let resp = reqwest::Client::new()
        .post(server.url("/api/messages/echo-bot"))
        .json(&json!({"n": 2}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
}

#[tokio::test]
async fn admin_api_from_loopback() {
    let server = TestServer::start(BotlinkConfig::default()).await;
    let client = reqwest::Client::new();

    let resp = client
        .post(server.url("/api/bots"))
        .json(&json!({"name": "new-bot", "description": "fresh"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);
    let created: Value = resp.json().await.unwrap();
    let secret = created["secret"].as_str().unwrap().to_string();
    assert!(!secret.is_empty());

    let dup = client
        .post(server.url("/api/bots"))
        .json(&json!({"name": "new-bot"}))
        .send()
        .await
        .unwrap();
    assert_eq!(dup.status(), 409);

    let (_socket, hello) = server.connect_worker("new-bot", &secret).await;
    assert_eq!(hello["type"], "hello");
    wait_for_connections(&server.relay, 1).await;

    let bots: Value = client
        .get(server.url("/api/bots"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let listed = bots
        .as_array()
        .unwrap()
        .iter()
        .find(|b| b["name"] == "new-bot")
        .unwrap();
    assert_eq!(listed["connected"], true);
    assert!(listed.get("secret").is_none());

    let conns: Value = client
        .get(server.url("/api/connections"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(conns[0]["botName"], "new-bot");

    let del = client
        .delete(server.url("/api/bots/new-bot"))
        .send()
        .await
        .unwrap();
    assert_eq!(del.status(), 204);
    wait_for_connections(&server.relay, 0).await;

    let missing = client
        .delete(server.url("/api/bots/new-bot"))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), 404);
}

#[tokio::test]
async fn admin_token_is_enforced() {
    let mut config = BotlinkConfig::default();
    config.server.admin_token = Some("admin-t".into());
    let server = TestServer::start(config).await;
    let client = reqwest::Client::new();

    let denied = client.get(server.url("/api/bots")).send().await.unwrap();
    assert_eq!(denied.status(), 401);

    let allowed = client
        .get(server.url("/api/bots"))
        .bearer_auth("admin-t")
        .send()
        .await
        .unwrap();
    assert_eq!(allowed.status(), 200);

    let health = client.get(server.url("/health")).send().await.unwrap();
    assert_eq!(health.status(), 200);
}

#[tokio::test]
async fn missing_handshake_times_out_with_policy_close() {
    let mut config = BotlinkConfig::default();
    config.relay.handshake_timeout_ms = 100;
    let server = TestServer::start(config).await;
    let mut socket = open_socket(server.addr).await;

    let started = std::time::Instant::now();
    let reply = next_json(&mut socket).await.unwrap();
    assert!(started.elapsed() >= Duration::from_millis(100));
    assert_eq!(reply["type"], "error");
    assert_eq!(reply["error"]["code"], "INVALID_REQUEST");
    assert_eq!(next_close_code(&mut socket).await, Some(1008));
    assert!(server.relay.registry().is_empty());
}

#[tokio::test]
async fn binary_or_garbled_handshake_is_rejected() {
    let server = TestServer::start(BotlinkConfig::default()).await;

    let mut binary = open_socket(server.addr).await;
    binary
        .send(Message::binary(vec![0x01, 0x02, 0x03]))
        .await
        .unwrap();
    let reply = next_json(&mut binary).await.unwrap();
    assert_eq!(reply["type"], "error");
    assert_eq!(reply["error"]["code"], "INVALID_REQUEST");
    assert_eq!(next_close_code(&mut binary).await, Some(1008));

    let mut garbled = open_socket(server.addr).await;
    garbled.send(Message::text("{not json")).await.unwrap();
    let reply = next_json(&mut garbled).await.unwrap();
    assert_eq!(reply["error"]["code"], "INVALID_REQUEST");
    assert_eq!(next_close_code(&mut garbled).await, Some(1008));

    assert!(server.relay.registry().is_empty());
}

#[tokio::test]
async fn websocket_pings_keep_worker_alive() {
    let mut config = BotlinkConfig::default();
    config.relay.idle_timeout_ms = 300;
    let server = TestServer::start(config).await;
    let (mut socket, hello) = server.connect_worker("echo-bot", "s3cr3t").await;
    assert_eq!(hello["type"], "hello");
    wait_for_connections(&server.relay, 1).await;

    // Only transport-level pings, for longer than the idle timeout.
    for _ in 0..10 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        socket
            .send(Message::Ping(b"beat".to_vec().into()))
            .await
            .unwrap();
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    let report = server.relay.maintain().await;
    assert_eq!(report.idle_evicted, 0);
    assert_eq!(server.relay.registry().len(), 1);

    tokio::time::sleep(Duration::from_millis(400)).await;
    let report = server.relay.maintain().await;
    assert_eq!(report.idle_evicted, 1);
    assert_eq!(next_close_code(&mut socket).await, Some(4001));
}
