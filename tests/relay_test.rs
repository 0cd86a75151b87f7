//! Integration tests for the relay WebSocket server.
//!
//! These tests spin up a real relay on a random port, connect mock
//! surface/frame/host clients, and verify end-to-end routing behind the
//! hello handshake.
//!
//! Run with: cargo test --test relay_test

use std::sync::Arc;
use std::time::Duration;

use devframe::relay::{server, FrameMessageRouter, RelayServer, PROTOCOL_VERSION};
use devframe::storage::{StorageBridge, StorageScope};
use futures::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

const TOKEN: &str = "dfr_0123456789abcdef0123456789abcdef";

type Ws = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

struct Relay {
    port: u16,
    shutdown: CancellationToken,
    task: tokio::task::JoinHandle<devframe::Result<()>>,
    storage: Arc<StorageBridge>,
    _dir: tempfile::TempDir,
}

/// Start a relay on an ephemeral port with a fresh storage directory.
async fn start_relay() -> Relay {
    start_relay_with(|relay| relay).await
}

async fn start_relay_with(configure: impl FnOnce(RelayServer) -> RelayServer) -> Relay {
    let dir = tempfile::tempdir().unwrap();
    let storage = Arc::new(StorageBridge::open(dir.path()).unwrap());
    let router = Arc::new(FrameMessageRouter::new(Arc::clone(&storage)));
    let listener = server::bind(0).await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let shutdown = CancellationToken::new();
    let relay = configure(RelayServer::new(router, TOKEN));
    let task = tokio::spawn(relay.serve(listener, shutdown.clone()));

    Relay {
        port,
        shutdown,
        task,
        storage,
        _dir: dir,
    }
}

async fn ws_connect(port: u16) -> Ws {
    let url = format!("ws://127.0.0.1:{}", port);
    let (ws, _) = tokio_tungstenite::connect_async(&url)
        .await
        .expect("Failed to connect to relay");
    ws
}

async fn send_json(ws: &mut Ws, value: serde_json::Value) {
    ws.send(Message::Text(value.to_string().into()))
        .await
        .expect("Failed to send message");
}

/// Read one text message and parse as JSON.
async fn recv_json(ws: &mut Ws) -> serde_json::Value {
    loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => {
                return serde_json::from_str(text.as_str()).expect("Failed to parse JSON from relay");
            }
            Some(Ok(Message::Close(_))) => panic!("WebSocket closed unexpectedly"),
            Some(Err(e)) => panic!("WebSocket error: {}", e),
            None => panic!("WebSocket stream ended"),
            _ => continue,
        }
    }
}

async fn recv_json_timeout(ws: &mut Ws, timeout_ms: u64) -> Option<serde_json::Value> {
    tokio::time::timeout(Duration::from_millis(timeout_ms), recv_json(ws))
        .await
        .ok()
}

/// Read with a timeout, returning None on timeout, close or error.
async fn try_recv_json_timeout(ws: &mut Ws, timeout_ms: u64) -> Option<serde_json::Value> {
    let read = async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => return serde_json::from_str(text.as_str()).ok(),
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                _ => return None,
            }
        }
    };
    tokio::time::timeout(Duration::from_millis(timeout_ms), read)
        .await
        .ok()
        .flatten()
}

/// Connect and complete the hello handshake as `role`.
async fn connect_as(port: u16, role: &str) -> Ws {
    let mut ws = ws_connect(port).await;
    send_json(
        &mut ws,
        serde_json::json!({
            "type": "hello",
            "role": role,
            "version": PROTOCOL_VERSION,
            "token": TOKEN,
        }),
    )
    .await;

    let ack = recv_json_timeout(&mut ws, 3000)
        .await
        .expect("Should receive hello_ack");
    assert_eq!(ack["type"], "hello_ack");
    assert_eq!(ack["role"], role);
    ws
}

mod handshake {
    use super::*;

    #[tokio::test]
    async fn every_role_is_acknowledged() {
        let relay = start_relay().await;
        for role in ["surface", "frame", "host"] {
            connect_as(relay.port, role).await;
        }
    }

    #[tokio::test]
    async fn wrong_token_is_rejected() {
        let relay = start_relay().await;
        let mut ws = ws_connect(relay.port).await;
        send_json(
            &mut ws,
            serde_json::json!({
                "type": "hello",
                "role": "surface",
                "version": PROTOCOL_VERSION,
                "token": "dfr_wrong",
            }),
        )
        .await;

        let reply = recv_json_timeout(&mut ws, 3000).await.unwrap();
        assert_eq!(reply["type"], "hello_error");
        assert_eq!(reply["error"], "invalid_token");
    }

    #[tokio::test]
    async fn old_protocol_version_is_rejected() {
        let relay = start_relay().await;
        let mut ws = ws_connect(relay.port).await;
        send_json(
            &mut ws,
            serde_json::json!({ "type": "hello", "role": "frame", "version": "0.9.0", "token": TOKEN }),
        )
        .await;

        let reply = recv_json_timeout(&mut ws, 3000).await.unwrap();
        assert_eq!(reply["error"], "version_mismatch");
        assert_eq!(reply["required_version"], PROTOCOL_VERSION);
    }

    #[tokio::test]
    async fn unknown_role_is_rejected() {
        let relay = start_relay().await;
        let mut ws = ws_connect(relay.port).await;
        send_json(
            &mut ws,
            serde_json::json!({ "type": "hello", "role": "extension", "version": PROTOCOL_VERSION, "token": TOKEN }),
        )
        .await;

        let reply = recv_json_timeout(&mut ws, 3000).await.unwrap();
        assert_eq!(reply["error"], "unknown_role");
    }

    #[tokio::test]
    async fn first_message_must_be_hello() {
        let relay = start_relay().await;
        let mut ws = ws_connect(relay.port).await;
        send_json(&mut ws, serde_json::json!({ "command": "togglePicker", "enabled": true })).await;

        let reply = recv_json_timeout(&mut ws, 3000).await.unwrap();
        assert_eq!(reply["error"], "expected_hello");
    }

    #[tokio::test]
    async fn foreign_origin_is_refused() {
        let relay = start_relay().await;
        let mut request = format!("ws://127.0.0.1:{}", relay.port)
            .into_client_request()
            .unwrap();
        request
            .headers_mut()
            .insert("Origin", "https://evil.example".parse().unwrap());

        assert!(tokio_tungstenite::connect_async(request).await.is_err());
    }

    #[tokio::test]
    async fn allowed_origin_is_accepted() {
        let relay = start_relay_with(|r| r.allow_origin("https://tunnel.example.dev/")).await;
        let mut request = format!("ws://127.0.0.1:{}", relay.port)
            .into_client_request()
            .unwrap();
        request
            .headers_mut()
            .insert("Origin", "https://tunnel.example.dev".parse().unwrap());

        assert!(tokio_tungstenite::connect_async(request).await.is_ok());
    }
}

mod routing {
    use super::*;

    #[tokio::test]
    async fn enabling_picker_disables_snipper_and_reaches_frame() {
        let relay = start_relay().await;
        let mut surface = connect_as(relay.port, "surface").await;
        let mut frame = connect_as(relay.port, "frame").await;

        send_json(&mut surface, serde_json::json!({ "command": "togglePicker", "enabled": true })).await;

        let to_surface = recv_json_timeout(&mut surface, 3000).await.unwrap();
        assert_eq!(to_surface, serde_json::json!({ "command": "toggleSnipper", "enabled": false }));
        let to_frame = recv_json_timeout(&mut frame, 3000).await.unwrap();
        assert_eq!(to_frame, serde_json::json!({ "command": "togglePicker", "enabled": true }));
    }

    #[tokio::test]
    async fn picked_element_reaches_host_and_resets_surface() {
        let relay = start_relay().await;
        let mut surface = connect_as(relay.port, "surface").await;
        let mut frame = connect_as(relay.port, "frame").await;
        let mut host = connect_as(relay.port, "host").await;

        send_json(
            &mut frame,
            serde_json::json!({ "command": "elementPicked", "text": "<button>Save</button>" }),
        )
        .await;

        let picked = recv_json_timeout(&mut host, 3000).await.unwrap();
        assert_eq!(picked["command"], "elementPicked");
        assert_eq!(picked["text"], "<button>Save</button>");
        let reset = recv_json_timeout(&mut surface, 3000).await.unwrap();
        assert_eq!(reset, serde_json::json!({ "command": "togglePicker", "enabled": false }));
    }

    #[tokio::test]
    async fn storage_update_broadcasts_and_persists() {
        let relay = start_relay().await;
        let mut surface = connect_as(relay.port, "surface").await;
        let mut frame = connect_as(relay.port, "frame").await;

        send_json(
            &mut frame,
            serde_json::json!({
                "command": "storageUpdate",
                "scope": "local",
                "action": "set",
                "key": "theme",
                "value": "dark",
            }),
        )
        .await;

        let expected = serde_json::json!({
            "command": "storageData",
            "scope": "local",
            "data": { "theme": "dark" },
        });
        assert_eq!(recv_json_timeout(&mut surface, 3000).await.unwrap(), expected);
        assert_eq!(recv_json_timeout(&mut frame, 3000).await.unwrap(), expected);

        let reopened = StorageBridge::open(relay.storage.dir()).unwrap();
        assert_eq!(
            reopened.read(StorageScope::Local).get("theme").map(String::as_str),
            Some("dark")
        );
    }

    #[tokio::test]
    async fn storage_request_is_answered_to_sender_only() {
        let relay = start_relay().await;
        let mut surface = connect_as(relay.port, "surface").await;
        let mut frame = connect_as(relay.port, "frame").await;

        send_json(&mut frame, serde_json::json!({ "command": "storageRequest", "scope": "session" })).await;

        let reply = recv_json_timeout(&mut frame, 3000).await.unwrap();
        assert_eq!(reply["command"], "storageData");
        assert_eq!(reply["scope"], "session");
        assert_eq!(reply["data"], serde_json::json!({}));
        assert!(try_recv_json_timeout(&mut surface, 300).await.is_none());
    }

    #[tokio::test]
    async fn malformed_frames_are_ignored() {
        let relay = start_relay().await;
        let mut surface = connect_as(relay.port, "surface").await;
        let mut frame = connect_as(relay.port, "frame").await;

        send_json(&mut surface, serde_json::json!({ "command": "noSuchCommand" })).await;
        surface.send(Message::Text("not json".into())).await.unwrap();
        assert!(try_recv_json_timeout(&mut frame, 300).await.is_none());

        // Connection is still usable afterwards
        send_json(&mut surface, serde_json::json!({ "command": "toggleSnipper", "enabled": false })).await;
        let to_frame = recv_json_timeout(&mut frame, 3000).await.unwrap();
        assert_eq!(to_frame["command"], "toggleSnipper");
    }
}

mod lifecycle {
    use super::*;

    #[tokio::test]
    async fn shutdown_stops_the_server() {
        let relay = start_relay().await;
        let _surface = connect_as(relay.port, "surface").await;

        relay.shutdown.cancel();
        let result = tokio::time::timeout(Duration::from_secs(3), relay.task)
            .await
            .expect("relay should stop promptly")
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn occupied_port_is_a_bind_failure() {
        let relay = start_relay().await;
        let err = server::bind(relay.port).await.unwrap_err();
        assert!(matches!(err, devframe::DevframeError::BindFailure { .. }));
    }
}
