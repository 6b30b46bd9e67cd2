//! Integration tests for the Axum HTTP/WebSocket server.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use stream_relay::catalog::InMemoryCatalog;
use stream_relay::decoder::test_util::MockSpawner;
use stream_relay::manager::SessionManager;
use stream_relay::server::routes::create_router;
use stream_relay::server::AppState;
use stream_relay::sink::ChannelBroadcastSink;
use stream_relay::types::StreamId;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;

fn jpeg(tag: u8) -> Vec<u8> {
    let mut v = vec![0xFF, 0xD8];
    v.extend(std::iter::repeat(tag).take(150));
    v.extend_from_slice(&[0xFF, 0xD9]);
    v
}

fn test_state() -> AppState {
    let catalog = Arc::new(InMemoryCatalog::new());
    catalog.insert(StreamId::from("a"), "rtsp://example/s");
    let sink = Arc::new(ChannelBroadcastSink::new());
    let spawner = Arc::new(MockSpawner::with_frames(vec![jpeg(1), jpeg(2)]));

    let mut config = stream_relay::config::RelayConfig::default();
    config.target_fps = 1000;
    let manager = SessionManager::new(&config, catalog, sink.clone(), spawner);
    AppState::new(manager, sink)
}

async fn start_test_server() -> (SocketAddr, tokio::task::JoinHandle<()>) {
    let state = test_state();
    let app = create_router(state);

    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("failed to bind to port");
    let addr = listener.local_addr().expect("failed to get local address");

    let handle = tokio::spawn(async move {
        axum::serve(listener, app).await.expect("server error");
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    (addr, handle)
}

#[tokio::test]
async fn health_endpoint_returns_200_ok() {
    let (addr, _handle) = start_test_server().await;

    let client = reqwest::Client::new();
    let response = client
        .get(format!("http://{addr}/health"))
        .send()
        .await
        .expect("failed to send request");

    assert_eq!(response.status(), 200);
}

#[tokio::test]
async fn unknown_route_returns_404() {
    let (addr, _handle) = start_test_server().await;

    let client = reqwest::Client::new();
    let response = client
        .get(format!("http://{addr}/nonexistent"))
        .send()
        .await
        .expect("failed to send request");

    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn websocket_stream_delivers_frames_for_known_stream() {
    let (addr, _handle) = start_test_server().await;
    let url = format!("ws://{addr}/stream/a");

    let (mut ws, _) = tokio_tungstenite::connect_async(url)
        .await
        .expect("failed to connect websocket");

    let mut frame_count = 0;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while frame_count < 2 && tokio::time::Instant::now() < deadline {
        if let Ok(Some(Ok(Message::Text(text)))) =
            tokio::time::timeout(Duration::from_millis(500), ws.next()).await
        {
            let value: serde_json::Value = serde_json::from_str(&text).unwrap();
            if value["type"] == "stream_frame" {
                frame_count += 1;
            }
        }
    }

    assert_eq!(frame_count, 2);
}

#[tokio::test]
async fn websocket_stream_errors_for_unknown_stream() {
    let (addr, _handle) = start_test_server().await;
    let url = format!("ws://{addr}/stream/missing");

    let (mut ws, _) = tokio_tungstenite::connect_async(url)
        .await
        .expect("failed to connect websocket");

    let message = tokio::time::timeout(Duration::from_secs(1), ws.next())
        .await
        .expect("timed out waiting for error")
        .expect("stream ended unexpectedly")
        .expect("websocket error");

    let text = match message {
        Message::Text(text) => text,
        other => panic!("expected text message, got {other:?}"),
    };
    let value: serde_json::Value = serde_json::from_str(&text).unwrap();
    assert_eq!(value["type"], "stream_error");
}

#[tokio::test]
async fn websocket_ping_is_answered_with_pong() {
    let (addr, _handle) = start_test_server().await;
    let url = format!("ws://{addr}/stream/a");

    let (mut ws, _) = tokio_tungstenite::connect_async(url)
        .await
        .expect("failed to connect websocket");

    ws.send(Message::Text(r#"{"type":"ping"}"#.to_string().into()))
        .await
        .expect("failed to send ping");

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    let mut saw_pong = false;
    while tokio::time::Instant::now() < deadline {
        if let Ok(Some(Ok(Message::Text(text)))) =
            tokio::time::timeout(Duration::from_millis(500), ws.next()).await
        {
            let value: serde_json::Value = serde_json::from_str(&text).unwrap();
            if value["type"] == "pong" {
                saw_pong = true;
                break;
            }
        }
    }

    assert!(saw_pong);
}
