use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use futures_util::SinkExt;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::sink::StreamEvent;
use crate::types::StreamId;

use super::state::AppState;

pub async fn stream_ws_handler(
    ws: WebSocketUpgrade,
    Path(stream_id): Path<String>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let stream_id = StreamId::from(stream_id);
    ws.on_upgrade(move |socket| handle_socket(socket, stream_id, state))
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMessage {
    Ping,
    #[serde(other)]
    Unknown,
}

async fn handle_socket(mut socket: WebSocket, stream_id: StreamId, state: AppState) {
    // Subscribe to the broadcast channel before asking the manager to join
    // the session: `subscribe` may spawn the pump, which can publish its
    // "connected" status on another worker thread before this handler gets
    // a chance to create the channel, silently dropping that first event.
    let mut events = state.sink.subscribe(&stream_id);

    if let Err(e) = state.manager.subscribe(&stream_id).await {
        let payload = json!({
            "type": "stream_error",
            "stream_id": stream_id.as_str(),
            "message": e.to_string(),
        });
        let _ = socket.send(Message::Text(payload.to_string().into())).await;
        let _ = socket.close().await;
        return;
    }

    loop {
        tokio::select! {
            event = events.recv() => {
                match event {
                    Ok(event) => {
                        let text = encode_event(&stream_id, event);
                        if socket.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        if let Ok(ClientMessage::Ping) = serde_json::from_str(&text) {
                            let pong = json!({ "type": "pong" }).to_string();
                            if socket.send(Message::Text(pong.into())).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }

    state.manager.unsubscribe(&stream_id).await;
}

#[derive(Serialize)]
struct FramePayload<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    stream_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    frame: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

fn encode_event(stream_id: &StreamId, event: StreamEvent) -> String {
    let payload = match event {
        StreamEvent::Frame { frame_base64 } => FramePayload {
            kind: "stream_frame",
            stream_id: stream_id.as_str(),
            frame: Some(frame_base64),
            message: None,
        },
        StreamEvent::Status { message } => FramePayload {
            kind: "stream_status",
            stream_id: stream_id.as_str(),
            frame: None,
            message: Some(message),
        },
        StreamEvent::Error { message } => FramePayload {
            kind: "stream_error",
            stream_id: stream_id.as_str(),
            frame: None,
            message: Some(message),
        },
    };
    serde_json::to_string(&payload).unwrap_or_default()
}
