use axum::{routing::get, Router};
use tower_http::trace::TraceLayer;

use super::state::AppState;
use super::ws::stream_ws_handler;

async fn health_check() -> &'static str {
    "ok"
}

/// Creates the Axum router: a liveness probe and the stream-scoped WebSocket
/// endpoint that implements the client protocol.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/stream/{stream_id}", get(stream_ws_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
