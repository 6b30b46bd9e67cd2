use std::sync::Arc;

use crate::manager::SessionManager;
use crate::sink::ChannelBroadcastSink;

/// Application state for the HTTP server: the session manager and the
/// channel-backed sink the WebSocket handler subscribes to.
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<SessionManager>,
    pub sink: Arc<ChannelBroadcastSink>,
}

impl AppState {
    pub fn new(manager: Arc<SessionManager>, sink: Arc<ChannelBroadcastSink>) -> Self {
        Self { manager, sink }
    }
}
