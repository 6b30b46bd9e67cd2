use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::types::StreamId;

/// Event published by a session to everything downstream of it. Publish is
/// synchronous and best-effort: the session does not wait on, or retry, a
/// failed delivery. Frames are pre-encoded as base64 by the session so the
/// sink never touches raw JPEG bytes.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Frame { frame_base64: String },
    Status { message: String },
    Error { message: String },
}

/// The capability a session uses to deliver events to its subscribers. The
/// core depends only on this trait; it has no knowledge of WebSockets.
pub trait BroadcastSink: Send + Sync {
    fn publish(&self, stream_id: &StreamId, event: StreamEvent);
}

const CHANNEL_CAPACITY: usize = 32;

/// Channel-backed implementation: one `broadcast` channel per stream id,
/// created lazily on first publish or first subscribe. A slow or absent
/// receiver only ever loses frames (lag), never blocks the publisher.
#[derive(Default)]
pub struct ChannelBroadcastSink {
    channels: DashMap<StreamId, broadcast::Sender<StreamEvent>>,
}

impl ChannelBroadcastSink {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribes to a stream's event channel, creating it if this is the
    /// first subscriber. Used by the WebSocket handler on client connect.
    pub fn subscribe(&self, stream_id: &StreamId) -> broadcast::Receiver<StreamEvent> {
        self.channels
            .entry(stream_id.clone())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }
}

impl BroadcastSink for ChannelBroadcastSink {
    fn publish(&self, stream_id: &StreamId, event: StreamEvent) {
        if let Some(tx) = self.channels.get(stream_id) {
            // No receivers is not an error; the event is simply dropped.
            let _ = tx.send(event);
        }
    }
}

#[cfg(test)]
pub mod test_util {
    use super::*;
    use std::sync::Mutex;

    /// Records every published event for assertions in session/manager tests.
    #[derive(Default)]
    pub struct RecordingSink {
        pub events: Mutex<Vec<(StreamId, StreamEvent)>>,
    }

    impl BroadcastSink for RecordingSink {
        fn publish(&self, stream_id: &StreamId, event: StreamEvent) {
            self.events.lock().unwrap().push((stream_id.clone(), event));
        }
    }
}
