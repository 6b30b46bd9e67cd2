use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;

use crate::catalog::StreamCatalog;
use crate::config::RelayConfig;
use crate::decoder::DecoderSpawner;
use crate::error::RelayError;
use crate::session::{SessionConfig, StreamSession};
use crate::sink::{BroadcastSink, StreamEvent};
use crate::types::{SessionStatus, StreamDescriptor, StreamId};

const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(10);

struct SessionSlot {
    session: Arc<StreamSession>,
    epoch: u64,
}

/// Process-wide registry of active stream sessions. Owns the Manager lock
/// (the `DashMap`, entry-atomic) and runs the health monitor that restarts
/// frozen sessions. Lock order: Manager before Session; a session never
/// re-enters the Manager while holding its own lock (see
/// `StreamSession::fire_grace_timeout`, which drops its lock before calling
/// `deregister`).
pub struct SessionManager {
    sessions: DashMap<StreamId, SessionSlot>,
    next_epoch: AtomicU64,
    catalog: Arc<dyn StreamCatalog>,
    sink: Arc<dyn BroadcastSink>,
    spawner: Arc<dyn DecoderSpawner>,
    session_defaults: SessionDefaults,
}

#[derive(Clone)]
struct SessionDefaults {
    target_fps: u32,
    target_width: u32,
    jpeg_quality: u32,
    transport_order: Vec<crate::types::Transport>,
    session_config: SessionConfig,
    freeze_threshold: Duration,
}

impl SessionManager {
    pub fn new(
        config: &RelayConfig,
        catalog: Arc<dyn StreamCatalog>,
        sink: Arc<dyn BroadcastSink>,
        spawner: Arc<dyn DecoderSpawner>,
    ) -> Arc<Self> {
        Arc::new(Self {
            sessions: DashMap::new(),
            next_epoch: AtomicU64::new(0),
            catalog,
            sink,
            spawner,
            session_defaults: SessionDefaults {
                target_fps: config.target_fps,
                target_width: config.target_width,
                jpeg_quality: config.jpeg_quality,
                transport_order: config.transport_order.clone(),
                session_config: SessionConfig {
                    grace_period: Duration::from_secs(config.grace_period_seconds),
                    terminate_timeout: Duration::from_secs(config.terminate_timeout_seconds),
                    splitter_max_buffer_bytes: config.splitter_max_buffer_bytes,
                },
                freeze_threshold: Duration::from_secs(config.freeze_threshold_seconds),
            },
        })
    }

    /// Creates the session on first subscriber, or joins the existing one.
    pub async fn subscribe(self: &Arc<Self>, stream_id: &StreamId) -> Result<(), RelayError> {
        if let Some(slot) = self.sessions.get(stream_id) {
            slot.session.join().await;
            return Ok(());
        }

        let entry = self
            .catalog
            .lookup(stream_id)
            .ok_or_else(|| RelayError::CatalogMiss(stream_id.clone()))?;
        if !entry.active {
            return Err(RelayError::CatalogMiss(stream_id.clone()));
        }

        let descriptor = self.build_descriptor(stream_id.clone(), entry.url);
        let epoch = self.next_epoch.fetch_add(1, Ordering::SeqCst);
        let session = StreamSession::new(
            descriptor,
            epoch,
            self.session_defaults.session_config.clone(),
            self.spawner.clone(),
            self.sink.clone(),
            Arc::downgrade(self),
        );

        self.sessions.insert(
            stream_id.clone(),
            SessionSlot {
                session: session.clone(),
                epoch,
            },
        );
        session.join().await;
        Ok(())
    }

    pub async fn unsubscribe(&self, stream_id: &StreamId) {
        if let Some(slot) = self.sessions.get(stream_id) {
            slot.session.leave().await;
        }
    }

    /// Called by a session after a confirmed grace-period shutdown. Removes
    /// the registry entry only if it still points at the calling session
    /// instance; a concurrent restart may already have replaced it.
    pub async fn deregister(&self, stream_id: &StreamId, epoch: u64) {
        if let Some(entry) = self.sessions.get(stream_id) {
            if entry.epoch != epoch {
                return;
            }
        } else {
            return;
        }
        self.sessions.remove_if(stream_id, |_, slot| slot.epoch == epoch);
    }

    /// Stops the current decoder and client pump, preserving client count and
    /// registry slot, and starts a fresh decoder.
    pub async fn restart(self: &Arc<Self>, stream_id: &StreamId) {
        let Some(old_session) = self.sessions.get(stream_id).map(|slot| slot.session.clone())
        else {
            return;
        };
        let preserved_clients = old_session.client_count().await;
        let restart_count = old_session.status().await.restart_count;
        old_session.terminate().await;

        let epoch = self.next_epoch.fetch_add(1, Ordering::SeqCst);
        let new_session = StreamSession::new(
            old_session.descriptor.clone(),
            epoch,
            self.session_defaults.session_config.clone(),
            self.spawner.clone(),
            self.sink.clone(),
            Arc::downgrade(self),
        );
        for _ in 0..=restart_count {
            new_session.bump_restart_count().await;
        }
        new_session.start_with_preserved_clients(preserved_clients).await;

        self.sessions.insert(
            stream_id.clone(),
            SessionSlot {
                session: new_session,
                epoch,
            },
        );
        self.sink.publish(
            stream_id,
            StreamEvent::Status {
                message: "stream restarted".into(),
            },
        );
    }

    pub async fn status(&self, stream_id: &StreamId) -> Option<SessionStatus> {
        let slot = self.sessions.get(stream_id)?;
        Some(slot.session.status().await)
    }

    fn build_descriptor(&self, stream_id: StreamId, url: String) -> StreamDescriptor {
        StreamDescriptor {
            stream_id,
            url,
            target_fps: self.session_defaults.target_fps,
            target_width: self.session_defaults.target_width,
            jpeg_quality: self.session_defaults.jpeg_quality,
            transport_order: self.session_defaults.transport_order.clone(),
        }
    }

    /// Spawns the background task that restarts sessions whose decoder has
    /// stopped producing frames while clients are still attached.
    pub fn spawn_health_monitor(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(HEALTH_CHECK_INTERVAL);
            loop {
                interval.tick().await;
                manager.run_health_check().await;
            }
        })
    }

    async fn run_health_check(self: &Arc<Self>) {
        let stream_ids: Vec<StreamId> = self.sessions.iter().map(|e| e.key().clone()).collect();
        for stream_id in stream_ids {
            let Some(slot) = self.sessions.get(&stream_id) else {
                continue;
            };
            let session = slot.session.clone();
            drop(slot);

            let status = session.status().await;
            if !status.running || status.client_count == 0 {
                continue;
            }
            let frozen = status
                .last_emit_age_ms
                .map(|age_ms| Duration::from_millis(age_ms) > self.session_defaults.freeze_threshold)
                .unwrap_or(false);
            if frozen {
                tracing::warn!(stream_id = %stream_id, "stream frozen, restarting");
                self.restart(&stream_id).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::InMemoryCatalog;
    use crate::decoder::test_util::MockSpawner;
    use crate::sink::test_util::RecordingSink;

    fn test_config() -> RelayConfig {
        RelayConfig {
            grace_period_seconds: 0,
            terminate_timeout_seconds: 0,
            freeze_threshold_seconds: 0,
            target_fps: 1000,
            ..RelayConfig::default()
        }
    }

    fn jpeg(tag: u8) -> Vec<u8> {
        let mut v = vec![0xFF, 0xD8];
        v.extend(std::iter::repeat(tag).take(150));
        v.extend_from_slice(&[0xFF, 0xD9]);
        v
    }

    #[tokio::test]
    async fn catalog_miss_does_not_register_a_session() {
        let catalog = Arc::new(InMemoryCatalog::new());
        let sink = Arc::new(RecordingSink::default());
        let spawner = Arc::new(MockSpawner::with_frames(vec![]));
        let manager = SessionManager::new(&test_config(), catalog, sink, spawner);

        let result = manager.subscribe(&StreamId::from("missing")).await;
        assert!(matches!(result, Err(RelayError::CatalogMiss(_))));
        assert!(manager.status(&StreamId::from("missing")).await.is_none());
    }

    #[tokio::test]
    async fn fan_out_shares_a_single_decoder_process() {
        let catalog = Arc::new(InMemoryCatalog::new());
        catalog.insert(StreamId::from("a"), "rtsp://x/s");
        let sink = Arc::new(RecordingSink::default());
        let spawner = Arc::new(MockSpawner::with_frames(vec![jpeg(1)]));
        let manager = SessionManager::new(&test_config(), catalog, sink, spawner.clone());

        for _ in 0..3 {
            manager.subscribe(&StreamId::from("a")).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(spawner.start_count(), 1);
    }

    #[tokio::test]
    async fn all_transports_failing_emits_error_and_skips_registration() {
        let catalog = Arc::new(InMemoryCatalog::new());
        catalog.insert(StreamId::from("a"), "rtsp://x/s");
        let sink = Arc::new(RecordingSink::default());
        let spawner = Arc::new(MockSpawner::failing());
        let manager = SessionManager::new(&test_config(), catalog, sink.clone(), spawner);

        manager.subscribe(&StreamId::from("a")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let events = sink.events.lock().unwrap();
        assert!(events
            .iter()
            .any(|(_, e)| matches!(e, StreamEvent::Error { .. })));
        drop(events);

        assert!(manager.status(&StreamId::from("a")).await.is_none());
    }

    #[tokio::test]
    async fn inactive_catalog_entry_is_treated_as_not_found() {
        let catalog = Arc::new(InMemoryCatalog::new());
        catalog.insert_inactive(StreamId::from("a"), "rtsp://x/s");
        let sink = Arc::new(RecordingSink::default());
        let spawner = Arc::new(MockSpawner::with_frames(vec![]));
        let manager = SessionManager::new(&test_config(), catalog, sink, spawner);

        let result = manager.subscribe(&StreamId::from("a")).await;
        assert!(matches!(result, Err(RelayError::CatalogMiss(_))));
    }

    #[tokio::test]
    async fn restart_preserves_client_count_and_bumps_restart_counter() {
        let catalog = Arc::new(InMemoryCatalog::new());
        catalog.insert(StreamId::from("a"), "rtsp://x/s");
        let sink = Arc::new(RecordingSink::default());
        let spawner = Arc::new(MockSpawner::with_frames_then_freeze(vec![jpeg(1)]));
        let manager = SessionManager::new(&test_config(), catalog, sink, spawner.clone());

        manager.subscribe(&StreamId::from("a")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        manager.restart(&StreamId::from("a")).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let status = manager.status(&StreamId::from("a")).await.unwrap();
        assert_eq!(status.client_count, 1);
        assert_eq!(status.restart_count, 1);
        assert_eq!(spawner.start_count(), 2);
    }
}
