use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::decoder::{Decoder, DecoderSpawner};
use crate::manager::SessionManager;
use crate::sink::{BroadcastSink, StreamEvent};
use crate::splitter::MjpegSplitter;
use crate::types::{SessionStatus, StreamDescriptor};

const READ_CHUNK_BYTES: usize = 64 * 1024;
const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(500);
const EMPTY_READ_BACKOFF: Duration = Duration::from_millis(50);

/// Tuning the session doesn't get from the descriptor: process-wide defaults
/// captured at session creation so a restart reuses the same values.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub grace_period: Duration,
    pub terminate_timeout: Duration,
    pub splitter_max_buffer_bytes: usize,
}

/// Why `read_phase` returned, so `run_pump` knows whether to clear `running`.
enum PumpExit {
    /// Told to stop: `running` was already (or is about to be) cleared by
    /// whoever asked for the stop.
    Stopped,
    /// The decoder exited on its own while clients were still attached.
    /// `running` is left set so the health monitor can restart the session.
    DecoderExited,
}

struct SessionInner {
    running: bool,
    client_count: u32,
    decoder: Option<Box<dyn Decoder>>,
    last_emit: Option<Instant>,
    restart_count: u32,
    last_frame: Option<Vec<u8>>,
    grace_timer: Option<JoinHandle<()>>,
}

/// One active (or draining) stream. Owns the decoder subprocess, the
/// splitter, and the client refcount. See `join`/`leave`/`terminate` for the
/// externally visible lifecycle; `run_pump` is the frame-pumping task body.
pub struct StreamSession {
    pub descriptor: StreamDescriptor,
    pub epoch: u64,
    config: SessionConfig,
    inner: Mutex<SessionInner>,
    spawner: Arc<dyn DecoderSpawner>,
    sink: Arc<dyn BroadcastSink>,
    manager: Weak<SessionManager>,
}

impl StreamSession {
    pub fn new(
        descriptor: StreamDescriptor,
        epoch: u64,
        config: SessionConfig,
        spawner: Arc<dyn DecoderSpawner>,
        sink: Arc<dyn BroadcastSink>,
        manager: Weak<SessionManager>,
    ) -> Arc<Self> {
        Arc::new(Self {
            descriptor,
            epoch,
            config,
            inner: Mutex::new(SessionInner {
                running: false,
                client_count: 0,
                decoder: None,
                last_emit: None,
                restart_count: 0,
                last_frame: None,
                grace_timer: None,
            }),
            spawner,
            sink,
            manager,
        })
    }

    /// Registers one more subscriber, cancelling any armed grace timer and
    /// starting the pump if it is not already running.
    pub async fn join(self: &Arc<Self>) {
        let mut inner = self.inner.lock().await;
        inner.client_count += 1;
        if let Some(timer) = inner.grace_timer.take() {
            timer.abort();
        }
        if !inner.running {
            inner.running = true;
            drop(inner);
            let session = self.clone();
            tokio::spawn(async move { session.run_pump().await });
        }
    }

    /// Removes one subscriber. At zero, arms a grace-period timer; the
    /// session only tears down if no one rejoins before it fires.
    pub async fn leave(self: &Arc<Self>) {
        let mut inner = self.inner.lock().await;
        if inner.client_count > 0 {
            inner.client_count -= 1;
        }
        if inner.client_count == 0 && inner.running {
            let session = self.clone();
            let grace = self.config.grace_period;
            let timer = tokio::spawn(async move {
                tokio::time::sleep(grace).await;
                session.fire_grace_timeout().await;
            });
            inner.grace_timer = Some(timer);
        }
    }

    async fn fire_grace_timeout(self: &Arc<Self>) {
        let mut inner = self.inner.lock().await;
        if inner.client_count != 0 {
            return;
        }
        inner.running = false;
        inner.grace_timer = None;
        let decoder = inner.decoder.take();
        let timeout = self.config.terminate_timeout;
        drop(inner);

        if let Some(mut decoder) = decoder {
            decoder.stop(timeout).await;
        }

        if let Some(manager) = self.manager.upgrade() {
            manager.deregister(&self.descriptor.stream_id, self.epoch).await;
        }
    }

    /// Forcibly ends the session regardless of client count: cancels any
    /// grace timer, stops the pump, and terminates the decoder. Used by
    /// `SessionManager::restart` when replacing a session's decoder.
    pub async fn terminate(self: &Arc<Self>) {
        let mut inner = self.inner.lock().await;
        inner.client_count = 0;
        inner.running = false;
        if let Some(timer) = inner.grace_timer.take() {
            timer.abort();
        }
        let decoder = inner.decoder.take();
        let timeout = self.config.terminate_timeout;
        drop(inner);

        if let Some(mut decoder) = decoder {
            decoder.stop(timeout).await;
        }
    }

    pub async fn status(&self) -> SessionStatus {
        let inner = self.inner.lock().await;
        SessionStatus {
            stream_id: self.descriptor.stream_id.clone(),
            running: inner.running,
            client_count: inner.client_count,
            restart_count: inner.restart_count,
            last_emit_age_ms: inner.last_emit.map(|t| t.elapsed().as_millis() as u64),
        }
    }

    pub async fn client_count(&self) -> u32 {
        self.inner.lock().await.client_count
    }

    pub async fn bump_restart_count(&self) {
        self.inner.lock().await.restart_count += 1;
    }

    /// Used by `SessionManager::restart`: seeds the client count without
    /// going through `join`'s grace-timer-cancellation path, then starts the
    /// pump. The session is freshly constructed, so `running` is still false.
    pub async fn start_with_preserved_clients(self: &Arc<Self>, client_count: u32) {
        let mut inner = self.inner.lock().await;
        inner.client_count = client_count;
        inner.running = true;
        drop(inner);
        let session = self.clone();
        tokio::spawn(async move { session.run_pump().await });
    }

    /// The frame pump: connect phase, then read phase until `running`
    /// becomes false or the decoder exits and its pipe drains.
    async fn run_pump(self: Arc<Self>) {
        let decoder = match self.connect().await {
            Some(decoder) => decoder,
            None => {
                self.inner.lock().await.running = false;
                if let Some(manager) = self.manager.upgrade() {
                    manager.deregister(&self.descriptor.stream_id, self.epoch).await;
                }
                return;
            }
        };
        {
            let mut inner = self.inner.lock().await;
            inner.decoder = Some(decoder);
            // Seeds the freeze clock at connect time, not first frame, so the
            // health monitor can detect a decoder that connects but never
            // emits a single frame.
            inner.last_emit = Some(Instant::now());
        }

        self.sink.publish(
            &self.descriptor.stream_id,
            StreamEvent::Status {
                message: "connected".into(),
            },
        );

        let exit = self.read_phase().await;

        let mut inner = self.inner.lock().await;
        // A decoder that exits mid-stream while clients are still attached
        // leaves `running` alone: the session stays registered and restartable
        // by the health monitor. `running` is only cleared here for an
        // explicit stop (`terminate`/`fire_grace_timeout` already cleared it
        // themselves, or the pump was told to stop with no clients left).
        if matches!(exit, PumpExit::Stopped) {
            inner.running = false;
        }
        let decoder = inner.decoder.take();
        drop(inner);
        if let Some(mut decoder) = decoder {
            decoder.stop(self.config.terminate_timeout).await;
        }
    }

    async fn connect(&self) -> Option<Box<dyn Decoder>> {
        for &transport in &self.descriptor.transport_order {
            match self.spawner.start(&self.descriptor, transport).await {
                Ok(decoder) => return Some(decoder),
                Err(e) => {
                    tracing::warn!(
                        stream_id = %self.descriptor.stream_id,
                        transport = %transport,
                        error = %e,
                        "decoder start failed, trying next transport"
                    );
                }
            }
        }
        self.sink.publish(
            &self.descriptor.stream_id,
            StreamEvent::Error {
                message: "decoder failed to start on every configured transport".into(),
            },
        );
        None
    }

    /// Runs until told to stop, or until the decoder exits on its own. Never
    /// awaits the decoder read while holding `inner`'s lock: the decoder is
    /// checked out of `inner` for the duration of the read and checked back
    /// in immediately after, so `join`/`leave`/`status`/`terminate` are never
    /// blocked behind an in-flight read.
    async fn read_phase(&self) -> PumpExit {
        let frame_interval = Duration::from_secs_f64(1.0 / self.descriptor.target_fps.max(1) as f64);
        let mut last_emit_time: Option<Instant> = None;
        let mut splitter = MjpegSplitter::new(self.config.splitter_max_buffer_bytes);

        loop {
            let client_count = self.inner.lock().await.client_count;
            if !self.is_running().await {
                return PumpExit::Stopped;
            }
            if client_count == 0 {
                tokio::time::sleep(IDLE_POLL_INTERVAL).await;
                continue;
            }

            let mut decoder = match self.inner.lock().await.decoder.take() {
                Some(d) => d,
                None => return PumpExit::Stopped,
            };
            let chunk = decoder.read_chunk(READ_CHUNK_BYTES).await;
            let exited = decoder.exited();
            self.inner.lock().await.decoder = Some(decoder);

            let bytes = match chunk {
                Ok(bytes) => bytes,
                Err(e) => {
                    tracing::warn!(stream_id = %self.descriptor.stream_id, error = %e, "decoder read error");
                    tokio::time::sleep(EMPTY_READ_BACKOFF).await;
                    continue;
                }
            };

            if bytes.is_empty() {
                if exited {
                    return PumpExit::DecoderExited;
                }
                tokio::time::sleep(EMPTY_READ_BACKOFF).await;
                continue;
            }

            splitter.feed(&bytes);
            while let Some(frame) = splitter.next_frame() {
                let now = Instant::now();
                let due = last_emit_time
                    .map(|t| now.duration_since(t) >= frame_interval)
                    .unwrap_or(true);
                if !due {
                    continue;
                }
                last_emit_time = Some(now);
                let encoded = BASE64.encode(&frame);

                {
                    let mut inner = self.inner.lock().await;
                    inner.last_emit = Some(now);
                    inner.last_frame = Some(frame);
                }

                self.sink.publish(
                    &self.descriptor.stream_id,
                    StreamEvent::Frame {
                        frame_base64: encoded,
                    },
                );
            }
        }
    }

    async fn is_running(&self) -> bool {
        self.inner.lock().await.running
    }
}
