use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::time::timeout;

use crate::types::{StreamDescriptor, Transport};

/// Bound on how long we wait, right after spawning, to see whether the child
/// exits immediately (bad URL, missing codec, unreachable host).
const IMMEDIATE_EXIT_WINDOW: Duration = Duration::from_millis(1500);

/// A running decoder subprocess handle. One instance per live process.
#[async_trait]
pub trait Decoder: Send + Sync {
    /// Reads up to `max_bytes` from the decoder's stdout. Returns an empty
    /// vec on EOF.
    async fn read_chunk(&mut self, max_bytes: usize) -> std::io::Result<Vec<u8>>;

    /// Requests graceful termination of the whole process group, escalating
    /// to a forced kill if the process has not exited within `timeout`.
    async fn stop(&mut self, timeout: Duration);

    /// True once the child process has exited.
    fn exited(&self) -> bool;

    fn pid(&self) -> Option<u32>;
}

/// Constructs a `Decoder` for a given stream descriptor and transport choice.
#[async_trait]
pub trait DecoderSpawner: Send + Sync {
    async fn start(
        &self,
        descriptor: &StreamDescriptor,
        transport: Transport,
    ) -> Result<Box<dyn Decoder>, String>;
}

/// Spawns the real `ffmpeg` binary. RTSP input, MJPEG-over-pipe output.
pub struct FfmpegSpawner;

#[async_trait]
impl DecoderSpawner for FfmpegSpawner {
    async fn start(
        &self,
        descriptor: &StreamDescriptor,
        transport: Transport,
    ) -> Result<Box<dyn Decoder>, String> {
        let args = ffmpeg_args(descriptor, transport);

        let mut command = Command::new("ffmpeg");
        command
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }

        let mut child = command
            .spawn()
            .map_err(|e| format!("failed to spawn ffmpeg: {e}"))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| "ffmpeg child missing stdout pipe".to_string())?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| "ffmpeg child missing stderr pipe".to_string())?;

        tokio::select! {
            status = child.wait() => {
                let tail = drain_stderr_to_string(stderr).await;
                let status = status.map_err(|e| e.to_string())?;
                return Err(format!("ffmpeg exited immediately with {status}: {tail}"));
            }
            _ = tokio::time::sleep(IMMEDIATE_EXIT_WINDOW) => {}
        }

        let session_id = descriptor.stream_id.to_string();
        tokio::spawn(drain_stderr_to_log(stderr, session_id));

        Ok(Box::new(FfmpegDecoder {
            child,
            stdout,
            exited: false,
        }))
    }
}

fn ffmpeg_args(descriptor: &StreamDescriptor, transport: Transport) -> Vec<String> {
    vec![
        "-rtsp_transport".into(),
        transport.to_string(),
        "-i".into(),
        descriptor.url.clone(),
        "-an".into(),
        "-f".into(),
        "mjpeg".into(),
        "-vf".into(),
        format!(
            "scale={}:-2,fps={}",
            descriptor.target_width, descriptor.target_fps
        ),
        "-q:v".into(),
        descriptor.jpeg_quality.to_string(),
        "-fflags".into(),
        "nobuffer".into(),
        "-flags".into(),
        "low_delay".into(),
        "pipe:1".into(),
    ]
}

async fn drain_stderr_to_string(stderr: ChildStderr) -> String {
    let mut buf = Vec::new();
    let mut stderr = stderr;
    let _ = stderr.read_to_end(&mut buf).await;
    let text = String::from_utf8_lossy(&buf);
    text.lines().rev().take(5).collect::<Vec<_>>().join(" | ")
}

async fn drain_stderr_to_log(stderr: ChildStderr, stream_id: String) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if line.contains("Last message repeated") {
            continue;
        }
        tracing::debug!(stream_id = %stream_id, "ffmpeg: {line}");
    }
}

pub struct FfmpegDecoder {
    child: Child,
    stdout: ChildStdout,
    exited: bool,
}

#[async_trait]
impl Decoder for FfmpegDecoder {
    async fn read_chunk(&mut self, max_bytes: usize) -> std::io::Result<Vec<u8>> {
        let mut buf = vec![0u8; max_bytes];
        let n = self.stdout.read(&mut buf).await?;
        if n == 0 {
            self.exited = true;
        }
        buf.truncate(n);
        Ok(buf)
    }

    async fn stop(&mut self, timeout_dur: Duration) {
        #[cfg(unix)]
        if let Some(pid) = self.pid() {
            unsafe {
                libc::kill(-(pid as i32), libc::SIGTERM);
            }
        }

        if timeout(timeout_dur, self.child.wait()).await.is_err() {
            let _ = self.child.kill().await;
        }
        self.exited = true;
    }

    fn exited(&self) -> bool {
        self.exited
    }

    fn pid(&self) -> Option<u32> {
        self.child.id()
    }
}

/// Test doubles for `Decoder`/`DecoderSpawner`, so the session/manager
/// lifecycle can be exercised without a real ffmpeg binary. Not behind
/// `#[cfg(test)]` so integration tests outside this crate's test module can
/// also use them.
pub mod test_util {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::Mutex;

    pub struct MockDecoder {
        chunks: Mutex<VecDeque<Vec<u8>>>,
        pid: u32,
        exited: AtomicBool,
        freeze: bool,
    }

    #[async_trait]
    impl Decoder for MockDecoder {
        async fn read_chunk(&mut self, _max_bytes: usize) -> std::io::Result<Vec<u8>> {
            if let Some(chunk) = self.chunks.lock().unwrap().pop_front() {
                return Ok(chunk);
            }
            if self.freeze {
                // Simulate a stalled-but-alive decoder: never signals EOF.
                tokio::time::sleep(Duration::from_secs(3600)).await;
                return Ok(Vec::new());
            }
            self.exited.store(true, Ordering::SeqCst);
            Ok(Vec::new())
        }

        async fn stop(&mut self, _timeout: Duration) {
            self.exited.store(true, Ordering::SeqCst);
        }

        fn exited(&self) -> bool {
            self.exited.load(Ordering::SeqCst)
        }

        fn pid(&self) -> Option<u32> {
            Some(self.pid)
        }
    }

    pub struct MockSpawner {
        frames: Vec<Vec<u8>>,
        start_count: AtomicU32,
        freeze_after_frames: bool,
        fail: bool,
    }

    impl MockSpawner {
        pub fn with_frames(frames: Vec<Vec<u8>>) -> Self {
            Self {
                frames,
                start_count: AtomicU32::new(0),
                freeze_after_frames: false,
                fail: false,
            }
        }

        pub fn with_frames_then_freeze(frames: Vec<Vec<u8>>) -> Self {
            Self {
                frames,
                start_count: AtomicU32::new(0),
                freeze_after_frames: true,
                fail: false,
            }
        }

        pub fn failing() -> Self {
            Self {
                frames: Vec::new(),
                start_count: AtomicU32::new(0),
                freeze_after_frames: false,
                fail: true,
            }
        }

        pub fn start_count(&self) -> u32 {
            self.start_count.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl DecoderSpawner for MockSpawner {
        async fn start(
            &self,
            _descriptor: &StreamDescriptor,
            _transport: Transport,
        ) -> Result<Box<dyn Decoder>, String> {
            let pid = self.start_count.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail {
                return Err("mock decoder refused to start".into());
            }
            Ok(Box::new(MockDecoder {
                chunks: Mutex::new(self.frames.clone().into()),
                pid,
                exited: AtomicBool::new(false),
                freeze: self.freeze_after_frames,
            }))
        }
    }
}
