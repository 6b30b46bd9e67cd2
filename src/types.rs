use serde::{Deserialize, Serialize};

/// Opaque identifier for a logical stream. Equality defines stream identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamId(pub String);

impl StreamId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for StreamId {
    fn from(value: &str) -> Self {
        StreamId(value.to_string())
    }
}

impl From<String> for StreamId {
    fn from(value: String) -> Self {
        StreamId(value)
    }
}

/// Upstream transport preference for the decoder subprocess.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Tcp,
    Udp,
}

impl std::fmt::Display for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Transport::Tcp => write!(f, "tcp"),
            Transport::Udp => write!(f, "udp"),
        }
    }
}

/// Immutable per-session parameters, fixed for the lifetime of the session.
#[derive(Debug, Clone)]
pub struct StreamDescriptor {
    pub stream_id: StreamId,
    pub url: String,
    pub target_fps: u32,
    pub target_width: u32,
    pub jpeg_quality: u32,
    pub transport_order: Vec<Transport>,
}

/// Read-only snapshot of a session's state, returned by the manager for status queries.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub stream_id: StreamId,
    pub running: bool,
    pub client_count: u32,
    pub restart_count: u32,
    pub last_emit_age_ms: Option<u64>,
}
