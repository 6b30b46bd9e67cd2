use crate::types::StreamId;

/// Error taxonomy for the relay core. Callers match on kind rather than
/// parsing messages. Decoder-start and mid-stream failures are not part of
/// this taxonomy: they never need to be matched on by a caller outside the
/// core, so they travel to subscribers as `StreamEvent::Error` instead (see
/// `sink.rs`).
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("no such stream: {0}")]
    CatalogMiss(StreamId),
}
