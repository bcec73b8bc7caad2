//! Error types for the playback core.

use thiserror::Error;

/// Failure reported by a platform decode buffer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AppendError {
    /// The buffer is out of space; trimming played-back media may free some.
    #[error("Decode buffer quota exceeded")]
    QuotaExceeded,

    /// An operation was started while another was still in flight.
    #[error("Decode buffer busy")]
    Busy,

    /// The buffer was closed or detached by the platform.
    #[error("Decode buffer closed")]
    Closed,

    /// The decoder rejected the data.
    #[error("Decode error: {0}")]
    Decode(String),
}

/// Errors that end a playback session.
#[derive(Debug, Error)]
pub enum PlayerError {
    #[error("Stream request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Stream returned HTTP {0}")]
    Status(u16),

    #[error("Decode buffer failure: {0}")]
    Append(#[from] AppendError),

    /// Quota exceeded again after trimming, or nothing behind playback to trim.
    #[error("Decode buffer exhausted: {0}")]
    BufferExhausted(String),

    #[error("Failed to open decode buffer for {codec}: {reason}")]
    OpenBuffer { codec: String, reason: String },

    #[error("Native playback failed: {0}")]
    Native(String),
}

impl PlayerError {
    /// Create a buffer exhaustion error.
    pub fn exhausted(msg: impl Into<String>) -> Self {
        Self::BufferExhausted(msg.into())
    }
}

/// Result type alias for playback operations.
pub type Result<T> = std::result::Result<T, PlayerError>;
