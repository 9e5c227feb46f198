//! # Error Taxonomy
//!
//! Domain errors raised by the synchronization engine. Each variant maps to
//! one way a folder, session or transfer can fail, and carries enough context
//! to decide whether the operation should be retried.
//!
//! Service-level code (CLI, daemon wiring) works with `anyhow::Result` and
//! converts these with `?`.

use crate::secret::{FolderId, Level};
use thiserror::Error;

/// Errors produced by the lvlt core.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The remote presented a Secret for a different folder. Fatal for that session only.
    #[error("capability mismatch: peer presented folder {remote}, expected {local}")]
    CapabilityMismatch { local: FolderId, remote: FolderId },

    /// The remote could not prove possession of the negotiated capability level.
    #[error("peer failed to prove {0} capability")]
    AuthenticationFailed(Level),

    /// The requested derivation target is not strictly weaker than the source level.
    #[error("unsupported downgrade from {from} to {to}")]
    UnsupportedDowngrade { from: Level, to: Level },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    /// A received chunk did not hash to the requested address.
    #[error("hash mismatch for chunk {0}")]
    HashMismatch(String),

    /// Assembled content did not match the entry being applied. The previous revision is kept.
    #[error("chunk integrity violation while applying {path}")]
    ChunkIntegrityViolation { path: String },

    #[error("Wrong link format")]
    WrongLinkFormat,

    #[error("invalid signature on entry {0}")]
    InvalidSignature(String),

    #[error("operation requires write capability, folder is {0}")]
    WriteNotPermitted(Level),

    #[error("chunk not available: {0}")]
    ChunkUnavailable(String),

    /// A newer local revision replaced the entry a transfer was started for.
    #[error("transfer for {0} superseded by a newer revision")]
    Superseded(String),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("session closed")]
    Closed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl SyncError {
    /// Transport-class failures move a session to `Failed` and are retried with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::Transport(_) | SyncError::Timeout(_) | SyncError::Io(_) | SyncError::Closed
        )
    }
}

impl From<bincode::Error> for SyncError {
    fn from(e: bincode::Error) -> Self {
        SyncError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::Serialization(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        assert!(SyncError::Timeout("handshake").is_retryable());
        assert!(SyncError::Transport("reset".into()).is_retryable());
        assert!(!SyncError::WrongLinkFormat.is_retryable());
        assert!(!SyncError::HashMismatch("00".into()).is_retryable());
        assert!(!SyncError::AuthenticationFailed(Level::ReadOnly).is_retryable());
    }

    #[test]
    fn test_link_error_message() {
        assert_eq!(SyncError::WrongLinkFormat.to_string(), "Wrong link format");
    }
}
