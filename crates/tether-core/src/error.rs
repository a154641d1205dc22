//! Error types for the sync core
//!
//! Errors are split per concern and classified along the lines the rest of
//! the crate cares about: transient failures are retried with backoff,
//! authentication failures are fatal and surfaced immediately, and
//! data-integrity problems quarantine the offending record while processing
//! continues.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

/// Authentication errors
///
/// Always fatal: the session never retries these. The caller must obtain a
/// fresh credential and call `connect` again.
#[derive(Error, Debug, Clone)]
pub enum AuthError {
    /// Credential expired or was revoked
    #[error("credential expired or revoked, re-authentication required")]
    Expired,

    /// Relay rejected the credential
    #[error("credential rejected by relay: {0}")]
    Rejected(String),

    /// The injected credential provider could not produce a token
    #[error("credential provider failed: {0}")]
    Provider(String),
}

/// Transport-level errors
#[derive(Error, Debug)]
pub enum TransportError {
    /// Could not reach the relay
    #[error("failed to connect to relay: {0}")]
    Connect(String),

    /// The auth handshake did not complete in time
    #[error("handshake with relay timed out")]
    HandshakeTimeout,

    /// The relay closed the connection
    #[error("connection closed by relay")]
    Closed,

    /// No live connection to send on
    #[error("not connected")]
    NotConnected,

    /// A send was accepted but never flushed to the wire
    #[error("send timed out")]
    SendTimeout,

    /// Underlying websocket failure
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Outbound frame could not be encoded
    #[error("frame encoding failed: {0}")]
    Codec(#[from] serde_json::Error),

    /// Fatal authentication failure
    #[error(transparent)]
    Auth(#[from] AuthError),
}

impl TransportError {
    /// Transient errors trigger automatic backoff-reconnect; everything else
    /// requires caller action.
    pub fn is_transient(&self) -> bool {
        !matches!(self, TransportError::Auth(_) | TransportError::Codec(_))
    }
}

/// Durable key-value store errors
#[derive(Error, Debug)]
pub enum StoreError {
    /// Failed to read a record file
    #[error("failed to read '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Failed to write a record file
    #[error("failed to write '{path}': {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Atomic write failed during the rename step
    #[error("atomic write failed: could not rename '{from}' to '{to}': {source}")]
    AtomicRename {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Stored record could not be parsed
    #[error("invalid record under key '{key}': {details}")]
    InvalidRecord { key: String, details: String },

    /// Stored record has a version this build does not understand
    #[error("unsupported store version {found} (this build reads up to {supported})")]
    Version { found: u32, supported: u32 },

    /// Generic I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Offline queue errors
#[derive(Error, Debug)]
pub enum QueueError {
    /// Underlying store failure
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Referenced operation does not exist
    #[error("operation {0} not found in queue")]
    NotFound(Uuid),

    /// Operation payload could not be encoded
    #[error("operation payload encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Sync pass errors
#[derive(Error, Debug)]
pub enum SyncError {
    /// The whole pass exceeded its hard timeout
    #[error("sync pass timed out after {0:?}")]
    Timeout(Duration),

    /// Cancellation was observed between phases
    #[error("sync pass cancelled")]
    Cancelled,

    /// The relay stopped responding mid-diff
    #[error("relay stopped responding during diff fetch")]
    DiffStalled,

    /// Queue flush failed
    #[error(transparent)]
    Queue(#[from] QueueError),

    /// Transport failed while requesting the diff
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Checkpoint could not be persisted
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_errors_are_not_transient() {
        let err = TransportError::Auth(AuthError::Expired);
        assert!(!err.is_transient());
    }

    #[test]
    fn test_network_errors_are_transient() {
        assert!(TransportError::Closed.is_transient());
        assert!(TransportError::Connect("refused".into()).is_transient());
        assert!(TransportError::SendTimeout.is_transient());
    }

    #[test]
    fn test_store_error_display() {
        let err = StoreError::InvalidRecord {
            key: "offline_queue".to_string(),
            details: "truncated json".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("offline_queue"));
        assert!(msg.contains("truncated json"));
    }

    #[test]
    fn test_version_error_display() {
        let err = StoreError::Version {
            found: 9,
            supported: 1,
        };
        assert!(err.to_string().contains('9'));
    }
}
