//! Error types for crucible-state

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Errors that can occur in the coordination state layer
#[derive(Error, Debug)]
pub enum StorageError {
    /// Requested record does not exist
    #[error("not found: {key}")]
    NotFound { key: String },

    /// Digest string is not 64-char hex
    #[error("invalid digest: {digest}")]
    InvalidDigest { digest: String },

    /// Lease is held by another holder and has not gone stale
    #[error("lease on {resource} held by {holder} until {expires_at}")]
    LeaseHeld {
        resource: String,
        holder: String,
        expires_at: DateTime<Utc>,
    },

    /// Caller no longer owns the lease it tried to renew or release
    #[error("lease on {resource} is not owned by {holder}")]
    LeaseLost { resource: String, holder: String },

    /// On-disk record could not be interpreted
    #[error("corrupt record at {path}: {reason}")]
    Corrupt { path: String, reason: String },

    /// Serialization error
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Filesystem error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl StorageError {
    /// True when the error only means "someone else holds it right now".
    pub fn is_contention(&self) -> bool {
        matches!(self, StorageError::LeaseHeld { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lease_held_display_names_holder() {
        let err = StorageError::LeaseHeld {
            resource: "cycle".to_string(),
            holder: "host-a:42".to_string(),
            expires_at: Utc::now(),
        };
        let msg = err.to_string();
        assert!(msg.contains("cycle"));
        assert!(msg.contains("host-a:42"));
        assert!(err.is_contention());
    }

    #[test]
    fn io_error_converts() {
        let err: StorageError = std::io::Error::new(std::io::ErrorKind::Other, "disk gone").into();
        assert!(err.to_string().contains("disk gone"));
        assert!(!err.is_contention());
    }
}
