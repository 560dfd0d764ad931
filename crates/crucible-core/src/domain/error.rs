//! Domain-level error taxonomy for Crucible.
//!
//! The first group of variants names the failure classes the scheduler
//! distinguishes. Most of them are handled as values (a disqualified
//! evaluation, an excluded instance, a rollback marker) and only reach a
//! caller as `Err` when there is nothing left to degrade to.

use chrono::{DateTime, Utc};
use crucible_state::StorageError;

/// Crucible domain errors.
#[derive(Debug, thiserror::Error)]
pub enum CrucibleError {
    #[error("invalid candidate {candidate_id}: {reason}")]
    InvalidCandidate {
        candidate_id: String,
        reason: String,
    },

    #[error("evaluation of {instance_id} exceeded {timeout_secs}s")]
    EvaluationTimeout {
        instance_id: String,
        timeout_secs: u64,
    },

    #[error("evaluation of {instance_id} exhausted resources: {detail}")]
    ResourceExhausted { instance_id: String, detail: String },

    #[error("stale lease on {resource} (held by {holder}) reclaimed")]
    StaleLock { resource: String, holder: String },

    #[error("champion {instance_id} failed validation: {verdict}")]
    ValidationFailure { instance_id: String, verdict: String },

    #[error("promotion {promotion_id} was not acknowledged by {deadline}")]
    PromotionTimeout {
        promotion_id: String,
        deadline: DateTime<Utc>,
    },

    #[error("post-apply regression for promotion {promotion_id}: {reason}")]
    DriftDetected {
        promotion_id: String,
        reason: String,
    },

    #[error("instance {instance_id} is corrupted: {reason}")]
    CorruptedInstance { instance_id: String, reason: String },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("retention cannot make room for a new instance: {0}")]
    RetentionExhausted(String),

    #[error("instance {0} is not the validated champion on disk")]
    NotValidated(String),

    #[error("{resource} is held by {holder} until {expires_at}")]
    LeaseHeld {
        resource: String,
        holder: String,
        expires_at: DateTime<Utc>,
    },

    #[error("{holder} no longer holds {resource}")]
    LeaseLost { resource: String, holder: String },

    #[error("tournament needs at least one entrant")]
    NoEntrants,

    #[error("illegal promotion transition {from} -> {to} for {promotion_id}")]
    InvalidTransition {
        promotion_id: String,
        from: String,
        to: String,
    },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    #[error("internal error: {0}")]
    Internal(String),

    #[error("storage error: {0}")]
    Storage(StorageError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<StorageError> for CrucibleError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::LeaseHeld {
                resource,
                holder,
                expires_at,
            } => CrucibleError::LeaseHeld {
                resource,
                holder,
                expires_at,
            },
            StorageError::LeaseLost { resource, holder } => {
                CrucibleError::LeaseLost { resource, holder }
            }
            other => CrucibleError::Storage(other),
        }
    }
}

/// Result type for Crucible domain operations.
pub type Result<T> = std::result::Result<T, CrucibleError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_candidate_display_names_candidate() {
        let err = CrucibleError::InvalidCandidate {
            candidate_id: "c-1".to_string(),
            reason: "batch_size=512 above max 256".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("c-1"));
        assert!(msg.contains("above max"));
    }

    #[test]
    fn lease_contention_keeps_holder() {
        let err: CrucibleError = StorageError::LeaseHeld {
            resource: "cycle".to_string(),
            holder: "host:1".to_string(),
            expires_at: Utc::now(),
        }
        .into();
        assert!(matches!(err, CrucibleError::LeaseHeld { ref holder, .. } if holder == "host:1"));
    }

    #[test]
    fn other_storage_errors_wrap() {
        let err: CrucibleError = StorageError::NotFound {
            key: "x".to_string(),
        }
        .into();
        assert!(matches!(err, CrucibleError::Storage(_)));
        assert!(err.to_string().contains("storage error"));
    }
}
