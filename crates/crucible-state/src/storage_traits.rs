//! Storage trait definitions for Crucible
//!
//! These traits define the coordination abstractions shared by independent
//! cycle invocations and the external symptom producer:
//! - `LeaseStore`: exclusive, TTL-bounded leases with reclaim-on-expiry
//! - `SymptomQueue`: at-least-once symptom feed collapsed to effectively-once
//!   by a processed-id ledger
//!
//! Both traits are backend-agnostic. File-backed implementations live in
//! `fs_lease` / `fs_queue`; in-memory fakes are in the `fakes` module.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::StorageError;

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

// ---------------------------------------------------------------------------
// ContentDigest
// ---------------------------------------------------------------------------

/// Content digest (SHA-256 hex string).
///
/// The inner field is private to guarantee the string is always valid
/// lowercase hex produced by `from_bytes` or validated via `TryFrom<String>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentDigest(String);

impl ContentDigest {
    /// Compute the SHA-256 digest of the given bytes.
    pub fn from_bytes(data: &[u8]) -> Self {
        use sha2::Digest;
        let mut hasher = Sha256::new();
        hasher.update(data);
        ContentDigest(hex::encode(hasher.finalize()))
    }

    /// Return the full hex string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short form (first 12 hex chars).
    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl TryFrom<String> for ContentDigest {
    type Error = StorageError;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        if s.len() != 64 || !s.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(StorageError::InvalidDigest { digest: s });
        }
        Ok(ContentDigest(s.to_ascii_lowercase()))
    }
}

impl From<ContentDigest> for String {
    fn from(d: ContentDigest) -> Self {
        d.0
    }
}

impl std::fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// LeaseStore
// ---------------------------------------------------------------------------

/// A held lease on a named resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseRecord {
    /// Resource the lease guards (e.g. "cycle", "validator").
    pub resource: String,
    /// Opaque holder identity (host:pid:nonce).
    pub holder: String,
    /// When the lease was first acquired.
    pub acquired_at: DateTime<Utc>,
    /// When the lease was last acquired or renewed.
    pub renewed_at: DateTime<Utc>,
    /// Staleness threshold in seconds, measured from `renewed_at`.
    pub ttl_secs: i64,
}

impl LeaseRecord {
    pub fn new(resource: &str, holder: &str, ttl: Duration, now: DateTime<Utc>) -> Self {
        Self {
            resource: resource.to_string(),
            holder: holder.to_string(),
            acquired_at: now,
            renewed_at: now,
            ttl_secs: ttl.num_seconds(),
        }
    }

    /// Instant after which any acquirer may reclaim the lease.
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.renewed_at + Duration::seconds(self.ttl_secs)
    }

    /// A lease is stale once `now` reaches its expiry.
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at()
    }
}

/// Outcome of a successful acquisition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseAcquisition {
    /// The lease now held by the caller.
    pub lease: LeaseRecord,
    /// The stale lease that had to be reclaimed first, if any.
    pub reclaimed: Option<LeaseRecord>,
}

/// Exclusive lease store.
///
/// Guarantees:
/// - At most one non-stale lease exists per resource.
/// - `acquire` on a resource whose lease is stale always succeeds and reports
///   the reclaimed record, even if its holder crashed.
/// - `acquire` on a resource with a live lease fails with `LeaseHeld`, also
///   when the caller is the current holder (no re-entrancy, no upgrade).
pub trait LeaseStore: Send + Sync {
    /// Acquire `resource` for `holder` with staleness threshold `ttl`.
    fn acquire(
        &self,
        resource: &str,
        holder: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> StorageResult<LeaseAcquisition>;

    /// Extend a lease the caller still owns.
    fn renew(&self, resource: &str, holder: &str, now: DateTime<Utc>)
        -> StorageResult<LeaseRecord>;

    /// Release a lease the caller owns. Releasing an absent lease is a no-op;
    /// releasing someone else's lease fails with `LeaseLost`.
    fn release(&self, resource: &str, holder: &str) -> StorageResult<()>;

    /// Inspect the current lease record, stale or not.
    fn current(&self, resource: &str) -> StorageResult<Option<LeaseRecord>>;
}

// ---------------------------------------------------------------------------
// SymptomQueue
// ---------------------------------------------------------------------------

/// One observation from the external symptom monitor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymptomRecord {
    /// Idempotency key. Redelivered records carry the same id.
    pub id: String,
    /// Symptom name (e.g. "swap_pressure", "slow_first_token").
    pub symptom: String,
    /// Producer-defined severity; larger is worse.
    pub severity: f64,
    /// When the producer observed the symptom.
    pub observed_at: DateTime<Utc>,
}

impl SymptomRecord {
    /// Build a record with a fresh random id.
    pub fn new(symptom: &str, severity: f64, observed_at: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            symptom: symptom.to_string(),
            severity,
            observed_at,
        }
    }
}

/// Symptom feed with an idempotency ledger.
///
/// Semantics:
/// - `publish` may be called any number of times for the same record id;
///   consumers observe it at most once after it has been marked processed.
/// - `pending` returns records in publish order, deduplicated by id, that
///   have not been marked processed.
/// - `mark_processed` is idempotent.
pub trait SymptomQueue: Send + Sync {
    /// Append a record to the feed.
    fn publish(&self, record: &SymptomRecord) -> StorageResult<()>;

    /// Unprocessed records, oldest first, at most `limit`.
    fn pending(&self, limit: usize) -> StorageResult<Vec<SymptomRecord>>;

    /// Record that `id` has been applied.
    fn mark_processed(&self, id: &str) -> StorageResult<()>;
}
