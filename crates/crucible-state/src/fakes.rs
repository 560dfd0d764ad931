//! In-memory fakes for storage traits (testing only)
//!
//! Provides `MemoryLeaseStore` and `MemorySymptomQueue` that satisfy the
//! trait contracts without touching the filesystem.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use crate::error::StorageError;
use crate::storage_traits::*;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ---------------------------------------------------------------------------
// MemoryLeaseStore
// ---------------------------------------------------------------------------

/// In-memory lease store backed by a `HashMap<resource, LeaseRecord>`.
#[derive(Debug, Default)]
pub struct MemoryLeaseStore {
    leases: Mutex<HashMap<String, LeaseRecord>>,
}

impl MemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LeaseStore for MemoryLeaseStore {
    fn acquire(
        &self,
        resource: &str,
        holder: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> StorageResult<LeaseAcquisition> {
        let mut leases = lock(&self.leases);
        let reclaimed = match leases.get(resource) {
            Some(existing) if !existing.is_stale(now) => {
                return Err(StorageError::LeaseHeld {
                    resource: resource.to_string(),
                    holder: existing.holder.clone(),
                    expires_at: existing.expires_at(),
                });
            }
            Some(stale) => {
                debug!(
                    resource,
                    stale_holder = %stale.holder,
                    new_holder = holder,
                    "reclaimed stale lease"
                );
                Some(stale.clone())
            }
            None => None,
        };
        let lease = LeaseRecord::new(resource, holder, ttl, now);
        leases.insert(resource.to_string(), lease.clone());
        Ok(LeaseAcquisition { lease, reclaimed })
    }

    fn renew(
        &self,
        resource: &str,
        holder: &str,
        now: DateTime<Utc>,
    ) -> StorageResult<LeaseRecord> {
        let mut leases = lock(&self.leases);
        match leases.get_mut(resource) {
            Some(record) if record.holder == holder => {
                record.renewed_at = now;
                Ok(record.clone())
            }
            _ => Err(StorageError::LeaseLost {
                resource: resource.to_string(),
                holder: holder.to_string(),
            }),
        }
    }

    fn release(&self, resource: &str, holder: &str) -> StorageResult<()> {
        let mut leases = lock(&self.leases);
        match leases.get(resource) {
            None => Ok(()),
            Some(record) if record.holder == holder => {
                leases.remove(resource);
                Ok(())
            }
            Some(_) => Err(StorageError::LeaseLost {
                resource: resource.to_string(),
                holder: holder.to_string(),
            }),
        }
    }

    fn current(&self, resource: &str) -> StorageResult<Option<LeaseRecord>> {
        Ok(lock(&self.leases).get(resource).cloned())
    }
}

// ---------------------------------------------------------------------------
// MemorySymptomQueue
// ---------------------------------------------------------------------------

/// In-memory symptom feed with a processed-id set.
#[derive(Debug, Default)]
pub struct MemorySymptomQueue {
    feed: Mutex<Vec<SymptomRecord>>,
    processed: Mutex<HashSet<String>>,
}

impl MemorySymptomQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of ids in the processed ledger.
    pub fn processed_count(&self) -> usize {
        lock(&self.processed).len()
    }
}

impl SymptomQueue for MemorySymptomQueue {
    fn publish(&self, record: &SymptomRecord) -> StorageResult<()> {
        lock(&self.feed).push(record.clone());
        Ok(())
    }

    fn pending(&self, limit: usize) -> StorageResult<Vec<SymptomRecord>> {
        let feed = lock(&self.feed);
        let mut seen = lock(&self.processed).clone();
        Ok(feed
            .iter()
            .filter(|r| seen.insert(r.id.clone()))
            .take(limit)
            .cloned()
            .collect())
    }

    fn mark_processed(&self, id: &str) -> StorageResult<()> {
        lock(&self.processed).insert(id.to_string());
        Ok(())
    }
}
