//! Lease helpers shared by the cycle runner and the validator.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use crucible_state::{LeaseRecord, LeaseStore};

use crate::clock::Clock;
use crate::domain::error::{CrucibleError, Result};
use crate::metrics::METRICS;
use crate::obs;

pub const CYCLE_LEASE: &str = "cycle";
pub const VALIDATOR_LEASE: &str = "validator";

/// Holder identity: `<host>:<pid>:<nonce>`.
pub fn holder_id() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
    let nonce = uuid::Uuid::new_v4().simple().to_string();
    format!("{host}:{}:{}", std::process::id(), &nonce[..8])
}

/// Acquire `resource`, reporting any reclaimed stale lease. A reclaim is
/// logged and counted, never fatal.
pub fn acquire(
    store: &dyn LeaseStore,
    resource: &str,
    holder: &str,
    ttl: Duration,
    now: DateTime<Utc>,
) -> Result<LeaseRecord> {
    let acquisition = store.acquire(resource, holder, ttl, now)?;
    if let Some(stale) = &acquisition.reclaimed {
        METRICS.inc_stale_leases_reclaimed();
        let note = CrucibleError::StaleLock {
            resource: stale.resource.clone(),
            holder: stale.holder.clone(),
        };
        tracing::debug!(%note);
        obs::emit_lease_reclaimed(resource, &stale.holder, stale.expires_at());
    }
    Ok(acquisition.lease)
}

/// Release, logging instead of failing: an unreleased lease only delays the
/// next acquirer until it goes stale.
pub fn release(store: &dyn LeaseStore, resource: &str, holder: &str) {
    if let Err(e) = store.release(resource, holder) {
        tracing::warn!(resource, holder, error = %e, "lease release failed");
    }
}

/// A lease this process holds while long work runs under it. Long-running
/// steps call [`HeldLease::renew`] at their boundaries; once another holder
/// has reclaimed the lease, renewal fails with `LeaseLost` and the work
/// must stop.
#[derive(Clone)]
pub struct HeldLease {
    store: Arc<dyn LeaseStore>,
    clock: Arc<dyn Clock>,
    resource: String,
    holder: String,
}

impl HeldLease {
    pub fn new(
        store: Arc<dyn LeaseStore>,
        clock: Arc<dyn Clock>,
        resource: &str,
        holder: &str,
    ) -> Self {
        Self {
            store,
            clock,
            resource: resource.to_string(),
            holder: holder.to_string(),
        }
    }

    /// Acquire `resource` and return the handle that keeps it.
    pub fn acquire(
        store: Arc<dyn LeaseStore>,
        clock: Arc<dyn Clock>,
        resource: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<Self> {
        acquire(store.as_ref(), resource, holder, ttl, clock.now())?;
        Ok(Self::new(store, clock, resource, holder))
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn renew(&self) -> Result<LeaseRecord> {
        let record = self
            .store
            .renew(&self.resource, &self.holder, self.clock.now())?;
        tracing::trace!(resource = %self.resource, expires_at = %record.expires_at(), "lease renewed");
        Ok(record)
    }

    pub fn release(&self) {
        release(self.store.as_ref(), &self.resource, &self.holder);
    }
}
