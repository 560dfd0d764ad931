//! Retention Manager: keeps the instance tree within count, age and
//! free-space limits before each spawn.

use std::collections::HashSet;
use std::io;
use std::path::Path;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::info;

use crate::config::RetentionConfig;
use crate::domain::error::{CrucibleError, Result};
use crate::domain::instance::InstanceId;
use crate::spawner::InstanceStore;

/// Free-space source for the filesystem holding the instance tree.
pub trait DiskProbe: Send + Sync {
    fn free_bytes(&self, path: &Path) -> io::Result<u64>;
}

/// `statvfs(2)`-backed probe.
#[derive(Debug, Default, Clone, Copy)]
pub struct StatvfsProbe;

impl DiskProbe for StatvfsProbe {
    #[cfg(unix)]
    fn free_bytes(&self, path: &Path) -> io::Result<u64> {
        let stat = nix::sys::statvfs::statvfs(path).map_err(io::Error::from)?;
        #[allow(clippy::useless_conversion)]
        let avail = u64::from(stat.blocks_available()) * u64::from(stat.fragment_size());
        Ok(avail)
    }

    #[cfg(not(unix))]
    fn free_bytes(&self, _path: &Path) -> io::Result<u64> {
        Ok(u64::MAX)
    }
}

/// Reports a fixed amount of free space, optionally growing as instances
/// are deleted.
#[derive(Debug)]
pub struct FixedDiskProbe {
    free: std::sync::atomic::AtomicU64,
}

impl FixedDiskProbe {
    pub fn new(free: u64) -> Self {
        Self {
            free: std::sync::atomic::AtomicU64::new(free),
        }
    }

    pub fn set(&self, free: u64) {
        self.free.store(free, std::sync::atomic::Ordering::SeqCst);
    }
}

impl DiskProbe for FixedDiskProbe {
    fn free_bytes(&self, _path: &Path) -> io::Result<u64> {
        Ok(self.free.load(std::sync::atomic::Ordering::SeqCst))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub max_instances: usize,
    pub max_age: Duration,
    pub min_free_bytes: u64,
}

impl From<&RetentionConfig> for RetentionPolicy {
    fn from(cfg: &RetentionConfig) -> Self {
        Self {
            max_instances: cfg.max_instances,
            max_age: Duration::days(i64::from(cfg.max_age_days)),
            min_free_bytes: cfg.min_free_bytes,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RetentionReport {
    pub pruned: Vec<InstanceId>,
    pub remaining: usize,
    pub free_bytes: u64,
}

pub struct RetentionManager<'a> {
    policy: RetentionPolicy,
    probe: &'a dyn DiskProbe,
}

impl<'a> RetentionManager<'a> {
    pub fn new(policy: RetentionPolicy, probe: &'a dyn DiskProbe) -> Self {
        Self { policy, probe }
    }

    fn free(&self, store: &InstanceStore) -> Result<u64> {
        let probe_path = if store.dir().exists() {
            store.dir()
        } else {
            store.dir().parent().unwrap_or(store.dir())
        };
        Ok(self.probe.free_bytes(probe_path)?)
    }

    fn compliant(&self, count: usize, free: u64) -> bool {
        count < self.policy.max_instances && free >= self.policy.min_free_bytes
    }

    /// Make room for one more instance. Protected instances are never
    /// deleted; if the limits cannot be met without touching them the spawn
    /// must be refused.
    pub fn ensure_capacity(
        &self,
        store: &InstanceStore,
        protected: &HashSet<InstanceId>,
        now: DateTime<Utc>,
    ) -> Result<RetentionReport> {
        let mut listed = store.list()?;
        let mut free = self.free(store)?;
        let mut report = RetentionReport::default();

        if !self.compliant(listed.len(), free) {
            // Pass 1: everything unprotected past max age.
            let cutoff = now - self.policy.max_age;
            let expired: Vec<InstanceId> = listed
                .iter()
                .filter(|(id, created)| *created < cutoff && !protected.contains(id))
                .map(|(id, _)| id.clone())
                .collect();
            for id in expired {
                store.remove(&id)?;
                info!(instance_id = %id, reason = "max_age", "instance pruned");
                listed.retain(|(other, _)| other != &id);
                report.pruned.push(id);
            }
            free = self.free(store)?;
        }

        // Pass 2: oldest unprotected first, one at a time.
        while !self.compliant(listed.len(), free) {
            let Some(pos) = listed.iter().position(|(id, _)| !protected.contains(id)) else {
                return Err(CrucibleError::RetentionExhausted(format!(
                    "{} instances ({} protected), {} bytes free, need < {} instances and >= {} bytes",
                    listed.len(),
                    protected.len(),
                    free,
                    self.policy.max_instances,
                    self.policy.min_free_bytes
                )));
            };
            let (id, _) = listed.remove(pos);
            store.remove(&id)?;
            info!(instance_id = %id, reason = "capacity", "instance pruned");
            report.pruned.push(id);
            free = self.free(store)?;
        }

        report.remaining = listed.len();
        report.free_bytes = free;
        Ok(report)
    }
}
