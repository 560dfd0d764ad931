//! File-backed `LeaseStore`.
//!
//! Each resource maps to `<dir>/<resource>.lease` (the lease record, JSON)
//! and `<dir>/<resource>.lock` (a guard file). Every read-check-write of a
//! lease record happens under an exclusive `flock` on the guard file, so
//! concurrent acquirers in any process serialise. The kernel drops the flock
//! when its holder dies; the lease record itself only goes away through
//! release or reclaim-on-expiry.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, warn};

use crate::atomic::{read_json_opt, write_json_atomic};
use crate::error::StorageError;
use crate::storage_traits::{LeaseAcquisition, LeaseRecord, LeaseStore, StorageResult};

#[cfg(unix)]
type SlotGuard = nix::fcntl::Flock<File>;
#[cfg(not(unix))]
type SlotGuard = File;

/// Lease store over a shared directory.
#[derive(Debug, Clone)]
pub struct FsLeaseStore {
    dir: PathBuf,
}

impl FsLeaseStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn file_stem(resource: &str) -> String {
        resource
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                    c
                } else {
                    '_'
                }
            })
            .collect()
    }

    fn lease_path(&self, resource: &str) -> PathBuf {
        self.dir.join(format!("{}.lease", Self::file_stem(resource)))
    }

    /// Block until this process holds the guard for `resource`.
    fn lock_slot(&self, resource: &str) -> StorageResult<SlotGuard> {
        fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(format!("{}.lock", Self::file_stem(resource)));
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)?;

        #[cfg(unix)]
        {
            use nix::fcntl::{Flock, FlockArg};
            Flock::lock(file, FlockArg::LockExclusive)
                .map_err(|(_, errno)| StorageError::Io(std::io::Error::from(errno)))
        }
        #[cfg(not(unix))]
        {
            Ok(file)
        }
    }

    fn read_record(&self, path: &Path, resource: &str) -> StorageResult<Option<LeaseRecord>> {
        match read_json_opt::<LeaseRecord>(path) {
            Err(StorageError::Corrupt { reason, .. }) => {
                warn!(resource, %reason, "lease file unreadable; treating as stale");
                Ok(None)
            }
            other => other,
        }
    }
}

impl LeaseStore for FsLeaseStore {
    fn acquire(
        &self,
        resource: &str,
        holder: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> StorageResult<LeaseAcquisition> {
        let _guard = self.lock_slot(resource)?;
        let path = self.lease_path(resource);

        let reclaimed = match self.read_record(&path, resource)? {
            Some(existing) if !existing.is_stale(now) => {
                return Err(StorageError::LeaseHeld {
                    resource: resource.to_string(),
                    expires_at: existing.expires_at(),
                    holder: existing.holder,
                });
            }
            Some(stale) => {
                debug!(
                    resource,
                    stale_holder = %stale.holder,
                    expired_at = %stale.expires_at(),
                    new_holder = holder,
                    "reclaimed stale lease"
                );
                Some(stale)
            }
            None => None,
        };

        let lease = LeaseRecord::new(resource, holder, ttl, now);
        write_json_atomic(&path, &lease)?;
        Ok(LeaseAcquisition { lease, reclaimed })
    }

    fn renew(
        &self,
        resource: &str,
        holder: &str,
        now: DateTime<Utc>,
    ) -> StorageResult<LeaseRecord> {
        let _guard = self.lock_slot(resource)?;
        let path = self.lease_path(resource);
        match self.read_record(&path, resource)? {
            Some(mut record) if record.holder == holder => {
                record.renewed_at = now;
                write_json_atomic(&path, &record)?;
                Ok(record)
            }
            _ => Err(StorageError::LeaseLost {
                resource: resource.to_string(),
                holder: holder.to_string(),
            }),
        }
    }

    fn release(&self, resource: &str, holder: &str) -> StorageResult<()> {
        let _guard = self.lock_slot(resource)?;
        let path = self.lease_path(resource);
        match self.read_record(&path, resource)? {
            None => Ok(()),
            Some(record) if record.holder == holder => match fs::remove_file(&path) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e.into()),
            },
            Some(_) => Err(StorageError::LeaseLost {
                resource: resource.to_string(),
                holder: holder.to_string(),
            }),
        }
    }

    fn current(&self, resource: &str) -> StorageResult<Option<LeaseRecord>> {
        read_json_opt(&self.lease_path(resource))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_names_are_sanitised() {
        let store = FsLeaseStore::new("/tmp/leases");
        assert_eq!(
            store.lease_path("a/b c"),
            PathBuf::from("/tmp/leases/a_b_c.lease")
        );
    }

    #[test]
    fn corrupt_lease_file_is_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsLeaseStore::new(dir.path());
        fs::write(dir.path().join("cycle.lease"), b"{garbage").unwrap();

        let got = store
            .acquire("cycle", "b", Duration::seconds(60), Utc::now())
            .unwrap();
        assert_eq!(got.lease.holder, "b");
        assert!(got.reclaimed.is_none());
    }

    #[test]
    fn held_lease_reports_holder_and_expiry() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsLeaseStore::new(dir.path());
        let t0 = Utc::now();
        store
            .acquire("cycle", "host-a:7", Duration::seconds(60), t0)
            .unwrap();

        match store.acquire("cycle", "host-b:9", Duration::seconds(60), t0 + Duration::seconds(5)) {
            Err(StorageError::LeaseHeld {
                resource,
                holder,
                expires_at,
            }) => {
                assert_eq!(resource, "cycle");
                assert_eq!(holder, "host-a:7");
                assert_eq!(expires_at, t0 + Duration::seconds(60));
            }
            other => panic!("expected LeaseHeld, got {other:?}"),
        }
    }

    #[test]
    fn lease_file_is_plain_json() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsLeaseStore::new(dir.path());
        store
            .acquire("validator", "host:1", Duration::seconds(60), Utc::now())
            .unwrap();
        let raw = fs::read_to_string(dir.path().join("validator.lease")).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed["holder"], "host:1");
        assert_eq!(parsed["ttl_secs"], 60);
    }
}
