//! crucible-state: file-backed coordination state for Crucible
//!
//! ## Layer 0 - Data/Persistence
//!
//! Focus: never exposing a partial write, and coordinating independent
//! cycle invocations through a shared directory.
//!
//! ## Key Components
//!
//! - `atomic`: write-temp-then-rename helpers
//! - `JsonlLog`: append-only line-delimited JSON logs
//! - `LeaseStore` / `FsLeaseStore`: TTL leases with reclaim-on-expiry
//! - `SymptomQueue` / `FsSymptomQueue`: symptom feed with processed-id ledger
//! - `ContentDigest`: SHA-256 content addressing

pub mod atomic;
mod error;
pub mod fakes;
pub mod fs_lease;
pub mod fs_queue;
pub mod jsonl;
pub mod storage_traits;

pub use error::StorageError;
pub use fs_lease::FsLeaseStore;
pub use fs_queue::FsSymptomQueue;
pub use jsonl::JsonlLog;
pub use storage_traits::{
    ContentDigest, LeaseAcquisition, LeaseRecord, LeaseStore, StorageResult, SymptomQueue,
    SymptomRecord,
};
