//! Trait contract tests for LeaseStore and SymptomQueue.
//!
//! Every contract runs against both the in-memory fake and the file-backed
//! implementation. Any conforming implementation must pass these.

use chrono::{Duration, Utc};
use crucible_state::fakes::{MemoryLeaseStore, MemorySymptomQueue};
use crucible_state::storage_traits::*;
use crucible_state::{FsLeaseStore, FsSymptomQueue, StorageError};

// ===========================================================================
// LeaseStore contracts
// ===========================================================================

fn lease_acquire_is_exclusive(store: &dyn LeaseStore) {
    let now = Utc::now();
    store.acquire("cycle", "a", Duration::seconds(60), now).unwrap();

    let err = store
        .acquire("cycle", "b", Duration::seconds(60), now + Duration::seconds(1))
        .unwrap_err();
    assert!(err.is_contention(), "got {err:?}");

    // No re-entrancy for the holder either.
    let err = store
        .acquire("cycle", "a", Duration::seconds(60), now + Duration::seconds(1))
        .unwrap_err();
    assert!(matches!(err, StorageError::LeaseHeld { .. }));
}

fn lease_stale_is_reclaimed(store: &dyn LeaseStore) {
    let t0 = Utc::now();
    store.acquire("cycle", "crashed", Duration::seconds(30), t0).unwrap();

    let got = store
        .acquire("cycle", "next", Duration::seconds(30), t0 + Duration::seconds(31))
        .unwrap();
    assert_eq!(got.lease.holder, "next");
    let reclaimed = got.reclaimed.expect("stale lease reported");
    assert_eq!(reclaimed.holder, "crashed");

    let current = store.current("cycle").unwrap().unwrap();
    assert_eq!(current.holder, "next");
}

fn lease_renew_extends_expiry(store: &dyn LeaseStore) {
    let t0 = Utc::now();
    store.acquire("validator", "a", Duration::seconds(30), t0).unwrap();
    let renewed = store
        .renew("validator", "a", t0 + Duration::seconds(25))
        .unwrap();
    assert_eq!(renewed.expires_at(), t0 + Duration::seconds(55));

    // Still live at t0+40 thanks to the renewal.
    let err = store
        .acquire("validator", "b", Duration::seconds(30), t0 + Duration::seconds(40))
        .unwrap_err();
    assert!(err.is_contention());
}

fn lease_renew_by_stranger_fails(store: &dyn LeaseStore) {
    let now = Utc::now();
    store.acquire("cycle", "a", Duration::seconds(30), now).unwrap();
    let err = store.renew("cycle", "b", now).unwrap_err();
    assert!(matches!(err, StorageError::LeaseLost { .. }));
}

fn lease_release_then_reacquire(store: &dyn LeaseStore) {
    let now = Utc::now();
    store.acquire("cycle", "a", Duration::seconds(30), now).unwrap();

    let err = store.release("cycle", "b").unwrap_err();
    assert!(matches!(err, StorageError::LeaseLost { .. }));

    store.release("cycle", "a").unwrap();
    store.release("cycle", "a").unwrap();
    assert!(store.current("cycle").unwrap().is_none());

    let got = store.acquire("cycle", "b", Duration::seconds(30), now).unwrap();
    assert!(got.reclaimed.is_none());
}

fn lease_resources_are_independent(store: &dyn LeaseStore) {
    let now = Utc::now();
    store.acquire("cycle", "a", Duration::seconds(30), now).unwrap();
    store.acquire("validator", "a", Duration::seconds(30), now).unwrap();
}

fn run_lease_contracts(make: impl Fn() -> Box<dyn LeaseStore>) {
    lease_acquire_is_exclusive(make().as_ref());
    lease_stale_is_reclaimed(make().as_ref());
    lease_renew_extends_expiry(make().as_ref());
    lease_renew_by_stranger_fails(make().as_ref());
    lease_release_then_reacquire(make().as_ref());
    lease_resources_are_independent(make().as_ref());
}

#[test]
fn memory_lease_store_contracts() {
    run_lease_contracts(|| Box::new(MemoryLeaseStore::new()));
}

#[test]
fn fs_lease_store_contracts() {
    let root = tempfile::tempdir().unwrap();
    let counter = std::cell::Cell::new(0);
    run_lease_contracts(|| {
        counter.set(counter.get() + 1);
        Box::new(FsLeaseStore::new(root.path().join(counter.get().to_string())))
    });
}

#[test]
fn fs_stale_lease_has_exactly_one_reclaimer() {
    let dir = tempfile::tempdir().unwrap();
    let store = FsLeaseStore::new(dir.path());
    let t0 = Utc::now();
    store.acquire("cycle", "crashed", Duration::seconds(10), t0).unwrap();

    let later = t0 + Duration::seconds(60);
    let winners: Vec<bool> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = &store;
                s.spawn(move || {
                    store
                        .acquire("cycle", &format!("worker-{i}"), Duration::seconds(600), later)
                        .is_ok()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert_eq!(winners.iter().filter(|w| **w).count(), 1);
    let holder = store.current("cycle").unwrap().unwrap().holder;
    assert!(holder.starts_with("worker-"));
}

// ===========================================================================
// SymptomQueue contracts
// ===========================================================================

fn queue_pending_in_publish_order(queue: &dyn SymptomQueue) {
    let now = Utc::now();
    let a = SymptomRecord::new("x", 1.0, now);
    let b = SymptomRecord::new("y", 2.0, now);
    queue.publish(&a).unwrap();
    queue.publish(&b).unwrap();

    let pending = queue.pending(10).unwrap();
    let ids: Vec<_> = pending.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(ids, vec![a.id.as_str(), b.id.as_str()]);

    assert_eq!(queue.pending(1).unwrap().len(), 1);
}

fn queue_duplicates_collapse(queue: &dyn SymptomQueue) {
    let rec = SymptomRecord::new("x", 1.0, Utc::now());
    for _ in 0..3 {
        queue.publish(&rec).unwrap();
    }
    assert_eq!(queue.pending(10).unwrap().len(), 1);

    queue.mark_processed(&rec.id).unwrap();
    queue.publish(&rec).unwrap();
    assert!(queue.pending(10).unwrap().is_empty());
}

fn queue_mark_processed_is_idempotent(queue: &dyn SymptomQueue) {
    queue.mark_processed("never-published").unwrap();
    queue.mark_processed("never-published").unwrap();
    assert!(queue.pending(10).unwrap().is_empty());
}

#[test]
fn memory_symptom_queue_contracts() {
    queue_pending_in_publish_order(&MemorySymptomQueue::new());
    queue_duplicates_collapse(&MemorySymptomQueue::new());
    queue_mark_processed_is_idempotent(&MemorySymptomQueue::new());
}

#[test]
fn fs_symptom_queue_contracts() {
    let root = tempfile::tempdir().unwrap();
    queue_pending_in_publish_order(&FsSymptomQueue::new(root.path().join("a")));
    queue_duplicates_collapse(&FsSymptomQueue::new(root.path().join("b")));
    queue_mark_processed_is_idempotent(&FsSymptomQueue::new(root.path().join("c")));
}
