//! Global atomic counters for Crucible.
//!
//! Counters are incremented silently at the call site. Call
//! [`Metrics::flush`] to emit current values as a single
//! `tracing::info!` event at the end of a cycle.

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

pub struct Metrics {
    evaluations: AtomicU64,
    disqualifications: AtomicU64,
    matches: AtomicU64,
    rounds: AtomicU64,
    promotions: AtomicU64,
    rollbacks: AtomicU64,
    stale_leases_reclaimed: AtomicU64,
    cycles: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

macro_rules! counter {
    ($inc:ident, $get:ident, $field:ident) => {
        pub fn $inc(&self) {
            self.$field.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(metric = stringify!($field), "counter incremented");
        }

        pub fn $get(&self) -> u64 {
            self.$field.load(Ordering::Relaxed)
        }
    };
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            evaluations: AtomicU64::new(0),
            disqualifications: AtomicU64::new(0),
            matches: AtomicU64::new(0),
            rounds: AtomicU64::new(0),
            promotions: AtomicU64::new(0),
            rollbacks: AtomicU64::new(0),
            stale_leases_reclaimed: AtomicU64::new(0),
            cycles: AtomicU64::new(0),
        }
    }

    counter!(inc_evaluations, evaluations, evaluations);
    counter!(inc_disqualifications, disqualifications, disqualifications);
    counter!(inc_matches, matches, matches);
    counter!(inc_rounds, rounds, rounds);
    counter!(inc_promotions, promotions, promotions);
    counter!(inc_rollbacks, rollbacks, rollbacks);
    counter!(inc_stale_leases_reclaimed, stale_leases_reclaimed, stale_leases_reclaimed);
    counter!(inc_cycles, cycles, cycles);

    /// Emit all current counter values as a single `info!` event.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            evaluations = self.evaluations(),
            disqualifications = self.disqualifications(),
            matches = self.matches(),
            rounds = self.rounds(),
            promotions = self.promotions(),
            rollbacks = self.rollbacks(),
            stale_leases_reclaimed = self.stale_leases_reclaimed(),
            cycles = self.cycles(),
        );
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        for c in [
            &self.evaluations,
            &self.disqualifications,
            &self.matches,
            &self.rounds,
            &self.promotions,
            &self.rollbacks,
            &self.stale_leases_reclaimed,
            &self.cycles,
        ] {
            c.store(0, Ordering::Relaxed);
        }
    }
}
