//! Structured observability hooks for Crucible cycle lifecycle events.
//!
//! This module provides:
//! - Cycle-scoped tracing spans via the `CycleSpan` RAII guard
//! - Emission functions with stable `event = "..."` keys for every decision
//!   the scheduler makes
//!
//! Events are emitted at `info!` level unless they describe a degradation
//! (`warn!`). Filter with `CRUCIBLE_LOG`; set `CRUCIBLE_LOG_FORMAT=json` for
//! JSON lines.

use chrono::{DateTime, Utc};
use tracing::{info, warn};

/// RAII guard that enters a cycle-scoped span for the duration of a cycle.
///
/// ```ignore
/// let _span = CycleSpan::enter("cycle-1a2b");
/// // every event below carries cycle_id = "cycle-1a2b"
/// ```
pub struct CycleSpan {
    _span: tracing::span::EnteredSpan,
}

impl CycleSpan {
    pub fn enter(cycle_id: &str) -> Self {
        Self {
            _span: cycle_span(cycle_id).entered(),
        }
    }
}

/// The cycle span itself, for instrumenting async work that must stay
/// `Send` (an entered guard cannot be held across `.await`).
pub fn cycle_span(cycle_id: &str) -> tracing::Span {
    tracing::info_span!("crucible.cycle", cycle_id = %cycle_id)
}

pub fn emit_cycle_started(cycle_id: &str, forced: bool, dry_run: bool) {
    info!(event = "cycle.started", cycle_id = %cycle_id, forced, dry_run);
}

pub fn emit_cycle_finished(cycle_id: &str, outcome: &str, duration_ms: u64) {
    info!(event = "cycle.finished", cycle_id = %cycle_id, outcome = %outcome, duration_ms);
}

/// Emit event: one fitness evaluation completed (any status).
pub fn emit_evaluation_finished(instance_id: &str, status: &str, fitness: f64, duration_ms: u64) {
    info!(
        event = "evaluation.finished",
        instance_id = %instance_id,
        status = %status,
        fitness,
        duration_ms,
    );
}

/// Emit event: a match was decided. `tie_break` is present only when the
/// fitness values were equal.
pub fn emit_match_decided(
    round: usize,
    winner: &str,
    loser: &str,
    margin: f64,
    tie_break: Option<&str>,
) {
    info!(
        event = "match.decided",
        round,
        winner = %winner,
        loser = %loser,
        margin,
        tie_break = tie_break.unwrap_or(""),
    );
}

pub fn emit_round_finished(round: usize, matches: usize, bye: Option<&str>, duration_ms: u64) {
    info!(
        event = "round.finished",
        round,
        matches,
        bye = bye.unwrap_or(""),
        duration_ms,
    );
}

pub fn emit_validation_unit_finished(instance_id: &str, unit: &str, status: &str, passed: u64, failed: u64) {
    info!(
        event = "validation.unit_finished",
        instance_id = %instance_id,
        unit = %unit,
        status = %status,
        passed,
        failed,
    );
}

/// Emit event: the maintenance window closed mid-run and progress was
/// checkpointed.
pub fn emit_validation_suspended(instance_id: &str, completed: usize, total: usize) {
    warn!(
        event = "validation.suspended",
        instance_id = %instance_id,
        completed,
        total,
    );
}

pub fn emit_promotion_written(promotion_id: &str, instance_id: &str, fitness: f64) {
    info!(
        event = "promotion.written",
        promotion_id = %promotion_id,
        instance_id = %instance_id,
        fitness,
    );
}

pub fn emit_promotion_transition(promotion_id: &str, from: &str, to: &str, reason: &str) {
    info!(
        event = "promotion.transition",
        promotion_id = %promotion_id,
        from = %from,
        to = %to,
        reason = %reason,
    );
}

pub fn emit_escalation_armed(symptom: &str, occurrences: usize, expires_at: DateTime<Utc>) {
    warn!(
        event = "escalation.armed",
        symptom = %symptom,
        occurrences,
        expires_at = %expires_at,
    );
}

pub fn emit_escalation_expired(symptom: &str) {
    info!(event = "escalation.expired", symptom = %symptom);
}

pub fn emit_escalation_deferred(blocked: &[String], symptoms: &[String]) {
    info!(
        event = "escalation.deferred",
        blocked = %blocked.join(","),
        symptoms = %symptoms.join(","),
    );
}

/// Emit event: a stale lease was reclaimed from a holder that stopped
/// renewing it.
pub fn emit_lease_reclaimed(resource: &str, previous_holder: &str, expired_at: DateTime<Utc>) {
    warn!(
        event = "lease.reclaimed",
        resource = %resource,
        previous_holder = %previous_holder,
        expired_at = %expired_at,
    );
}

/// Emit event: a non-fatal failure the tick loop carried on past.
pub fn emit_cycle_error(cycle_id: &str, error: &dyn std::fmt::Display) {
    warn!(event = "cycle.error", cycle_id = %cycle_id, error = %error);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[test]
    fn cycle_span_enters() {
        let _span = CycleSpan::enter("cycle-test");
    }

    #[traced_test]
    #[test]
    fn match_event_carries_tie_break() {
        emit_match_decided(0, "inst-a", "inst-b", 0.0, Some("equal fitness"));
        assert!(logs_contain("match.decided"));
        assert!(logs_contain("equal fitness"));
    }
}
