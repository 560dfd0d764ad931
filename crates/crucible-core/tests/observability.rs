//! Observability tests for Crucible cycle lifecycle tracing.
//!
//! Every scheduler decision is emitted with a stable `event = "..."` key and
//! counted in the global metrics.

mod common;

use std::sync::Arc;

use chrono::{TimeZone, Utc};
use tracing_test::traced_test;

use crucible_core::obs::{
    emit_cycle_error, emit_escalation_armed, emit_escalation_deferred, emit_evaluation_finished,
    emit_promotion_transition, emit_round_finished, emit_validation_suspended,
};
use crucible_core::{
    CycleOptions, CycleOutcome, CycleRunner, CycleSpan, FixedDiskProbe, ManualClock, METRICS,
};

use common::{config, window_open, ScriptedWorkload};

#[traced_test]
#[test]
fn evaluation_event_carries_status_and_fitness() {
    emit_evaluation_finished("inst-7f3a", "timeout", -1.0, 30_000);
    assert!(logs_contain("evaluation.finished"));
    assert!(logs_contain("inst-7f3a"));
    assert!(logs_contain("timeout"));
}

#[traced_test]
#[test]
fn round_event_names_the_bye() {
    emit_round_finished(1, 2, Some("inst-bye"), 40);
    assert!(logs_contain("round.finished"));
    assert!(logs_contain("inst-bye"));
}

#[traced_test]
#[test]
fn suspension_is_a_warning() {
    emit_validation_suspended("inst-soak", 3, 8);
    assert!(logs_contain("WARN"));
    assert!(logs_contain("validation.suspended"));
}

#[traced_test]
#[test]
fn promotion_transition_logs_both_states() {
    emit_promotion_transition("promo-1", "pending", "rolled_back", "verify failed");
    assert!(logs_contain("promotion.transition"));
    assert!(logs_contain("rolled_back"));
    assert!(logs_contain("verify failed"));
}

#[traced_test]
#[test]
fn escalation_events_list_their_symptoms() {
    let expires = Utc.with_ymd_and_hms(2026, 3, 11, 2, 0, 0).unwrap();
    emit_escalation_armed("swap_pressure", 3, expires);
    emit_escalation_deferred(
        &["window".to_string(), "budget".to_string()],
        &["swap_pressure".to_string()],
    );
    assert!(logs_contain("escalation.armed"));
    assert!(logs_contain("escalation.deferred"));
    assert!(logs_contain("window,budget"));
}

#[traced_test]
#[test]
fn cycle_span_tags_events_inside_it() {
    let _span = CycleSpan::enter("cycle-obs-span");
    emit_cycle_error("cycle-obs-span", &"promotion poll failed");
    assert!(logs_contain("crucible.cycle"));
    assert!(logs_contain("cycle.error"));
    assert!(logs_contain("promotion poll failed"));
}

#[traced_test]
#[tokio::test]
async fn dry_run_cycle_emits_bracket_events_and_counts_them() {
    let dir = tempfile::tempdir().unwrap();
    let runner = CycleRunner::new(config(dir.path()), Arc::new(ScriptedWorkload::new()))
        .with_clock(Arc::new(ManualClock::new(window_open())))
        .with_leases(Arc::new(crucible_state::fakes::MemoryLeaseStore::new()))
        .with_disk_probe(Arc::new(FixedDiskProbe::new(u64::MAX)));

    let before = (METRICS.cycles(), METRICS.matches(), METRICS.rounds());
    let report = runner
        .run_cycle(CycleOptions {
            dry_run: true,
            ..CycleOptions::default()
        })
        .await
        .unwrap();
    assert_eq!(report.outcome, CycleOutcome::DryRun);

    // Counters are process-wide; other tests may bump them concurrently.
    assert!(METRICS.cycles() > before.0);
    assert!(METRICS.matches() >= before.1 + 3);
    assert!(METRICS.rounds() >= before.2 + 2);

    assert!(logs_contain("cycle.started"));
    assert!(logs_contain("evaluation.finished"));
    assert!(logs_contain("round.finished"));
    assert!(logs_contain("cycle.finished"));
    assert!(logs_contain(&report.cycle_id));
}
