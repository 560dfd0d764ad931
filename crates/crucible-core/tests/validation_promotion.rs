//! Sequential validation and the promotion pipeline it feeds.

mod common;

use std::sync::Arc;

use chrono::Duration;
use crucible_state::fakes::MemoryLeaseStore;
use crucible_state::LeaseStore;

use crucible_core::config::{EvaluatorConfig, PromotionConfig, ValidatorConfig};
use crucible_core::domain::promotion::RollbackReason;
use crucible_core::lease::VALIDATOR_LEASE;
use crucible_core::{
    AckStatus, Clock, FitnessEvaluator, Instance, MaintenanceWindow, ManualClock,
    MetricBaseline, PromotionPipeline, PromotionStatus, SequentialValidator, ValidatedChampion,
    ValidationOutcome, Verdict,
};

use common::{quality, spawn, store, window_open, ScriptedWorkload};

struct Rig {
    _dir: tempfile::TempDir,
    root: std::path::PathBuf,
    clock: Arc<ManualClock>,
    leases: Arc<MemoryLeaseStore>,
    workload: Arc<ScriptedWorkload>,
}

impl Rig {
    fn new(advance_per_unit: Option<Duration>) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(window_open()));
        let workload = Arc::new(match advance_per_unit {
            Some(by) => ScriptedWorkload::advancing(Arc::clone(&clock), by),
            None => ScriptedWorkload::new(),
        });
        Self {
            root: dir.path().to_path_buf(),
            _dir: dir,
            clock,
            leases: Arc::new(MemoryLeaseStore::new()),
            workload,
        }
    }

    fn validator(&self, cfg: ValidatorConfig) -> SequentialValidator {
        let evaluator = Arc::new(FitnessEvaluator::new(
            self.workload.clone(),
            &EvaluatorConfig::default(),
        ));
        SequentialValidator::new(
            evaluator,
            cfg,
            MaintenanceWindow::parse("02:00", "05:00").unwrap(),
            self.clock.clone(),
            self.leases.clone(),
            "test-holder",
            Duration::minutes(30),
            self.root.join("validation"),
            MetricBaseline::new(self.root.join("baseline.jsonl")),
        )
    }

    fn pipeline(&self, ack_deadline_secs: u64) -> PromotionPipeline {
        let cfg = PromotionConfig {
            ack_deadline_secs,
            poll_interval_secs: 1,
        };
        PromotionPipeline::new(self.root.join("promotions"), &cfg, self.clock.clone())
    }

    fn instance(&self, q: i64) -> Instance {
        spawn(&store(&self.root), quality(q))
    }

    async fn champion(&self, q: i64) -> ValidatedChampion {
        let instance = self.instance(q);
        match self
            .validator(small_plan())
            .validate(&instance, Some(0.9), true)
            .await
            .unwrap()
        {
            ValidationOutcome::Completed {
                champion: Some(c), ..
            } => c,
            other => panic!("expected a validated champion, got {other:?}"),
        }
    }
}

fn small_plan() -> ValidatorConfig {
    ValidatorConfig {
        epochs: 1,
        slices: 2,
        replicas: 2,
        unit_timeout_secs: 30,
        ..ValidatorConfig::default()
    }
}

#[tokio::test]
async fn clean_champion_passes_every_unit() {
    let rig = Rig::new(None);
    let instance = rig.instance(100);
    let outcome = rig
        .validator(small_plan())
        .validate(&instance, Some(0.8), false)
        .await
        .unwrap();

    let ValidationOutcome::Completed { run, champion } = outcome else {
        panic!("validation should complete inside the window");
    };
    assert_eq!(run.verdict, Verdict::Pass);
    assert_eq!(run.units.len(), 4);
    assert_eq!(rig.workload.runs(), 4);
    let champion = champion.unwrap();
    assert_eq!(champion.instance_id(), &instance.id);
    assert!((champion.fitness() - 0.8).abs() < 1e-9);
    // The lease is released once validation ends.
    assert!(rig.leases.current(VALIDATOR_LEASE).unwrap().is_none());
}

#[tokio::test]
async fn failing_champion_yields_no_token() {
    let rig = Rig::new(None);
    let instance = rig.instance(60);
    let outcome = rig
        .validator(small_plan())
        .validate(&instance, None, true)
        .await
        .unwrap();
    let ValidationOutcome::Completed { run, champion } = outcome else {
        panic!("forced validation never suspends");
    };
    assert_eq!(run.verdict, Verdict::Fail);
    assert!((run.failure_rate - 0.4).abs() < 1e-9);
    assert!(champion.is_none());
}

#[tokio::test]
async fn closed_window_suspends_before_any_unit() {
    let rig = Rig::new(None);
    rig.clock.set(window_open() + Duration::hours(10));
    let instance = rig.instance(100);
    let outcome = rig
        .validator(small_plan())
        .validate(&instance, None, false)
        .await
        .unwrap();
    assert!(matches!(
        outcome,
        ValidationOutcome::Suspended { completed: 0, total: 4, .. }
    ));
    assert_eq!(rig.workload.runs(), 0);
}

#[tokio::test]
async fn window_close_checkpoints_and_next_night_resumes() {
    // Each unit takes an hour of the 02:00-05:00 window.
    let rig = Rig::new(Some(Duration::hours(1)));
    let instance = rig.instance(100);
    let validator = rig.validator(small_plan());

    let first = validator.validate(&instance, None, false).await.unwrap();
    assert!(matches!(
        first,
        ValidationOutcome::Suspended { completed: 3, total: 4, .. }
    ));
    let cp = validator.checkpoint(&instance.id).unwrap().unwrap();
    assert_eq!(cp.completed.len(), 3);

    rig.clock.set(window_open() + Duration::days(1));
    let second = validator.validate(&instance, None, false).await.unwrap();
    let ValidationOutcome::Completed { run, champion } = second else {
        panic!("second night should finish the plan");
    };
    assert_eq!(run.units.len(), 4);
    assert_eq!(rig.workload.runs(), 4, "completed units are not re-run");
    assert!(champion.is_some());
    assert!(validator.checkpoint(&instance.id).unwrap().is_none());
}

#[tokio::test]
async fn regression_against_baseline_fails_validation() {
    let rig = Rig::new(None);
    let baseline = MetricBaseline::new(rig.root.join("baseline.jsonl"));
    // Recent production history with no failures at all.
    for d in 1..=3 {
        baseline
            .record("failure_rate", 0.0, window_open() - Duration::days(d))
            .unwrap();
    }
    let mut cfg = small_plan();
    cfg.max_failure_rate = 0.5;
    cfg.max_regression = 0.01;
    let instance = rig.instance(97);

    let outcome = rig.validator(cfg).validate(&instance, None, true).await.unwrap();
    let ValidationOutcome::Completed { run, champion } = outcome else {
        panic!("forced validation never suspends");
    };
    assert_eq!(run.verdict, Verdict::Fail);
    assert_eq!(run.regressions.len(), 1);
    assert_eq!(run.regressions[0].metric, "failure_rate");
    assert!(champion.is_none());
}

#[tokio::test]
async fn promotion_waits_for_acknowledgement() {
    let rig = Rig::new(None);
    let champion = rig.champion(100).await;
    let pipeline = rig.pipeline(3600);

    let record = pipeline.promote(&champion).unwrap();
    assert_eq!(record.status, PromotionStatus::Pending);
    assert_eq!(&record.instance_id, champion.instance_id());
    // Re-promoting the same champion is a no-op.
    assert_eq!(pipeline.promote(&champion).unwrap().promotion_id, record.promotion_id);

    // No acknowledgement: production does not move.
    let polled = pipeline.poll(&record.promotion_id).unwrap();
    assert_eq!(polled.status, PromotionStatus::Pending);
    assert_eq!(pipeline.production().unwrap().current, None);

    pipeline
        .acknowledge(&record.promotion_id, AckStatus::Acknowledged, None)
        .unwrap();
    let polled = pipeline.poll(&record.promotion_id).unwrap();
    assert_eq!(polled.status, PromotionStatus::Acknowledged);
    assert_eq!(
        pipeline.production().unwrap().current,
        Some(record.promotion_id.clone())
    );
    let path: Vec<_> = polled.transitions.iter().map(|t| t.to).collect();
    assert_eq!(
        path,
        vec![PromotionStatus::Applied, PromotionStatus::Acknowledged]
    );
}

#[tokio::test]
async fn missing_acknowledgement_rolls_back_at_deadline() {
    let rig = Rig::new(None);
    let champion = rig.champion(100).await;
    let pipeline = rig.pipeline(600);
    let record = pipeline.promote(&champion).unwrap();

    rig.clock.advance(Duration::seconds(599));
    assert_eq!(
        pipeline.poll(&record.promotion_id).unwrap().status,
        PromotionStatus::Pending
    );

    rig.clock.advance(Duration::seconds(1));
    let polled = pipeline.poll(&record.promotion_id).unwrap();
    assert_eq!(polled.status, PromotionStatus::RolledBack);
    let marker = pipeline.rollback_marker(&record.promotion_id).unwrap().unwrap();
    assert_eq!(marker.reason, RollbackReason::AckTimeout);
    assert_eq!(pipeline.production().unwrap().current, None);

    // A late acknowledgement cannot revive it.
    pipeline
        .acknowledge(&record.promotion_id, AckStatus::Acknowledged, None)
        .unwrap();
    assert_eq!(
        pipeline.poll(&record.promotion_id).unwrap().status,
        PromotionStatus::RolledBack
    );
}

#[tokio::test]
async fn failed_apply_rolls_back_immediately() {
    let rig = Rig::new(None);
    let champion = rig.champion(100).await;
    let pipeline = rig.pipeline(3600);
    let record = pipeline.promote(&champion).unwrap();

    pipeline
        .acknowledge(
            &record.promotion_id,
            AckStatus::Failed,
            Some("config rejected".into()),
        )
        .unwrap();
    let polled = pipeline.poll(&record.promotion_id).unwrap();
    assert_eq!(polled.status, PromotionStatus::RolledBack);
    let marker = pipeline.rollback_marker(&record.promotion_id).unwrap().unwrap();
    assert_eq!(marker.reason, RollbackReason::ApplyFailed);
    assert!(marker.detail.contains("config rejected"));
}

#[tokio::test]
async fn drift_after_ack_restores_previous_production() {
    let rig = Rig::new(None);
    let pipeline = rig.pipeline(3600);

    let first = pipeline.promote(&rig.champion(100).await).unwrap();
    pipeline
        .acknowledge(&first.promotion_id, AckStatus::Acknowledged, None)
        .unwrap();
    pipeline.poll(&first.promotion_id).unwrap();

    rig.clock.advance(Duration::minutes(1));
    let second = pipeline.promote(&rig.champion(99).await).unwrap();
    pipeline
        .acknowledge(&second.promotion_id, AckStatus::Acknowledged, None)
        .unwrap();
    pipeline.poll_all().unwrap();
    let pointer = pipeline.production().unwrap();
    assert_eq!(pointer.current, Some(second.promotion_id.clone()));
    assert_eq!(pointer.previous, Some(first.promotion_id.clone()));

    let drifted = pipeline
        .report_drift(&second.promotion_id, "p99 latency up 40%")
        .unwrap();
    assert_eq!(drifted.status, PromotionStatus::RolledBack);
    assert_eq!(
        pipeline.production().unwrap().current,
        Some(first.promotion_id.clone())
    );
    let marker = pipeline.rollback_marker(&second.promotion_id).unwrap().unwrap();
    assert_eq!(marker.reason, RollbackReason::Drift);
}

#[tokio::test(start_paused = true)]
async fn await_acknowledgement_returns_once_settled() {
    let rig = Rig::new(None);
    let champion = rig.champion(100).await;
    let pipeline = Arc::new(rig.pipeline(3600));
    let record = pipeline.promote(&champion).unwrap();

    let waiter = {
        let pipeline = Arc::clone(&pipeline);
        let id = record.promotion_id.clone();
        tokio::spawn(async move { pipeline.await_acknowledgement(&id).await })
    };
    tokio::time::sleep(std::time::Duration::from_secs(3)).await;
    pipeline
        .acknowledge(&record.promotion_id, AckStatus::Acknowledged, None)
        .unwrap();

    let settled = waiter.await.unwrap().unwrap();
    assert_eq!(settled.status, PromotionStatus::Acknowledged);
    assert!(rig.clock.now() < settled.ack_deadline);
}
