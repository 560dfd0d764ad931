//! Sequential Validator.
//!
//! Runs only the tournament champion, one epoch × slice × replica unit at a
//! time system-wide. Units are serialised by a process-local async mutex
//! and by the shared `validator` lease so that concurrent processes never
//! measure at the same time. Progress is checkpointed after every unit;
//! when the maintenance window closes the run suspends and a later call
//! resumes where it stopped.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use std::time::Duration as StdDuration;

use chrono::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crucible_state::atomic::{read_json_opt, write_json_atomic};
use crucible_state::LeaseStore;

use crate::audit::{AuditEntry, AuditLog};
use crate::baseline::MetricBaseline;
use crate::clock::Clock;
use crate::config::ValidatorConfig;
use crate::domain::error::{CrucibleError, Result};
use crate::domain::evaluation::{EvalContext, EvaluationStatus};
use crate::domain::instance::{Instance, InstanceId};
use crate::domain::validation::{
    Regression, UnitOutcome, ValidatedChampion, ValidationCheckpoint, ValidationOutcome,
    ValidationRun, ValidationUnit, Verdict,
};
use crate::evaluator::FitnessEvaluator;
use crate::lease::{self, HeldLease, VALIDATOR_LEASE};
use crate::obs;
use crate::window::MaintenanceWindow;

pub const METRIC_FAILURE_RATE: &str = "failure_rate";
pub const METRIC_MEAN_LATENCY: &str = "mean_latency_ms";

const CHECKPOINT_FILE: &str = "checkpoint.json";

fn unit_slot() -> &'static Mutex<()> {
    static SLOT: OnceLock<Mutex<()>> = OnceLock::new();
    SLOT.get_or_init(|| Mutex::new(()))
}

pub struct SequentialValidator {
    evaluator: Arc<FitnessEvaluator>,
    config: ValidatorConfig,
    window: MaintenanceWindow,
    clock: Arc<dyn Clock>,
    leases: Arc<dyn LeaseStore>,
    holder: String,
    lease_ttl: Duration,
    dir: PathBuf,
    baseline: MetricBaseline,
    audit: Option<(Arc<AuditLog>, String)>,
    cycle_lease: Option<HeldLease>,
}

impl SequentialValidator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        evaluator: Arc<FitnessEvaluator>,
        config: ValidatorConfig,
        window: MaintenanceWindow,
        clock: Arc<dyn Clock>,
        leases: Arc<dyn LeaseStore>,
        holder: &str,
        lease_ttl: Duration,
        dir: impl Into<PathBuf>,
        baseline: MetricBaseline,
    ) -> Self {
        Self {
            evaluator,
            config,
            window,
            clock,
            leases,
            holder: holder.to_string(),
            lease_ttl,
            dir: dir.into(),
            baseline,
            audit: None,
            cycle_lease: None,
        }
    }

    pub fn with_audit(mut self, audit: Arc<AuditLog>, cycle_id: &str) -> Self {
        self.audit = Some((audit, cycle_id.to_string()));
        self
    }

    /// The enclosing cycle's lease, renewed before every unit and while
    /// waiting for the validator lease.
    pub fn with_cycle_lease(mut self, lease: HeldLease) -> Self {
        self.cycle_lease = Some(lease);
        self
    }

    fn renew_cycle_lease(&self) -> Result<()> {
        if let Some(lease) = &self.cycle_lease {
            lease.renew()?;
        }
        Ok(())
    }

    fn checkpoint_path(&self, id: &InstanceId) -> PathBuf {
        self.dir.join(id.as_str()).join(CHECKPOINT_FILE)
    }

    /// Stored progress for `id`, if any.
    pub fn checkpoint(&self, id: &InstanceId) -> Result<Option<ValidationCheckpoint>> {
        Ok(read_json_opt(&self.checkpoint_path(id))?)
    }

    fn save_checkpoint(&self, cp: &ValidationCheckpoint) -> Result<()> {
        Ok(write_json_atomic(&self.checkpoint_path(&cp.instance_id), cp)?)
    }

    fn clear_checkpoint(&self, id: &InstanceId) -> Result<()> {
        match std::fs::remove_dir_all(self.dir.join(id.as_str())) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn open(&self, force: bool) -> bool {
        force || self.window.contains(self.clock.now())
    }

    fn suspend(&self, cp: &mut ValidationCheckpoint, total: usize) -> Result<ValidationOutcome> {
        cp.updated_at = self.clock.now();
        self.save_checkpoint(cp)?;
        obs::emit_validation_suspended(cp.instance_id.as_str(), cp.completed.len(), total);
        Ok(ValidationOutcome::Suspended {
            instance_id: cp.instance_id.clone(),
            completed: cp.completed.len(),
            total,
        })
    }

    /// Take the validator lease, waiting for other processes. Returns
    /// `false` if the window closed while waiting.
    async fn take_lease(&self, force: bool) -> Result<bool> {
        let poll = StdDuration::from_secs(self.config.lease_poll_secs.max(1));
        loop {
            if !self.open(force) {
                return Ok(false);
            }
            self.renew_cycle_lease()?;
            match lease::acquire(
                self.leases.as_ref(),
                VALIDATOR_LEASE,
                &self.holder,
                self.lease_ttl,
                self.clock.now(),
            ) {
                Ok(_) => return Ok(true),
                Err(CrucibleError::LeaseHeld { holder, .. }) => {
                    debug!(%holder, "validator lease busy; waiting");
                    tokio::time::sleep(poll).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Validate `instance`, resuming from a checkpoint when one exists.
    ///
    /// `tournament_fitness` becomes the promoted fitness; without one the
    /// validated pass rate is used. `force` ignores the maintenance window.
    pub async fn validate(
        &self,
        instance: &Instance,
        tournament_fitness: Option<f64>,
        force: bool,
    ) -> Result<ValidationOutcome> {
        let cfg = &self.config;
        let plan = ValidationUnit::plan(cfg.epochs, cfg.slices, cfg.replicas);
        let total = plan.len();

        let now = self.clock.now();
        let mut cp = match self.checkpoint(&instance.id)? {
            Some(cp)
                if cp.epochs == cfg.epochs
                    && cp.slices == cfg.slices
                    && cp.replicas == cfg.replicas =>
            {
                info!(
                    instance_id = %instance.id,
                    completed = cp.completed.len(),
                    total,
                    "resuming validation"
                );
                cp
            }
            _ => ValidationCheckpoint {
                instance_id: instance.id.clone(),
                epochs: cfg.epochs,
                slices: cfg.slices,
                replicas: cfg.replicas,
                completed: Vec::new(),
                started_at: now,
                updated_at: now,
            },
        };
        let done: HashSet<ValidationUnit> = cp.completed.iter().map(|o| o.unit).collect();
        let unit_timeout = StdDuration::from_secs(cfg.unit_timeout_secs);

        for unit in plan.into_iter().filter(|u| !done.contains(u)) {
            if !self.open(force) {
                return self.suspend(&mut cp, total);
            }

            let _slot = unit_slot().lock().await;
            if !self.take_lease(force).await? {
                return self.suspend(&mut cp, total);
            }

            let ctx = EvalContext::Validation {
                epoch: unit.epoch,
                slice: unit.slice,
                replica: unit.replica,
                soak_span_secs: cfg.soak_span_secs(),
            };
            let result = self
                .evaluator
                .evaluate_within(instance, &ctx, unit_timeout)
                .await;
            lease::release(self.leases.as_ref(), VALIDATOR_LEASE, &self.holder);

            let outcome = UnitOutcome {
                unit,
                passed: result.passed,
                failed: result.failed,
                status: result.status,
                duration_ms: result.duration_ms,
                mean_latency_ms: result.mean_latency_ms,
                finished_at: self.clock.now(),
            };
            obs::emit_validation_unit_finished(
                instance.id.as_str(),
                &unit.to_string(),
                outcome.status.as_str(),
                outcome.passed,
                outcome.failed,
            );
            if let Some((audit, cycle_id)) = &self.audit {
                audit.record(
                    Some(cycle_id),
                    outcome.finished_at,
                    AuditEntry::ValidationUnit {
                        instance_id: instance.id.clone(),
                        outcome: outcome.clone(),
                    },
                );
            }
            cp.completed.push(outcome);
            cp.updated_at = self.clock.now();
            self.save_checkpoint(&cp)?;
        }

        let run = self.conclude(cp)?;
        self.clear_checkpoint(&instance.id)?;

        let champion = if run.verdict == Verdict::Pass {
            let at = run.finished_at;
            self.baseline
                .record(METRIC_FAILURE_RATE, run.failure_rate, at)?;
            if let Some(latency) = run.mean_latency_ms {
                self.baseline.record(METRIC_MEAN_LATENCY, latency, at)?;
            }
            let fitness = tournament_fitness.unwrap_or(1.0 - run.failure_rate);
            Some(ValidatedChampion::new(
                instance.id.clone(),
                instance.candidate.clone(),
                instance.manifest.digest()?,
                fitness,
                run.clone(),
            ))
        } else {
            None
        };
        info!(
            instance_id = %instance.id,
            verdict = %run.verdict,
            failure_rate = run.failure_rate,
            failed_units = run.failed_units,
            "validation finished"
        );
        Ok(ValidationOutcome::Completed { run, champion })
    }

    fn conclude(&self, cp: ValidationCheckpoint) -> Result<ValidationRun> {
        let cfg = &self.config;
        let now = self.clock.now();
        let mut units = cp.completed;
        units.sort_by_key(|o| o.unit);

        let passed: u64 = units.iter().map(|o| o.passed).sum();
        let failed: u64 = units.iter().map(|o| o.failed).sum();
        let failed_units = units
            .iter()
            .filter(|o| o.status != EvaluationStatus::Ok)
            .count() as u32;
        let tests = passed + failed;
        let failure_rate = if tests == 0 {
            0.0
        } else {
            failed as f64 / tests as f64
        };
        let latencies: Vec<f64> = units.iter().filter_map(|o| o.mean_latency_ms).collect();
        let mean_latency_ms =
            (!latencies.is_empty()).then(|| latencies.iter().sum::<f64>() / latencies.len() as f64);

        let mut regressions = Vec::new();
        if tests > 0 {
            let span = Duration::days(i64::from(cfg.baseline_days));
            if let Some(base) = self
                .baseline
                .rolling_mean(METRIC_FAILURE_RATE, now, span)?
            {
                let delta = failure_rate - base;
                if delta > cfg.max_regression {
                    regressions.push(Regression {
                        metric: METRIC_FAILURE_RATE.to_string(),
                        baseline: base,
                        observed: failure_rate,
                        delta,
                    });
                }
            }
            if let (Some(observed), Some(base)) = (
                mean_latency_ms,
                self.baseline.rolling_mean(METRIC_MEAN_LATENCY, now, span)?,
            ) {
                if base > 0.0 {
                    let delta = (observed - base) / base;
                    if delta > cfg.max_regression {
                        regressions.push(Regression {
                            metric: METRIC_MEAN_LATENCY.to_string(),
                            baseline: base,
                            observed,
                            delta,
                        });
                    }
                }
            }
        }

        let verdict = if tests == 0 {
            Verdict::Inconclusive
        } else if failed_units > cfg.max_failed_units
            || failure_rate > cfg.max_failure_rate
            || !regressions.is_empty()
        {
            Verdict::Fail
        } else {
            Verdict::Pass
        };

        Ok(ValidationRun {
            instance_id: cp.instance_id,
            epochs: cp.epochs,
            slices: cp.slices,
            replicas: cp.replicas,
            units,
            passed,
            failed,
            failed_units,
            failure_rate,
            mean_latency_ms,
            regressions,
            verdict,
            started_at: cp.started_at,
            finished_at: now,
        })
    }
}
