//! Scheduler cycle: generate, spawn, tournament, validate, promote.
//!
//! [`CycleRunner`] wires the components for one cycle under the shared
//! `cycle` lease. [`Autopilot`] couples it with the escalation controller
//! for a single tick.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::{info, warn, Instrument};

use crucible_state::atomic::{read_json_opt, write_json_atomic};
use crucible_state::{FsLeaseStore, FsSymptomQueue, LeaseStore, SymptomQueue};

use crate::audit::AuditLog;
use crate::baseline::MetricBaseline;
use crate::clock::{Clock, SystemClock};
use crate::config::CrucibleConfig;
use crate::domain::error::{CrucibleError, Result};
use crate::domain::escalation::TickDecision;
use crate::domain::instance::{Instance, InstanceId};
use crate::domain::promotion::PromotionRecord;
use crate::domain::tournament::TournamentResult;
use crate::domain::validation::{ValidationOutcome, ValidationRun};
use crate::escalation::{EscalationController, IngestReport};
use crate::evaluator::{FitnessEvaluator, Workload};
use crate::generator::{CandidateGenerator, Rejection};
use crate::layout::Layout;
use crate::lease::{self, HeldLease, CYCLE_LEASE};
use crate::lineage::LineageSigner;
use crate::metrics::METRICS;
use crate::obs;
use crate::promotion::PromotionPipeline;
use crate::retention::{DiskProbe, RetentionManager, RetentionPolicy, StatvfsProbe};
use crate::spawner::InstanceStore;
use crate::tournament::TournamentOrchestrator;
use crate::validator::SequentialValidator;
use crate::winners::{WinnerRecord, WinnersLedger};

#[derive(Debug, Clone, Default)]
pub struct CycleOptions {
    /// Bypass the maintenance window for validation.
    pub force: bool,
    /// Stop after the tournament.
    pub dry_run: bool,
    /// Worker-pool size override.
    pub workers: Option<usize>,
    /// Legacy fully-sequential bracket.
    pub sequential: bool,
    /// Armed symptoms this cycle was started for.
    pub symptoms: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleOutcome {
    Promoted,
    ValidationFailed,
    Suspended,
    DryRun,
    NoEntrants,
}

impl CycleOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            CycleOutcome::Promoted => "promoted",
            CycleOutcome::ValidationFailed => "validation_failed",
            CycleOutcome::Suspended => "suspended",
            CycleOutcome::DryRun => "dry_run",
            CycleOutcome::NoEntrants => "no_entrants",
        }
    }
}

/// An instance left out of the tournament, and why.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Exclusion {
    pub instance_id: InstanceId,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub cycle_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub generated: usize,
    pub rejected: Vec<Rejection>,
    pub excluded: Vec<Exclusion>,
    pub pruned: Vec<InstanceId>,
    /// Champion whose suspended validation this cycle resumed.
    pub resumed: Option<InstanceId>,
    pub tournament: Option<TournamentResult>,
    pub validation: Option<ValidationRun>,
    pub promotion: Option<PromotionRecord>,
    pub outcome: CycleOutcome,
}

/// Champion waiting for validation to resume (`validation/pending.json`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingValidation {
    pub instance_id: InstanceId,
    pub tournament_fitness: Option<f64>,
    pub cycle_id: String,
    pub recorded_at: DateTime<Utc>,
}

pub struct CycleRunner {
    config: CrucibleConfig,
    layout: Layout,
    workload: Arc<dyn Workload>,
    clock: Arc<dyn Clock>,
    leases: Arc<dyn LeaseStore>,
    disk: Arc<dyn DiskProbe>,
    holder: String,
}

impl CycleRunner {
    pub fn new(config: CrucibleConfig, workload: Arc<dyn Workload>) -> Self {
        let layout = Layout::new(config.root.clone());
        let leases: Arc<dyn LeaseStore> = Arc::new(FsLeaseStore::new(layout.leases()));
        Self {
            config,
            layout,
            workload,
            clock: Arc::new(SystemClock),
            leases,
            disk: Arc::new(StatvfsProbe),
            holder: lease::holder_id(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_leases(mut self, leases: Arc<dyn LeaseStore>) -> Self {
        self.leases = leases;
        self
    }

    pub fn with_disk_probe(mut self, disk: Arc<dyn DiskProbe>) -> Self {
        self.disk = disk;
        self
    }

    pub fn config(&self) -> &CrucibleConfig {
        &self.config
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock)
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    pub fn leases(&self) -> &dyn LeaseStore {
        self.leases.as_ref()
    }

    /// Lineage signer from `lineage.key_hex`, or the root's key file.
    pub fn signer(&self) -> Result<LineageSigner> {
        match &self.config.lineage.key_hex {
            Some(hex) => LineageSigner::from_hex(hex),
            None => LineageSigner::load_or_create(&self.layout.lineage_key()),
        }
    }

    pub fn instance_store(&self) -> Result<InstanceStore> {
        Ok(InstanceStore::new(self.layout.instances(), self.signer()?))
    }

    pub fn promotions(&self) -> PromotionPipeline {
        PromotionPipeline::new(self.layout.promotions(), &self.config.promotion, self.clock())
            .with_audit(Arc::new(AuditLog::new(self.layout.audit_log())))
    }

    pub fn symptom_queue(&self) -> FsSymptomQueue {
        FsSymptomQueue::new(self.layout.symptoms())
    }

    pub fn escalation(&self) -> Result<EscalationController> {
        Ok(EscalationController::open(
            self.config.escalation.clone(),
            self.config.maintenance.window()?,
            self.layout.escalation_state(),
        )?
        .with_audit(Arc::new(AuditLog::new(self.layout.audit_log()))))
    }

    pub fn pending_validation(&self) -> Result<Option<PendingValidation>> {
        Ok(read_json_opt(&self.layout.pending_validation())?)
    }

    /// Prune the instance tree as if a spawn were about to happen.
    pub fn prune(&self) -> Result<crate::retention::RetentionReport> {
        let store = self.instance_store()?;
        let protected = self.protected_instances()?;
        RetentionManager::new(RetentionPolicy::from(&self.config.retention), self.disk.as_ref())
            .ensure_capacity(&store, &protected, self.clock.now())
    }

    /// Run one cycle under the `cycle` lease.
    pub async fn run_cycle(&self, options: CycleOptions) -> Result<CycleReport> {
        let nonce = uuid::Uuid::new_v4().simple().to_string();
        let cycle_id = format!("cycle-{}", &nonce[..12]);
        let span = obs::cycle_span(&cycle_id);
        self.run_cycle_as(&cycle_id, options).instrument(span).await
    }

    async fn run_cycle_as(&self, cycle_id: &str, options: CycleOptions) -> Result<CycleReport> {
        let started = tokio::time::Instant::now();
        let held = HeldLease::acquire(
            Arc::clone(&self.leases),
            self.clock(),
            CYCLE_LEASE,
            &self.holder,
            Duration::seconds(self.config.locks.cycle_ttl_secs),
        )?;
        METRICS.inc_cycles();
        obs::emit_cycle_started(cycle_id, options.force, options.dry_run);
        let result = self.run_locked(cycle_id, &held, &options).await;
        held.release();

        let duration_ms = started.elapsed().as_millis() as u64;
        match &result {
            Ok(report) => obs::emit_cycle_finished(cycle_id, report.outcome.as_str(), duration_ms),
            Err(e) => {
                obs::emit_cycle_error(cycle_id, e);
                obs::emit_cycle_finished(cycle_id, "error", duration_ms);
            }
        }
        METRICS.flush();
        result
    }

    /// The champion currently in production, the pending validation, and
    /// nothing else, are protected from retention outside a cycle.
    fn protected_instances(&self) -> Result<HashSet<InstanceId>> {
        let mut protected = HashSet::new();
        let promotions = self.promotions();
        if let Some(current) = promotions.production()?.current {
            match promotions.load(&current) {
                Ok(record) => {
                    protected.insert(record.instance_id);
                }
                Err(e) => warn!(promotion_id = %current, error = %e, "production record unreadable"),
            }
        }
        if let Some(pending) = self.pending_validation()? {
            protected.insert(pending.instance_id);
        }
        Ok(protected)
    }

    async fn run_locked(
        &self,
        cycle_id: &str,
        held: &HeldLease,
        options: &CycleOptions,
    ) -> Result<CycleReport> {
        let cfg = &self.config;
        let started_at = self.clock.now();
        let audit = Arc::new(AuditLog::new(self.layout.audit_log()));
        let store = self.instance_store()?;
        let evaluator = Arc::new(
            FitnessEvaluator::new(Arc::clone(&self.workload), &cfg.evaluator)
                .with_audit(Arc::clone(&audit), cycle_id),
        );

        let mut report = CycleReport {
            cycle_id: cycle_id.to_string(),
            started_at,
            finished_at: started_at,
            generated: 0,
            rejected: Vec::new(),
            excluded: Vec::new(),
            pruned: Vec::new(),
            resumed: None,
            tournament: None,
            validation: None,
            promotion: None,
            outcome: CycleOutcome::NoEntrants,
        };

        if !options.dry_run {
            if let Some(pending) = self.pending_validation()? {
                match store.verify(&pending.instance_id) {
                    Ok(instance) => {
                        info!(instance_id = %instance.id, from_cycle = %pending.cycle_id, "resuming suspended validation");
                        report.resumed = Some(instance.id.clone());
                        self.validate_and_promote(
                            cycle_id,
                            held,
                            &store,
                            &evaluator,
                            &audit,
                            &instance,
                            pending.tournament_fitness,
                            options,
                            &mut report,
                        )
                        .await?;
                        report.finished_at = self.clock.now();
                        return Ok(report);
                    }
                    Err(e) => {
                        warn!(instance_id = %pending.instance_id, error = %e, "dropping pending validation");
                        self.clear_pending()?;
                    }
                }
            }
        }

        // Generate.
        let winners = WinnersLedger::new(self.layout.winners_log()).all()?;
        let mut rng = match cfg.generator.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let generation = CandidateGenerator::new(&cfg.search_space).generate(
            &cfg.generator.seeds,
            &winners,
            cfg.generator.policy,
            cfg.generator.population,
            &mut rng,
            self.clock.now(),
        );
        report.generated = generation.candidates.len();
        report.rejected = generation.rejected;

        // Prune and spawn.
        let retention =
            RetentionManager::new(RetentionPolicy::from(&cfg.retention), self.disk.as_ref());
        let mut protected = self.protected_instances()?;
        let mut spawned: Vec<Instance> = Vec::new();
        for candidate in &generation.candidates {
            let now = self.clock.now();
            match retention.ensure_capacity(&store, &protected, now) {
                Ok(pruned) => report.pruned.extend(pruned.pruned),
                Err(e @ CrucibleError::RetentionExhausted(_)) => {
                    warn!(error = %e, spawned = spawned.len(), "no room for more instances");
                    break;
                }
                Err(e) => return Err(e),
            }
            let instance = store.spawn(candidate, now)?;
            protected.insert(instance.id.clone());
            spawned.push(instance);
        }

        held.renew()?;

        // Verify; corrupted instances sit out.
        let mut entrants = Vec::with_capacity(spawned.len());
        for instance in spawned {
            match store.verify(&instance.id) {
                Ok(verified) => entrants.push(verified),
                Err(e) => {
                    warn!(instance_id = %instance.id, error = %e, "excluding instance");
                    report.excluded.push(Exclusion {
                        instance_id: instance.id,
                        reason: e.to_string(),
                    });
                }
            }
        }
        if entrants.is_empty() {
            warn!("no verified entrants; cycle ends without a tournament");
            report.finished_at = self.clock.now();
            return Ok(report);
        }

        // Tournament.
        let workers = options.workers.unwrap_or(cfg.tournament.concurrency);
        let parallel = cfg.tournament.parallel && !options.sequential;
        let orchestrator = TournamentOrchestrator::new(Arc::clone(&evaluator), workers, parallel)
            .with_audit(Arc::clone(&audit), cycle_id)
            .with_lease(held.clone());
        let result = orchestrator.run(entrants.clone()).await?;
        let champion = entrants
            .iter()
            .find(|i| i.id == result.champion)
            .cloned()
            .ok_or_else(|| CrucibleError::Internal(format!("champion {} not an entrant", result.champion)))?;
        let tournament_fitness = result.champion_fitness();
        info!(
            champion = %champion.id,
            rounds = result.rounds.len(),
            matches = result.match_count,
            "tournament finished"
        );
        report.tournament = Some(result);

        if options.dry_run {
            report.outcome = CycleOutcome::DryRun;
            report.finished_at = self.clock.now();
            return Ok(report);
        }

        self.validate_and_promote(
            cycle_id,
            held,
            &store,
            &evaluator,
            &audit,
            &champion,
            tournament_fitness,
            options,
            &mut report,
        )
        .await?;
        report.finished_at = self.clock.now();
        Ok(report)
    }

    fn clear_pending(&self) -> Result<()> {
        match std::fs::remove_file(self.layout.pending_validation()) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn validate_and_promote(
        &self,
        cycle_id: &str,
        held: &HeldLease,
        store: &InstanceStore,
        evaluator: &Arc<FitnessEvaluator>,
        audit: &Arc<AuditLog>,
        champion: &Instance,
        tournament_fitness: Option<f64>,
        options: &CycleOptions,
        report: &mut CycleReport,
    ) -> Result<()> {
        let cfg = &self.config;
        let validator = SequentialValidator::new(
            Arc::clone(evaluator),
            cfg.validator.clone(),
            cfg.maintenance.window()?,
            self.clock(),
            Arc::clone(&self.leases),
            &self.holder,
            Duration::seconds(cfg.locks.validator_ttl_secs),
            self.layout.validation(),
            MetricBaseline::new(self.layout.baseline_log()),
        )
        .with_audit(Arc::clone(audit), cycle_id)
        .with_cycle_lease(held.clone());

        match validator
            .validate(champion, tournament_fitness, options.force)
            .await?
        {
            ValidationOutcome::Suspended { .. } => {
                write_json_atomic(
                    &self.layout.pending_validation(),
                    &PendingValidation {
                        instance_id: champion.id.clone(),
                        tournament_fitness,
                        cycle_id: cycle_id.to_string(),
                        recorded_at: self.clock.now(),
                    },
                )?;
                report.outcome = CycleOutcome::Suspended;
            }
            ValidationOutcome::Completed {
                run,
                champion: None,
            } => {
                self.clear_pending()?;
                let failure = CrucibleError::ValidationFailure {
                    instance_id: champion.id.to_string(),
                    verdict: run.verdict.to_string(),
                };
                warn!(error = %failure, "champion not promoted");
                report.validation = Some(run);
                report.outcome = CycleOutcome::ValidationFailed;
            }
            ValidationOutcome::Completed {
                run,
                champion: Some(validated),
            } => {
                self.clear_pending()?;
                report.validation = Some(run);

                held.renew()?;

                // The instance must still be exactly what was validated.
                let on_disk = store.verify(validated.instance_id())?;
                if on_disk.manifest.digest()? != validated.manifest_digest() {
                    return Err(CrucibleError::NotValidated(validated.instance_id().to_string()));
                }

                let record = PromotionPipeline::new(
                    self.layout.promotions(),
                    &cfg.promotion,
                    self.clock(),
                )
                .with_audit(Arc::clone(audit))
                .promote(&validated)?;

                WinnersLedger::new(self.layout.winners_log()).append(&WinnerRecord::new(
                    validated.candidate().clone(),
                    validated.fitness(),
                    cycle_id,
                    self.clock.now(),
                ))?;
                report.promotion = Some(record);
                report.outcome = CycleOutcome::Promoted;
            }
        }
        Ok(())
    }
}

/// What the controller needs to know once a cycle ends.
#[derive(Debug, Clone)]
pub struct CycleFeedback {
    pub started: DateTime<Utc>,
    pub finished: DateTime<Utc>,
    pub improved: bool,
    /// The cycle never ran: another process held the cycle lease.
    pub lease_held: bool,
    pub symptoms: Vec<String>,
}

impl CycleFeedback {
    /// Improvement means validation passed and a promotion was written.
    pub fn from_result(
        started: DateTime<Utc>,
        finished: DateTime<Utc>,
        symptoms: Vec<String>,
        result: &Result<CycleReport>,
    ) -> Self {
        let improved = matches!(result, Ok(r) if r.outcome == CycleOutcome::Promoted);
        let lease_held = matches!(result, Err(CrucibleError::LeaseHeld { .. }));
        Self {
            started,
            finished,
            improved,
            lease_held,
            symptoms,
        }
    }

    /// Settle the start with the controller. A cycle refused for a held
    /// lease is refunded rather than charged, and clears nothing.
    pub fn apply(&self, controller: &mut EscalationController) -> Result<Vec<String>> {
        if self.lease_held {
            controller.refund_cycle_start(self.started)?;
            return Ok(Vec::new());
        }
        controller.record_cycle_finished(self.started, self.finished, self.improved, &self.symptoms)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TickReport {
    pub ingest: IngestReport,
    pub decision: TickDecision,
    pub cycle: Option<CycleReport>,
    pub cycle_error: Option<String>,
    pub cleared: Vec<String>,
}

/// Controller and runner for one autonomous tick.
pub struct Autopilot {
    runner: Arc<CycleRunner>,
    controller: EscalationController,
    queue: Arc<dyn SymptomQueue>,
}

impl Autopilot {
    pub fn new(
        runner: Arc<CycleRunner>,
        controller: EscalationController,
        queue: Arc<dyn SymptomQueue>,
    ) -> Self {
        Self {
            runner,
            controller,
            queue,
        }
    }

    pub fn controller(&self) -> &EscalationController {
        &self.controller
    }

    /// Ingest symptoms, tick, and run a cycle if every gate allows it.
    /// Cycle errors are reported, not returned: the next tick still runs.
    pub async fn tick_once(&mut self, force: bool, dry_run: bool) -> Result<TickReport> {
        let clock = self.runner.clock();
        let limit = self.runner.config().escalation.symptoms_per_tick;
        let ingest = self.controller.ingest(self.queue.as_ref(), limit)?;
        let decision = self.controller.tick(clock.now(), force)?;

        let mut report = TickReport {
            ingest,
            decision: decision.clone(),
            cycle: None,
            cycle_error: None,
            cleared: Vec::new(),
        };
        if let TickDecision::RunCycle { symptoms } = decision {
            let started = clock.now();
            self.controller.record_cycle_started(started)?;
            let result = self
                .runner
                .run_cycle(CycleOptions {
                    force,
                    dry_run,
                    symptoms: symptoms.clone(),
                    ..CycleOptions::default()
                })
                .await;
            let feedback = CycleFeedback::from_result(started, clock.now(), symptoms, &result);
            report.cleared = feedback.apply(&mut self.controller)?;
            match result {
                Ok(cycle) => report.cycle = Some(cycle),
                Err(e) => report.cycle_error = Some(e.to_string()),
            }
        }
        Ok(report)
    }
}
