//! Crucible CLI
//!
//! The `crucible` command drives the scheduler by hand and inspects its
//! on-disk state.
//!
//! ## Commands
//!
//! - `cycle`: Run one or more generate/tournament/validate/promote cycles
//! - `tick`: One autopilot tick (ingest symptoms, maybe run a cycle)
//! - `symptom`: Record or list symptom observations
//! - `promotion`: Inspect, acknowledge, drift-report or watch promotions
//! - `instances`: List, verify or prune spawned instances
//! - `lease`: Show who holds a lease
//! - `config`: Validate the configuration

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{info, Level};

use crucible_core::config::DEFAULT_CONFIG_FILE;
use crucible_core::{
    AckStatus, Autopilot, CrucibleConfig, CycleOptions, CycleReport, CycleRunner, EvalContext,
    Instance, InstanceId, PromotionId, PromotionRecord, PromotionStatus, TickDecision, TickReport,
    Workload, WorkloadFailure, WorkloadReport,
};
use crucible_state::{SymptomQueue, SymptomRecord};
use crucible_workload::CommandWorkload;

#[derive(Parser)]
#[command(name = "crucible")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Evolutionary tournament scheduler with validated promotion", long_about = None)]
struct Cli {
    /// Configuration file (default: ./crucible.toml, built-in defaults if absent)
    #[arg(short, long, global = true, env = "CRUCIBLE_CONFIG")]
    config: Option<PathBuf>,

    /// Override the state root directory
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    /// Print machine-readable JSON and emit JSON log lines
    #[arg(long, global = true)]
    json: bool,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run scheduler cycles now
    Cycle {
        /// Number of cycles to run back to back
        #[arg(long, default_value = "1")]
        cycles: u32,

        /// Evaluation worker-pool size
        #[arg(long)]
        workers: Option<usize>,

        /// Validate even outside the maintenance window
        #[arg(long)]
        force: bool,

        /// Stop after the tournament
        #[arg(long)]
        dry_run: bool,

        /// Run the bracket one match at a time
        #[arg(long)]
        sequential: bool,
    },

    /// Run one autopilot tick
    Tick {
        /// Bypass window, budget and cooldown gates
        #[arg(long)]
        force: bool,

        /// Stop any triggered cycle after the tournament
        #[arg(long)]
        dry_run: bool,
    },

    /// Symptom feed
    Symptom {
        #[command(subcommand)]
        action: SymptomAction,
    },

    /// Promotion records
    Promotion {
        #[command(subcommand)]
        action: PromotionAction,
    },

    /// Spawned instances
    Instances {
        #[command(subcommand)]
        action: InstancesAction,
    },

    /// Leases
    Lease {
        #[command(subcommand)]
        action: LeaseAction,
    },

    /// Configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum SymptomAction {
    /// Publish one observation
    Record {
        name: String,

        /// Producer-defined severity; larger is worse
        #[arg(long, default_value = "1.0")]
        severity: f64,
    },

    /// List unprocessed observations
    Pending {
        #[arg(short, long, default_value = "50")]
        limit: usize,
    },

    /// Show escalation flags
    Flags,
}

#[derive(Subcommand)]
enum PromotionAction {
    /// List promotions, oldest first
    List {
        /// Filter by status (pending, applied, acknowledged, rolled_back)
        #[arg(long)]
        status: Option<PromotionStatus>,
    },

    /// Show one promotion with its acknowledgement and rollback marker
    Show { id: String },

    /// Write an acknowledgement on behalf of the apply step
    Ack {
        id: String,

        /// applied, acknowledged or failed
        #[arg(long, default_value = "acknowledged")]
        status: AckStatus,

        #[arg(long)]
        note: Option<String>,
    },

    /// Report a post-apply regression and roll back
    Drift {
        id: String,

        #[arg(long)]
        reason: String,
    },

    /// Poll until the promotion is acknowledged or rolled back
    Watch { id: String },

    /// Advance every unsettled promotion once
    Poll,
}

#[derive(Subcommand)]
enum InstancesAction {
    /// List instances, oldest first
    List,

    /// Verify lineage tags and manifests (all instances if no id)
    Verify { id: Option<String> },

    /// Apply the retention policy now
    Prune,
}

#[derive(Subcommand)]
enum LeaseAction {
    /// Show the current holder of a lease
    Show { resource: String },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Load and validate the configuration and workload
    Check,
}

/// Stand-in for commands that never evaluate anything.
struct UnconfiguredWorkload;

#[async_trait]
impl Workload for UnconfiguredWorkload {
    async fn run(
        &self,
        _instance: &Instance,
        _context: &EvalContext,
    ) -> std::result::Result<WorkloadReport, WorkloadFailure> {
        Err(WorkloadFailure::Invalid(
            "no [workload] section configured".to_string(),
        ))
    }
}

struct Ctx {
    config: CrucibleConfig,
    json: bool,
}

impl Ctx {
    fn load(config: Option<&Path>, root: Option<PathBuf>, json: bool) -> Result<Self> {
        let mut config = match config {
            Some(path) => CrucibleConfig::load(path)
                .with_context(|| format!("failed to load {}", path.display()))?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                CrucibleConfig::load(Path::new(DEFAULT_CONFIG_FILE))
                    .with_context(|| format!("failed to load {DEFAULT_CONFIG_FILE}"))?
            }
            None => {
                let mut config = CrucibleConfig::default();
                config.apply_env(|k| std::env::var(k).ok())?;
                config.validate()?;
                config
            }
        };
        if let Some(root) = root {
            config.root = root;
        }
        Ok(Self { config, json })
    }

    /// Runner for commands that evaluate instances.
    fn evaluating_runner(&self) -> Result<CycleRunner> {
        let workload = CommandWorkload::from_config(&self.config)
            .context("a [workload] section is required to run cycles")?;
        Ok(CycleRunner::new(self.config.clone(), Arc::new(workload)))
    }

    /// Runner for commands that only read or maintain state.
    fn runner(&self) -> CycleRunner {
        match CommandWorkload::from_config(&self.config) {
            Ok(workload) => CycleRunner::new(self.config.clone(), Arc::new(workload)),
            Err(_) => CycleRunner::new(self.config.clone(), Arc::new(UnconfiguredWorkload)),
        }
    }

    /// Print `value` as JSON, or the text rendering.
    fn emit<T: Serialize>(&self, value: &T, text: impl FnOnce(&T) -> String) -> Result<()> {
        if self.json {
            println!("{}", serde_json::to_string_pretty(value)?);
        } else {
            println!("{}", text(value));
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    crucible_core::init_tracing(cli.json || crucible_core::telemetry::json_requested(), level);

    let ctx = Ctx::load(cli.config.as_deref(), cli.root, cli.json)?;

    match cli.command {
        Commands::Cycle {
            cycles,
            workers,
            force,
            dry_run,
            sequential,
        } => {
            let options = CycleOptions {
                force,
                dry_run,
                workers,
                sequential,
                symptoms: Vec::new(),
            };
            cmd_cycle(&ctx, cycles, options).await
        }
        Commands::Tick { force, dry_run } => cmd_tick(&ctx, force, dry_run).await,
        Commands::Symptom { action } => match action {
            SymptomAction::Record { name, severity } => cmd_symptom_record(&ctx, &name, severity),
            SymptomAction::Pending { limit } => cmd_symptom_pending(&ctx, limit),
            SymptomAction::Flags => cmd_symptom_flags(&ctx),
        },
        Commands::Promotion { action } => match action {
            PromotionAction::List { status } => cmd_promotion_list(&ctx, status),
            PromotionAction::Show { id } => cmd_promotion_show(&ctx, &id),
            PromotionAction::Ack { id, status, note } => {
                cmd_promotion_ack(&ctx, &id, status, note)
            }
            PromotionAction::Drift { id, reason } => cmd_promotion_drift(&ctx, &id, &reason),
            PromotionAction::Watch { id } => cmd_promotion_watch(&ctx, &id).await,
            PromotionAction::Poll => cmd_promotion_poll(&ctx),
        },
        Commands::Instances { action } => match action {
            InstancesAction::List => cmd_instances_list(&ctx),
            InstancesAction::Verify { id } => cmd_instances_verify(&ctx, id.as_deref()),
            InstancesAction::Prune => cmd_instances_prune(&ctx),
        },
        Commands::Lease { action } => match action {
            LeaseAction::Show { resource } => cmd_lease_show(&ctx, &resource),
        },
        Commands::Config { action } => match action {
            ConfigAction::Check => cmd_config_check(&ctx),
        },
    }
}

// ========== Cycles ==========

async fn cmd_cycle(ctx: &Ctx, cycles: u32, options: CycleOptions) -> Result<()> {
    let runner = ctx.evaluating_runner()?;
    for n in 1..=cycles.max(1) {
        let report = runner
            .run_cycle(options.clone())
            .await
            .with_context(|| format!("cycle {n} of {cycles} failed"))?;
        ctx.emit(&report, render_cycle)?;
    }
    Ok(())
}

fn render_cycle(report: &CycleReport) -> String {
    let mut out = vec![format!(
        "{} {} ({}ms)",
        report.cycle_id,
        report.outcome.as_str(),
        (report.finished_at - report.started_at).num_milliseconds()
    )];
    if let Some(resumed) = &report.resumed {
        out.push(format!("  resumed validation of {resumed}"));
    }
    out.push(format!(
        "  generated {}, rejected {}, excluded {}, pruned {}",
        report.generated,
        report.rejected.len(),
        report.excluded.len(),
        report.pruned.len()
    ));
    for rejection in &report.rejected {
        out.push(format!(
            "    ✗ {} ({:?}): {}",
            rejection.candidate_id, rejection.origin, rejection.reason
        ));
    }
    if let Some(bracket) = &report.tournament {
        out.push(format!(
            "  tournament: {} rounds, {} matches, champion {}",
            bracket.rounds.len(),
            bracket.match_count,
            bracket.champion
        ));
    }
    if let Some(run) = &report.validation {
        out.push(format!(
            "  validation: {} ({} passed, {} failed, failure rate {:.3})",
            run.verdict, run.passed, run.failed, run.failure_rate
        ));
        for regression in &run.regressions {
            out.push(format!("    regression: {regression:?}"));
        }
    }
    if let Some(promotion) = &report.promotion {
        out.push(format!(
            "  promotion {} -> {} (ack by {})",
            promotion.promotion_id,
            promotion.instance_id,
            promotion.ack_deadline.to_rfc3339()
        ));
    }
    out.join("\n")
}

async fn cmd_tick(ctx: &Ctx, force: bool, dry_run: bool) -> Result<()> {
    let runner = Arc::new(ctx.evaluating_runner()?);
    let controller = runner.escalation()?;
    let queue: Arc<dyn SymptomQueue> = Arc::new(runner.symptom_queue());
    let mut autopilot = Autopilot::new(Arc::clone(&runner), controller, queue);
    let report = autopilot.tick_once(force, dry_run).await?;
    ctx.emit(&report, render_tick)?;
    if let Some(err) = &report.cycle_error {
        bail!("cycle failed: {err}");
    }
    Ok(())
}

fn render_tick(report: &TickReport) -> String {
    let mut out = vec![format!(
        "ingested {} ({} duplicates)",
        report.ingest.applied, report.ingest.duplicates
    )];
    if !report.ingest.armed.is_empty() {
        out.push(format!("armed: {}", report.ingest.armed.join(", ")));
    }
    out.push(match &report.decision {
        TickDecision::Idle => "idle".to_string(),
        TickDecision::Deferred { blocked, symptoms } => format!(
            "deferred {} (blocked by {})",
            symptoms.join(", "),
            blocked
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        ),
        TickDecision::RunCycle { symptoms } => format!("ran cycle for {}", symptoms.join(", ")),
    });
    if let Some(cycle) = &report.cycle {
        out.push(render_cycle(cycle));
    }
    if !report.cleared.is_empty() {
        out.push(format!("cleared: {}", report.cleared.join(", ")));
    }
    out.join("\n")
}

// ========== Symptoms ==========

fn cmd_symptom_record(ctx: &Ctx, name: &str, severity: f64) -> Result<()> {
    if name.trim().is_empty() {
        bail!("symptom name must not be empty");
    }
    if !severity.is_finite() {
        bail!("severity must be a finite number");
    }
    let record = SymptomRecord::new(name, severity, Utc::now());
    ctx.runner().symptom_queue().publish(&record)?;
    info!(symptom = %name, id = %record.id, "symptom recorded");
    ctx.emit(&record, |r| format!("Recorded {} {} ({})", r.symptom, r.severity, r.id))
}

fn cmd_symptom_pending(ctx: &Ctx, limit: usize) -> Result<()> {
    let pending = ctx.runner().symptom_queue().pending(limit)?;
    ctx.emit(&pending, |records| {
        if records.is_empty() {
            return "No pending symptoms".to_string();
        }
        records
            .iter()
            .map(|r| {
                format!(
                    "{} {} {} {}",
                    r.observed_at.to_rfc3339(),
                    r.symptom,
                    r.severity,
                    r.id
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    })
}

fn cmd_symptom_flags(ctx: &Ctx) -> Result<()> {
    let controller = ctx.runner().escalation()?;
    let flags: Vec<_> = controller.flags().cloned().collect();
    ctx.emit(&flags, |flags| {
        if flags.is_empty() {
            return "No escalation flags".to_string();
        }
        flags
            .iter()
            .map(|f| {
                let state = match f.armed_at {
                    Some(at) if f.is_armed() => format!("armed since {}", at.to_rfc3339()),
                    _ => "quiet".to_string(),
                };
                format!("{} {} ({} in window)", f.symptom, state, f.occurrence_count())
            })
            .collect::<Vec<_>>()
            .join("\n")
    })
}

// ========== Promotions ==========

fn render_promotion(record: &PromotionRecord) -> String {
    format!(
        "{} {} {} fitness {:.4} created {}",
        record.promotion_id,
        record.status,
        record.instance_id,
        record.fitness,
        record.created_at.to_rfc3339()
    )
}

fn cmd_promotion_list(ctx: &Ctx, status: Option<PromotionStatus>) -> Result<()> {
    let records = ctx.runner().promotions().list(status)?;
    ctx.emit(&records, |records| {
        if records.is_empty() {
            return "No promotions".to_string();
        }
        records
            .iter()
            .map(render_promotion)
            .collect::<Vec<_>>()
            .join("\n")
    })
}

#[derive(Serialize)]
struct PromotionDetail {
    record: PromotionRecord,
    acknowledgement: Option<crucible_core::domain::promotion::Acknowledgement>,
    rollback: Option<crucible_core::domain::promotion::RollbackMarker>,
    production: crucible_core::domain::promotion::ProductionPointer,
}

fn cmd_promotion_show(ctx: &Ctx, id: &str) -> Result<()> {
    let pipeline = ctx.runner().promotions();
    let id = PromotionId::from(id);
    let detail = PromotionDetail {
        record: pipeline.load(&id)?,
        acknowledgement: pipeline.acknowledgement(&id)?,
        rollback: pipeline.rollback_marker(&id)?,
        production: pipeline.production()?,
    };
    ctx.emit(&detail, |d| {
        let mut out = vec![render_promotion(&d.record)];
        out.push(format!("  ack deadline {}", d.record.ack_deadline.to_rfc3339()));
        for t in &d.record.transitions {
            out.push(format!("  {} {} -> {}: {}", t.at.to_rfc3339(), t.from, t.to, t.reason));
        }
        if let Some(ack) = &d.acknowledgement {
            out.push(format!("  ack {:?} at {}", ack.status, ack.applied_at.to_rfc3339()));
        }
        if let Some(rb) = &d.rollback {
            out.push(format!("  rolled back ({:?}): {}", rb.reason, rb.detail));
        }
        let current = d.production.current.as_ref().map(ToString::to_string);
        out.push(format!(
            "  production: {}",
            current.as_deref().unwrap_or("none")
        ));
        out.join("\n")
    })
}

fn cmd_promotion_ack(ctx: &Ctx, id: &str, status: AckStatus, note: Option<String>) -> Result<()> {
    let pipeline = ctx.runner().promotions();
    let id = PromotionId::from(id);
    pipeline.acknowledge(&id, status, note)?;
    let record = pipeline.poll(&id)?;
    ctx.emit(&record, render_promotion)
}

fn cmd_promotion_drift(ctx: &Ctx, id: &str, reason: &str) -> Result<()> {
    let record = ctx
        .runner()
        .promotions()
        .report_drift(&PromotionId::from(id), reason)?;
    ctx.emit(&record, render_promotion)
}

async fn cmd_promotion_watch(ctx: &Ctx, id: &str) -> Result<()> {
    let record = ctx
        .runner()
        .promotions()
        .await_acknowledgement(&PromotionId::from(id))
        .await?;
    ctx.emit(&record, render_promotion)?;
    if record.status == PromotionStatus::RolledBack {
        bail!("promotion {} was rolled back", record.promotion_id);
    }
    Ok(())
}

fn cmd_promotion_poll(ctx: &Ctx) -> Result<()> {
    let records = ctx.runner().promotions().poll_all()?;
    ctx.emit(&records, |records| {
        if records.is_empty() {
            return "No unsettled promotions".to_string();
        }
        records
            .iter()
            .map(render_promotion)
            .collect::<Vec<_>>()
            .join("\n")
    })
}

// ========== Instances ==========

#[derive(Serialize)]
struct InstanceRow {
    instance_id: InstanceId,
    created_at: chrono::DateTime<Utc>,
}

fn cmd_instances_list(ctx: &Ctx) -> Result<()> {
    let rows: Vec<InstanceRow> = ctx
        .runner()
        .instance_store()?
        .list()?
        .into_iter()
        .map(|(instance_id, created_at)| InstanceRow {
            instance_id,
            created_at,
        })
        .collect();
    ctx.emit(&rows, |rows| {
        if rows.is_empty() {
            return "No instances".to_string();
        }
        rows.iter()
            .map(|r| format!("{} {}", r.created_at.to_rfc3339(), r.instance_id))
            .collect::<Vec<_>>()
            .join("\n")
    })
}

#[derive(Serialize)]
struct VerifyRow {
    instance_id: InstanceId,
    ok: bool,
    error: Option<String>,
}

fn cmd_instances_verify(ctx: &Ctx, id: Option<&str>) -> Result<()> {
    let store = ctx.runner().instance_store()?;
    let ids: Vec<InstanceId> = match id {
        Some(id) => vec![InstanceId::from(id)],
        None => store.list()?.into_iter().map(|(id, _)| id).collect(),
    };
    let rows: Vec<VerifyRow> = ids
        .into_iter()
        .map(|instance_id| match store.verify(&instance_id) {
            Ok(_) => VerifyRow {
                instance_id,
                ok: true,
                error: None,
            },
            Err(e) => VerifyRow {
                instance_id,
                ok: false,
                error: Some(e.to_string()),
            },
        })
        .collect();
    let bad = rows.iter().filter(|r| !r.ok).count();
    ctx.emit(&rows, |rows| {
        let mut out: Vec<String> = rows
            .iter()
            .map(|r| match &r.error {
                None => format!("  ✓ {}", r.instance_id),
                Some(e) => format!("  ✗ {}: {e}", r.instance_id),
            })
            .collect();
        out.push(format!("{}/{} verified", rows.len() - bad, rows.len()));
        out.join("\n")
    })?;
    if bad > 0 {
        bail!("{bad} instance(s) failed verification");
    }
    Ok(())
}

fn cmd_instances_prune(ctx: &Ctx) -> Result<()> {
    let report = ctx.runner().prune()?;
    ctx.emit(&report, |r| {
        format!(
            "Pruned {} instance(s); {} remaining, {} bytes free",
            r.pruned.len(),
            r.remaining,
            r.free_bytes
        )
    })
}

// ========== Leases & config ==========

fn cmd_lease_show(ctx: &Ctx, resource: &str) -> Result<()> {
    let runner = ctx.runner();
    let lease = runner.leases().current(resource)?;
    let now = Utc::now();
    ctx.emit(&lease, |lease| match lease {
        None => format!("{resource}: free"),
        Some(l) => format!(
            "{resource}: held by {} since {} (expires {}{})",
            l.holder,
            l.acquired_at.to_rfc3339(),
            l.expires_at().to_rfc3339(),
            if l.is_stale(now) { ", stale" } else { "" }
        ),
    })
}

#[derive(Serialize)]
struct ConfigSummary {
    root: PathBuf,
    parameters: usize,
    population: usize,
    workload_stages: Option<usize>,
    workload_digest: Option<String>,
    workload_error: Option<String>,
    window: String,
}

fn cmd_config_check(ctx: &Ctx) -> Result<()> {
    let cfg = &ctx.config;
    let window = cfg.maintenance.window()?;
    let workload = CommandWorkload::from_config(cfg);
    let summary = ConfigSummary {
        root: cfg.root.clone(),
        parameters: cfg.search_space.len(),
        population: cfg.generator.population,
        workload_stages: workload.as_ref().ok().map(|w| w.spec().stages.len()),
        workload_digest: workload.as_ref().ok().map(|w| w.digest().to_string()),
        workload_error: workload.as_ref().err().map(ToString::to_string),
        window: window.to_string(),
    };
    ctx.emit(&summary, |s| {
        let mut out = vec![
            format!("root: {}", s.root.display()),
            format!("parameters: {}", s.parameters),
            format!("population: {}", s.population),
            format!("maintenance window: {}", s.window),
        ];
        match (&s.workload_stages, &s.workload_error) {
            (Some(n), _) => out.push(format!("workload: {n} stage(s)")),
            (None, Some(e)) => out.push(format!("workload: {e}")),
            (None, None) => {}
        }
        out.join("\n")
    })?;
    if let Err(e) = workload {
        bail!("workload configuration is not usable: {e}");
    }
    Ok(())
}
