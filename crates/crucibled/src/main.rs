//! crucibled: runs the autopilot until interrupted.

mod daemon;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::mpsc;
use tracing::{info, warn, Level};

use crucible_core::config::DEFAULT_CONFIG_FILE;
use crucible_core::{CrucibleConfig, CycleRunner};
use crucible_state::SymptomQueue;
use crucible_workload::CommandWorkload;

use daemon::Daemon;

#[derive(Parser)]
#[command(name = "crucibled")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Crucible autopilot daemon", long_about = None)]
struct Args {
    /// Configuration file
    #[arg(short, long, env = "CRUCIBLE_CONFIG", default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Override the state root directory
    #[arg(long)]
    root: Option<PathBuf>,

    /// Override escalation.tick_secs
    #[arg(long)]
    tick_secs: Option<u64>,

    /// Stop triggered cycles after the tournament
    #[arg(long)]
    dry_run: bool,

    /// Emit JSON-formatted log lines
    #[arg(long)]
    json: bool,

    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    crucible_core::init_tracing(
        args.json || crucible_core::telemetry::json_requested(),
        level,
    );

    let mut config = CrucibleConfig::load(&args.config)
        .with_context(|| format!("failed to load {}", args.config.display()))?;
    if let Some(root) = args.root {
        config.root = root;
    }
    let workload =
        CommandWorkload::from_config(&config).context("invalid [workload] section")?;
    info!(
        version = crucible_core::VERSION,
        root = %config.root.display(),
        workload = %workload.digest(),
        "crucibled starting"
    );

    let runner = Arc::new(CycleRunner::new(config, Arc::new(workload)));
    let controller = runner.escalation()?;
    let queue: Arc<dyn SymptomQueue> = Arc::new(runner.symptom_queue());

    let mut daemon = Daemon::new(Arc::clone(&runner), controller, queue).dry_run(args.dry_run);
    if let Some(secs) = args.tick_secs {
        daemon = daemon.with_tick(Duration::from_secs(secs.max(1)));
    }

    let (signal_tx, signal_rx) = mpsc::channel(2);
    tokio::spawn(async move {
        loop {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "cannot listen for interrupts");
                return;
            }
            if signal_tx.send(()).await.is_err() {
                return;
            }
        }
    });

    let stats = daemon.run(signal_rx).await;
    info!(
        ticks = stats.ticks,
        cycles_started = stats.cycles_started,
        cycles_finished = stats.cycles_finished,
        cycles_refused = stats.cycles_refused,
        cycles_aborted = stats.cycles_aborted,
        "crucibled exiting"
    );
    Ok(())
}
