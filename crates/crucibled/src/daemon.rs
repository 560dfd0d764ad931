//! Autopilot loop.
//!
//! Every tick the daemon advances unsettled promotions, ingests symptoms
//! and asks the escalation controller whether to run a cycle. Cycles run on
//! their own task so ticks keep flowing; their feedback comes back over a
//! channel and is applied by the loop, which is the only owner of the
//! controller. At most one cycle is in flight.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crucible_core::{
    CrucibleError, CycleFeedback, CycleOptions, CycleRunner, EscalationController, TickDecision,
};
use crucible_state::SymptomQueue;

/// Shutdown requests. The first drains the in-flight cycle; the second
/// aborts it. A closed channel requests nothing.
pub type Signals = mpsc::Receiver<()>;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DaemonStats {
    pub ticks: u64,
    pub cycles_started: u64,
    pub cycles_finished: u64,
    /// Cycles that found the cycle lease held by another process.
    pub cycles_refused: u64,
    pub cycles_aborted: u64,
    pub cleared: Vec<String>,
}

pub struct Daemon {
    runner: Arc<CycleRunner>,
    controller: EscalationController,
    queue: Arc<dyn SymptomQueue>,
    tick: Duration,
    dry_run: bool,
}

impl Daemon {
    pub fn new(
        runner: Arc<CycleRunner>,
        controller: EscalationController,
        queue: Arc<dyn SymptomQueue>,
    ) -> Self {
        let tick = Duration::from_secs(runner.config().escalation.tick_secs.max(1));
        Self {
            runner,
            controller,
            queue,
            tick,
            dry_run: false,
        }
    }

    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    /// Cycles stop after the tournament.
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub async fn run(mut self, mut signals: Signals) -> DaemonStats {
        let (feedback_tx, mut feedback_rx) = mpsc::channel::<CycleFeedback>(1);
        let mut in_flight: Option<JoinHandle<()>> = None;
        let mut stats = DaemonStats::default();
        let mut interval = tokio::time::interval(self.tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(tick_secs = self.tick.as_secs(), dry_run = self.dry_run, "daemon started");

        loop {
            tokio::select! {
                Some(()) = signals.recv() => {
                    info!("shutdown requested");
                    break;
                }
                Some(feedback) = feedback_rx.recv() => {
                    in_flight = None;
                    self.apply_feedback(&feedback, &mut stats);
                }
                _ = interval.tick() => {
                    stats.ticks += 1;
                    if let Some(handle) = self.tick_once(&feedback_tx, in_flight.is_some()) {
                        stats.cycles_started += 1;
                        in_flight = Some(handle);
                    }
                }
            }
        }

        if let Some(mut handle) = in_flight {
            info!("waiting for the in-flight cycle; signal again to abort it");
            tokio::select! {
                _ = &mut handle => {
                    if let Ok(feedback) = feedback_rx.try_recv() {
                        self.apply_feedback(&feedback, &mut stats);
                    }
                }
                Some(()) = signals.recv() => {
                    warn!("aborting in-flight cycle; its lease will be reclaimed once stale");
                    handle.abort();
                    stats.cycles_aborted += 1;
                }
            }
        }

        info!(
            ticks = stats.ticks,
            cycles = stats.cycles_finished,
            "daemon stopped"
        );
        stats
    }

    fn apply_feedback(&mut self, feedback: &CycleFeedback, stats: &mut DaemonStats) {
        if feedback.lease_held {
            stats.cycles_refused += 1;
        } else {
            stats.cycles_finished += 1;
        }
        match feedback.apply(&mut self.controller) {
            Ok(cleared) => stats.cleared.extend(cleared),
            Err(e) => warn!(error = %e, "failed to record cycle feedback"),
        }
    }

    /// One tick. Returns the handle of a newly started cycle.
    fn tick_once(
        &mut self,
        feedback_tx: &mpsc::Sender<CycleFeedback>,
        cycle_running: bool,
    ) -> Option<JoinHandle<()>> {
        match self.runner.promotions().poll_all() {
            Ok(records) if !records.is_empty() => {
                debug!(unsettled = records.len(), "promotions polled");
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "promotion poll failed"),
        }

        let limit = self.runner.config().escalation.symptoms_per_tick;
        if let Err(e) = self.controller.ingest(self.queue.as_ref(), limit) {
            warn!(error = %e, "symptom ingest failed");
        }
        if cycle_running {
            return None;
        }

        let clock = self.runner.clock();
        let symptoms = match self.controller.tick(clock.now(), false) {
            Ok(TickDecision::RunCycle { symptoms }) => symptoms,
            Ok(_) => return None,
            Err(e) => {
                warn!(error = %e, "escalation tick failed");
                return None;
            }
        };

        let started = clock.now();
        if let Err(e) = self.controller.record_cycle_started(started) {
            warn!(error = %e, "failed to record cycle start; not running");
            return None;
        }

        let runner = Arc::clone(&self.runner);
        let tx = feedback_tx.clone();
        let options = CycleOptions {
            dry_run: self.dry_run,
            symptoms: symptoms.clone(),
            ..CycleOptions::default()
        };
        Some(tokio::spawn(async move {
            let result = runner.run_cycle(options).await;
            let feedback = CycleFeedback::from_result(started, clock.now(), symptoms, &result);
            match &result {
                Ok(report) => info!(
                    cycle_id = %report.cycle_id,
                    outcome = report.outcome.as_str(),
                    "autonomous cycle finished"
                ),
                Err(e @ CrucibleError::LeaseHeld { .. }) => {
                    info!(error = %e, "autonomous cycle skipped")
                }
                Err(e) => warn!(error = %e, "autonomous cycle failed"),
            }
            if tx.send(feedback).await.is_err() {
                debug!("daemon gone before cycle feedback");
            }
        }))
    }
}
