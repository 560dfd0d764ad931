//! Escalation Controller.
//!
//! Per-symptom state machine:
//!
//! ```text
//! quiet --(threshold occurrences inside window)--> armed
//! armed --(cycle reports validated improvement)--> quiet
//! armed --(ttl elapsed)--> quiet   (occurrences dropped, no re-arm)
//! ```
//!
//! A tick expires flags and, if anything is armed, checks the window,
//! budget and cooldown gates. A failed gate defers the cycle and leaves the
//! flags armed.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{debug, info};

use crucible_state::atomic::{read_json_opt, write_json_atomic};
use crucible_state::{SymptomQueue, SymptomRecord};

use crate::audit::{AuditEntry, AuditLog};
use crate::config::EscalationConfig;
use crate::domain::error::Result;
use crate::domain::escalation::{
    ClearReason, EscalationFlag, EscalationState, FlagState, Gate, NightBudget, SeveritySample,
    TickDecision,
};
use crate::obs;
use crate::window::MaintenanceWindow;

const RECENT_IDS: usize = 4096;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IngestReport {
    pub applied: usize,
    pub duplicates: usize,
    /// Symptoms that armed during this ingest.
    pub armed: Vec<String>,
}

pub struct EscalationController {
    config: EscalationConfig,
    window: MaintenanceWindow,
    state_path: PathBuf,
    state: EscalationState,
    audit: Option<Arc<AuditLog>>,
    /// Start charged by `record_cycle_started` and not yet settled, with the
    /// cooldown start it replaced.
    unsettled: Option<(DateTime<Utc>, Option<DateTime<Utc>>)>,
}

impl EscalationController {
    /// Load persisted state from `state_path`, or start empty.
    pub fn open(
        config: EscalationConfig,
        window: MaintenanceWindow,
        state_path: impl Into<PathBuf>,
    ) -> Result<Self> {
        let state_path = state_path.into();
        let state = read_json_opt(&state_path)?.unwrap_or_default();
        Ok(Self {
            config,
            window,
            state_path,
            state,
            audit: None,
            unsettled: None,
        })
    }

    pub fn with_audit(mut self, audit: Arc<AuditLog>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn state(&self) -> &EscalationState {
        &self.state
    }

    pub fn flag(&self, symptom: &str) -> Option<&EscalationFlag> {
        self.state.flags.get(symptom)
    }

    pub fn flags(&self) -> impl Iterator<Item = &EscalationFlag> {
        self.state.flags.values()
    }

    pub fn armed(&self) -> Vec<String> {
        self.flags()
            .filter(|f| f.is_armed())
            .map(|f| f.symptom.clone())
            .collect()
    }

    fn persist(&self) -> Result<()> {
        Ok(write_json_atomic(&self.state_path, &self.state)?)
    }

    fn audit(&self, at: DateTime<Utc>, symptom: &str, transition: &str) {
        if let Some(audit) = &self.audit {
            audit.record(
                None,
                at,
                AuditEntry::Escalation {
                    symptom: symptom.to_string(),
                    transition: transition.to_string(),
                },
            );
        }
    }

    /// Apply one observation. Returns `true` if it armed the flag.
    ///
    /// The observation counts as an occurrence when the symptom has no
    /// baseline yet (no samples older than the sliding window) or its
    /// severity reaches the baseline mean scaled by the tolerance.
    ///
    /// A symptom's own earlier samples form its baseline, so one that keeps
    /// recurring at the same severity stops counting once those samples age
    /// past the sliding window. After a flag expires, a steady symptom
    /// cannot re-arm until `baseline_days` have passed or it gets worse.
    pub fn observe(&mut self, record: &SymptomRecord) -> bool {
        let at = record.observed_at;
        let window = self.config.window();
        let baseline_since = at - self.config.baseline_span();

        let samples = self.state.samples.entry(record.symptom.clone()).or_default();
        let (sum, n) = samples
            .iter()
            .filter(|s| s.at < at - window && s.at >= baseline_since)
            .fold((0.0, 0usize), |(sum, n), s| (sum + s.severity, n + 1));
        let counts = n == 0 || record.severity >= (sum / n as f64) * (1.0 + self.config.severity_tolerance);
        samples.push(SeveritySample {
            at,
            severity: record.severity,
        });
        samples.retain(|s| s.at >= baseline_since);

        if !counts {
            debug!(symptom = %record.symptom, severity = record.severity, "observation within baseline");
            return false;
        }

        let ttl_secs = self.config.ttl().num_seconds();
        let flag = self
            .state
            .flags
            .entry(record.symptom.clone())
            .or_insert_with(|| EscalationFlag::quiet(&record.symptom, ttl_secs));
        flag.occurrences.push(at);
        flag.occurrences.sort();
        let latest = flag.occurrences.last().copied().unwrap_or(at);
        flag.occurrences.retain(|t| *t > latest - window);

        if flag.state == FlagState::Quiet
            && flag.occurrence_count() >= self.config.threshold as usize
        {
            flag.state = FlagState::Armed;
            flag.armed_at = Some(at);
            flag.ttl_secs = ttl_secs;
            let (count, expires) = (flag.occurrence_count(), flag.expires_at().unwrap_or(at));
            obs::emit_escalation_armed(&record.symptom, count, expires);
            self.audit(at, &record.symptom, "armed");
            return true;
        }
        false
    }

    /// Apply pending symptom records. Redelivered ids are ignored; state is
    /// persisted before records are marked processed.
    pub fn ingest(&mut self, queue: &dyn SymptomQueue, limit: usize) -> Result<IngestReport> {
        let pending = queue.pending(limit)?;
        if pending.is_empty() {
            return Ok(IngestReport::default());
        }

        let mut report = IngestReport::default();
        for record in &pending {
            if self.state.recent_ids.contains(&record.id) {
                report.duplicates += 1;
                continue;
            }
            if self.observe(record) {
                report.armed.push(record.symptom.clone());
            }
            self.state.recent_ids.push_back(record.id.clone());
            while self.state.recent_ids.len() > RECENT_IDS {
                self.state.recent_ids.pop_front();
            }
            report.applied += 1;
        }
        self.persist()?;
        for record in &pending {
            queue.mark_processed(&record.id)?;
        }
        Ok(report)
    }

    fn expire(&mut self, now: DateTime<Utc>) -> Vec<String> {
        let mut expired = Vec::new();
        for flag in self.state.flags.values_mut() {
            if flag.is_armed() && flag.expires_at().is_some_and(|t| now >= t) {
                flag.state = FlagState::Quiet;
                flag.occurrences.clear();
                flag.armed_at = None;
                flag.last_cleared = Some(ClearReason::Expired);
                expired.push(flag.symptom.clone());
            }
        }
        for symptom in &expired {
            obs::emit_escalation_expired(symptom);
            self.audit(now, symptom, "expired");
        }
        expired
    }

    fn budget_for(&mut self, now: DateTime<Utc>) -> &mut NightBudget {
        let night = self.window.night_of(now);
        let budget = self.state.budget.get_or_insert_with(|| NightBudget {
            night,
            cycles_started: 0,
            minutes_used: 0.0,
        });
        if budget.night != night {
            *budget = NightBudget {
                night,
                cycles_started: 0,
                minutes_used: 0.0,
            };
        }
        budget
    }

    /// Gates that currently block a cycle. `force` skips the window gate
    /// only.
    pub fn blocked_gates(&mut self, now: DateTime<Utc>, force: bool) -> Vec<Gate> {
        let mut blocked = Vec::new();
        if !force && !self.window.contains(now) {
            blocked.push(Gate::Window);
        }
        let (cycles, minutes) = (self.config.nightly_cycle_budget, self.config.nightly_minutes);
        let budget = self.budget_for(now);
        if budget.cycles_started >= cycles || budget.minutes_used >= f64::from(minutes) {
            blocked.push(Gate::Budget);
        }
        if self
            .state
            .last_cycle_started
            .is_some_and(|t| now - t < self.config.cooldown())
        {
            blocked.push(Gate::Cooldown);
        }
        blocked
    }

    /// One controller tick.
    pub fn tick(&mut self, now: DateTime<Utc>, force: bool) -> Result<TickDecision> {
        self.expire(now);
        let symptoms = self.armed();
        let decision = if symptoms.is_empty() {
            self.budget_for(now);
            TickDecision::Idle
        } else {
            let blocked = self.blocked_gates(now, force);
            if blocked.is_empty() {
                info!(symptoms = %symptoms.join(","), "escalation permits a cycle");
                TickDecision::RunCycle { symptoms }
            } else {
                let names: Vec<String> = blocked.iter().map(Gate::to_string).collect();
                obs::emit_escalation_deferred(&names, &symptoms);
                TickDecision::Deferred { blocked, symptoms }
            }
        };
        self.persist()?;
        Ok(decision)
    }

    /// Charge a cycle start to the budget and restart the cooldown.
    pub fn record_cycle_started(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.unsettled = Some((now, self.state.last_cycle_started));
        self.state.last_cycle_started = Some(now);
        self.budget_for(now).cycles_started += 1;
        self.persist()
    }

    /// Undo the charge for a cycle started at `started` that never ran
    /// (another process held the cycle lease): the budget slot is returned
    /// and the cooldown goes back to the previous start.
    pub fn refund_cycle_start(&mut self, started: DateTime<Utc>) -> Result<()> {
        let previous = match self.unsettled.take() {
            Some((at, previous)) if at == started => previous,
            other => {
                self.unsettled = other;
                return Ok(());
            }
        };
        if self.state.last_cycle_started == Some(started) {
            self.state.last_cycle_started = previous;
        }
        let night = self.window.night_of(started);
        if let Some(budget) = self.state.budget.as_mut().filter(|b| b.night == night) {
            budget.cycles_started = budget.cycles_started.saturating_sub(1);
        }
        debug!(%started, "cycle start refunded");
        self.persist()
    }

    /// Charge the cycle's wall time and, on validated improvement, clear the
    /// flags it was started for (every armed flag when `symptoms` is empty).
    pub fn record_cycle_finished(
        &mut self,
        started: DateTime<Utc>,
        finished: DateTime<Utc>,
        improved: bool,
        symptoms: &[String],
    ) -> Result<Vec<String>> {
        self.unsettled = None;
        let minutes = (finished - started).max(Duration::zero()).num_seconds() as f64 / 60.0;
        let night = self.window.night_of(started);
        match self.state.budget.as_mut() {
            Some(budget) if budget.night == night => budget.minutes_used += minutes,
            _ => {}
        }

        let mut cleared = Vec::new();
        if improved {
            for flag in self.state.flags.values_mut() {
                let targeted = symptoms.is_empty() || symptoms.contains(&flag.symptom);
                if flag.is_armed() && targeted {
                    flag.state = FlagState::Quiet;
                    flag.occurrences.clear();
                    flag.armed_at = None;
                    flag.last_cleared = Some(ClearReason::ValidatedImprovement);
                    cleared.push(flag.symptom.clone());
                }
            }
        }
        for symptom in &cleared {
            info!(symptom = %symptom, "escalation cleared by validated improvement");
            self.audit(finished, symptom, "cleared");
        }
        self.persist()?;
        Ok(cleared)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 10, h, m, 0).unwrap()
    }

    fn controller(dir: &std::path::Path) -> EscalationController {
        EscalationController::open(
            EscalationConfig::default(),
            MaintenanceWindow::parse("02:00", "05:00").unwrap(),
            dir.join("escalation/state.json"),
        )
        .unwrap()
    }

    #[test]
    fn arms_on_third_occurrence_only() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = controller(dir.path());
        assert!(!c.observe(&SymptomRecord::new("x", 1.0, at(1, 0))));
        assert!(!c.observe(&SymptomRecord::new("x", 1.0, at(2, 0))));
        assert!(!c.flag("x").unwrap().is_armed());
        assert!(c.observe(&SymptomRecord::new("x", 1.0, at(3, 0))));
        assert!(c.flag("x").unwrap().is_armed());
    }

    #[test]
    fn occurrences_outside_window_do_not_count() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = controller(dir.path());
        let t0 = at(0, 0);
        c.observe(&SymptomRecord::new("x", 1.0, t0));
        c.observe(&SymptomRecord::new("x", 1.0, t0 + Duration::hours(13)));
        // 26h after the first: the first has slid out. Severity is raised so
        // the first sample, now baseline, does not mask the observation.
        assert!(!c.observe(&SymptomRecord::new("x", 2.0, t0 + Duration::hours(26))));
        assert_eq!(c.flag("x").unwrap().occurrence_count(), 2);
    }

    #[test]
    fn severity_within_baseline_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = controller(dir.path());
        let t0 = at(0, 0);
        c.observe(&SymptomRecord::new("x", 1.0, t0));
        let later = t0 + Duration::days(2);
        assert!(!c.observe(&SymptomRecord::new("x", 1.1, later)));
        assert_eq!(c.flag("x").unwrap().occurrences, vec![t0]);
        c.observe(&SymptomRecord::new("x", 2.0, later + Duration::minutes(1)));
        assert_eq!(
            c.flag("x").unwrap().occurrences,
            vec![later + Duration::minutes(1)]
        );
    }

    #[test]
    fn gates_defer_without_clearing() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = controller(dir.path());
        for h in 0..3 {
            c.observe(&SymptomRecord::new("x", 1.0, at(10 + h, 0)));
        }
        // 13:00 is outside 02:00-05:00.
        let d = c.tick(at(13, 0), false).unwrap();
        assert_eq!(
            d,
            TickDecision::Deferred {
                blocked: vec![Gate::Window],
                symptoms: vec!["x".into()]
            }
        );
        assert!(c.flag("x").unwrap().is_armed());

        // force only bypasses the window.
        let d = c.tick(at(13, 0), true).unwrap();
        assert!(matches!(d, TickDecision::RunCycle { .. }));
        c.record_cycle_started(at(13, 0)).unwrap();
        let d = c.tick(at(13, 30), true).unwrap();
        assert_eq!(
            d,
            TickDecision::Deferred {
                blocked: vec![Gate::Cooldown],
                symptoms: vec!["x".into()]
            }
        );
    }

    #[test]
    fn refused_cycle_gives_its_budget_and_cooldown_back() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = controller(dir.path());
        let first = at(2, 0);
        c.record_cycle_started(first).unwrap();
        c.record_cycle_finished(first, first + Duration::minutes(10), false, &[])
            .unwrap();

        let refused = first + Duration::hours(2);
        c.record_cycle_started(refused).unwrap();
        assert!(c.blocked_gates(refused, true).contains(&Gate::Budget));
        c.refund_cycle_start(refused).unwrap();

        assert_eq!(c.state().last_cycle_started, Some(first));
        assert_eq!(c.state().budget.as_ref().unwrap().cycles_started, 1);
        assert!(c.blocked_gates(refused, true).is_empty());

        // Refunds are persisted.
        let reopened = controller(dir.path());
        assert_eq!(reopened.state().budget.as_ref().unwrap().cycles_started, 1);
    }

    #[test]
    fn refund_of_a_settled_start_changes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = controller(dir.path());
        let t = at(2, 0);
        c.record_cycle_started(t).unwrap();
        c.record_cycle_finished(t, t + Duration::minutes(5), false, &[])
            .unwrap();
        c.refund_cycle_start(t).unwrap();
        assert_eq!(c.state().last_cycle_started, Some(t));
        assert_eq!(c.state().budget.as_ref().unwrap().cycles_started, 1);
    }

    #[test]
    fn steady_symptom_is_masked_by_its_own_baseline_after_expiry() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = controller(dir.path());
        let t0 = at(0, 0);
        for h in 0..3 {
            c.observe(&SymptomRecord::new("x", 1.0, t0 + Duration::hours(h)));
        }
        assert!(c.flag("x").unwrap().is_armed());
        c.tick(t0 + Duration::hours(2 + 72), false).unwrap();
        assert!(!c.flag("x").unwrap().is_armed());

        // Same severity: the earlier samples are now the baseline.
        for h in 80..83 {
            assert!(!c.observe(&SymptomRecord::new("x", 1.0, t0 + Duration::hours(h))));
        }
        assert_eq!(c.flag("x").unwrap().occurrence_count(), 0);

        // Worse than baseline * (1 + tolerance) counts again.
        let armed: Vec<bool> = (83..86)
            .map(|h| c.observe(&SymptomRecord::new("x", 1.3, t0 + Duration::hours(h))))
            .collect();
        assert_eq!(armed, vec![false, false, true]);
    }

    #[test]
    fn nightly_budget_resets_each_night() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = controller(dir.path());
        let night1 = at(2, 0);
        c.record_cycle_started(night1).unwrap();
        c.record_cycle_started(night1 + Duration::hours(2)).unwrap();
        let t = night1 + Duration::hours(2) + Duration::minutes(95);
        assert!(c.blocked_gates(t, true).contains(&Gate::Budget));

        let next_night = night1 + Duration::days(1);
        assert!(c.blocked_gates(next_night, false).is_empty());
    }

    #[test]
    fn state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut c = controller(dir.path());
            for h in 0..3 {
                c.observe(&SymptomRecord::new("x", 1.0, at(h, 0)));
            }
            c.tick(at(3, 0), false).unwrap();
        }
        let c = controller(dir.path());
        assert!(c.flag("x").unwrap().is_armed());
    }
}
