//! Promotion Pipeline.
//!
//! `promotions/` is the one directory shared with the external apply step:
//!
//! ```text
//! <id>.json           record, written here
//! <id>.ack.json       acknowledgement, written by the apply step
//! <id>.rollback.json  rollback marker, written here
//! current.json        production pointer (current + previous acknowledged)
//! ```
//!
//! Every write is write-temp-then-rename. Absence of an acknowledgement
//! never moves production: the pointer only changes when an
//! acknowledgement is observed, or back to the previous promotion on
//! post-apply drift.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Duration;
use tracing::{debug, warn};

use crucible_state::atomic::{create_atomic, read_json_opt, write_json_atomic};
use crucible_state::StorageError;

use crate::audit::{AuditEntry, AuditLog};
use crate::clock::Clock;
use crate::config::PromotionConfig;
use crate::domain::error::{CrucibleError, Result};
use crate::domain::promotion::{
    AckStatus, Acknowledgement, ProductionPointer, PromotionId, PromotionRecord, PromotionStatus,
    RollbackMarker, RollbackReason, Transition,
};
use crate::domain::validation::ValidatedChampion;
use crate::metrics::METRICS;
use crate::obs;

const ACK_SUFFIX: &str = ".ack.json";
const ROLLBACK_SUFFIX: &str = ".rollback.json";
const CURRENT_FILE: &str = "current.json";

pub struct PromotionPipeline {
    dir: PathBuf,
    ack_deadline: Duration,
    poll_interval: StdDuration,
    clock: Arc<dyn Clock>,
    audit: Option<Arc<AuditLog>>,
}

impl PromotionPipeline {
    pub fn new(dir: impl Into<PathBuf>, config: &PromotionConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            dir: dir.into(),
            ack_deadline: Duration::seconds(config.ack_deadline_secs as i64),
            poll_interval: StdDuration::from_secs(config.poll_interval_secs.max(1)),
            clock,
            audit: None,
        }
    }

    pub fn with_audit(mut self, audit: Arc<AuditLog>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, id: &PromotionId) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    fn ack_path(&self, id: &PromotionId) -> PathBuf {
        self.dir.join(format!("{id}{ACK_SUFFIX}"))
    }

    fn rollback_path(&self, id: &PromotionId) -> PathBuf {
        self.dir.join(format!("{id}{ROLLBACK_SUFFIX}"))
    }

    fn current_path(&self) -> PathBuf {
        self.dir.join(CURRENT_FILE)
    }

    /// Write the pending record for a validated champion. Promoting the same
    /// champion again returns the existing record.
    pub fn promote(&self, champion: &ValidatedChampion) -> Result<PromotionRecord> {
        let id = PromotionId::for_champion(champion.instance_id(), champion.manifest_digest());
        if let Some(existing) = self.find(&id)? {
            debug!(promotion_id = %id, "champion already promoted");
            return Ok(existing);
        }

        let now = self.clock.now();
        let record = PromotionRecord {
            promotion_id: id.clone(),
            instance_id: champion.instance_id().clone(),
            candidate: champion.candidate().clone(),
            fitness: champion.fitness(),
            created_at: now,
            ack_deadline: now + self.ack_deadline,
            status: PromotionStatus::Pending,
            transitions: Vec::new(),
        };
        let bytes = serde_json::to_vec_pretty(&record)?;
        match create_atomic(&self.record_path(&id), &bytes) {
            Ok(()) => {}
            Err(StorageError::Io(e)) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return self.load(&id);
            }
            Err(e) => return Err(e.into()),
        }

        METRICS.inc_promotions();
        obs::emit_promotion_written(id.as_str(), record.instance_id.as_str(), record.fitness);
        self.audit_transition(&id, None, PromotionStatus::Pending, "validated champion");
        Ok(record)
    }

    fn find(&self, id: &PromotionId) -> Result<Option<PromotionRecord>> {
        Ok(read_json_opt(&self.record_path(id))?)
    }

    pub fn load(&self, id: &PromotionId) -> Result<PromotionRecord> {
        self.find(id)?
            .ok_or_else(|| CrucibleError::NotFound(format!("promotion {id}")))
    }

    /// Records, oldest first, optionally filtered by status.
    pub fn list(&self, status: Option<PromotionStatus>) -> Result<Vec<PromotionRecord>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut out = Vec::new();
        for entry in entries {
            let name = entry?.file_name().to_string_lossy().into_owned();
            if name == CURRENT_FILE
                || name.starts_with('.')
                || name.ends_with(ACK_SUFFIX)
                || name.ends_with(ROLLBACK_SUFFIX)
            {
                continue;
            }
            let Some(stem) = name.strip_suffix(".json") else {
                continue;
            };
            match self.find(&PromotionId::from(stem)) {
                Ok(Some(record)) => {
                    if status.map_or(true, |s| record.status == s) {
                        out.push(record);
                    }
                }
                Ok(None) => {}
                Err(e) => warn!(file = %name, error = %e, "skipping unreadable promotion record"),
            }
        }
        out.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.promotion_id.cmp(&b.promotion_id))
        });
        Ok(out)
    }

    /// Write an acknowledgement on behalf of the apply step.
    pub fn acknowledge(
        &self,
        id: &PromotionId,
        status: AckStatus,
        note: Option<String>,
    ) -> Result<Acknowledgement> {
        self.load(id)?;
        let ack = Acknowledgement {
            promotion_id: id.clone(),
            applied_at: self.clock.now(),
            status,
            note,
        };
        write_json_atomic(&self.ack_path(id), &ack)?;
        Ok(ack)
    }

    pub fn acknowledgement(&self, id: &PromotionId) -> Result<Option<Acknowledgement>> {
        Ok(read_json_opt(&self.ack_path(id))?)
    }

    pub fn rollback_marker(&self, id: &PromotionId) -> Result<Option<RollbackMarker>> {
        Ok(read_json_opt(&self.rollback_path(id))?)
    }

    pub fn production(&self) -> Result<ProductionPointer> {
        Ok(read_json_opt(&self.current_path())?.unwrap_or_default())
    }

    /// Advance one record from whatever acknowledgement is on disk, or roll
    /// it back once its deadline passed without one.
    pub fn poll(&self, id: &PromotionId) -> Result<PromotionRecord> {
        let mut record = self.load(id)?;
        if record.status.is_settled() {
            return Ok(record);
        }

        match self.acknowledgement(id)? {
            Some(ack) if ack.promotion_id != *id => {
                warn!(promotion_id = %id, named = %ack.promotion_id, "acknowledgement names another promotion; ignored");
            }
            Some(ack) => match ack.status {
                AckStatus::Failed => {
                    let detail = ack.note.unwrap_or_else(|| "apply step reported failure".into());
                    self.roll_back(&mut record, RollbackReason::ApplyFailed, &detail)?;
                    return Ok(record);
                }
                AckStatus::Applied => {
                    if record.status == PromotionStatus::Pending {
                        self.transition(&mut record, PromotionStatus::Applied, "apply step applied")?;
                    }
                }
                AckStatus::Acknowledged => {
                    if record.status == PromotionStatus::Pending {
                        self.transition(&mut record, PromotionStatus::Applied, "apply step applied")?;
                    }
                    self.transition(
                        &mut record,
                        PromotionStatus::Acknowledged,
                        "apply step acknowledged",
                    )?;
                    self.advance_pointer(id)?;
                    return Ok(record);
                }
            },
            None => {}
        }

        let now = self.clock.now();
        if now >= record.ack_deadline {
            let timeout = CrucibleError::PromotionTimeout {
                promotion_id: id.to_string(),
                deadline: record.ack_deadline,
            };
            self.roll_back(&mut record, RollbackReason::AckTimeout, &timeout.to_string())?;
        }
        Ok(record)
    }

    /// Poll every unsettled record.
    pub fn poll_all(&self) -> Result<Vec<PromotionRecord>> {
        let mut out = Vec::new();
        for record in self.list(None)? {
            if record.status.is_settled() {
                continue;
            }
            out.push(self.poll(&record.promotion_id)?);
        }
        Ok(out)
    }

    /// Post-apply regression reported by the external monitor.
    pub fn report_drift(&self, id: &PromotionId, reason: &str) -> Result<PromotionRecord> {
        let mut record = self.load(id)?;
        if record.status == PromotionStatus::RolledBack {
            return Ok(record);
        }
        let drift = CrucibleError::DriftDetected {
            promotion_id: id.to_string(),
            reason: reason.to_string(),
        };
        self.roll_back(&mut record, RollbackReason::Drift, &drift.to_string())?;
        Ok(record)
    }

    /// Poll until the record reaches acknowledged or rolled back.
    pub async fn await_acknowledgement(&self, id: &PromotionId) -> Result<PromotionRecord> {
        loop {
            let record = self.poll(id)?;
            if record.status.is_settled() {
                return Ok(record);
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    fn transition(
        &self,
        record: &mut PromotionRecord,
        to: PromotionStatus,
        reason: &str,
    ) -> Result<()> {
        let from = record.status;
        if !from.can_transition_to(to) {
            return Err(CrucibleError::InvalidTransition {
                promotion_id: record.promotion_id.to_string(),
                from: from.to_string(),
                to: to.to_string(),
            });
        }
        record.transitions.push(Transition {
            from,
            to,
            at: self.clock.now(),
            reason: reason.to_string(),
        });
        record.status = to;
        write_json_atomic(&self.record_path(&record.promotion_id), record)?;

        obs::emit_promotion_transition(record.promotion_id.as_str(), from.as_str(), to.as_str(), reason);
        self.audit_transition(&record.promotion_id, Some(from), to, reason);
        Ok(())
    }

    fn roll_back(
        &self,
        record: &mut PromotionRecord,
        reason: RollbackReason,
        detail: &str,
    ) -> Result<()> {
        let was_acknowledged = record.status == PromotionStatus::Acknowledged;
        let marker = RollbackMarker {
            promotion_id: record.promotion_id.clone(),
            reason,
            detail: detail.to_string(),
            at: self.clock.now(),
        };
        write_json_atomic(&self.rollback_path(&record.promotion_id), &marker)?;
        self.transition(record, PromotionStatus::RolledBack, detail)?;
        METRICS.inc_rollbacks();
        if was_acknowledged {
            self.restore_pointer(&record.promotion_id)?;
        }
        Ok(())
    }

    fn advance_pointer(&self, id: &PromotionId) -> Result<()> {
        let mut pointer = self.production()?;
        if pointer.current.as_ref() == Some(id) {
            return Ok(());
        }
        pointer.previous = pointer.current.take();
        pointer.current = Some(id.clone());
        pointer.updated_at = Some(self.clock.now());
        Ok(write_json_atomic(&self.current_path(), &pointer)?)
    }

    fn restore_pointer(&self, id: &PromotionId) -> Result<()> {
        let mut pointer = self.production()?;
        if pointer.current.as_ref() != Some(id) {
            return Ok(());
        }
        pointer.current = pointer.previous.take();
        pointer.updated_at = Some(self.clock.now());
        Ok(write_json_atomic(&self.current_path(), &pointer)?)
    }

    fn audit_transition(
        &self,
        id: &PromotionId,
        from: Option<PromotionStatus>,
        to: PromotionStatus,
        reason: &str,
    ) {
        if let Some(audit) = &self.audit {
            audit.record(
                None,
                self.clock.now(),
                AuditEntry::Promotion {
                    promotion_id: id.to_string(),
                    from: from.map(|s| s.to_string()),
                    to: to.to_string(),
                    reason: reason.to_string(),
                },
            );
        }
    }
}
