//! Durable decision trail (`audit.jsonl`): one line per evaluation, match,
//! round, validation unit, promotion transition and escalation transition.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crucible_state::JsonlLog;

use crate::domain::evaluation::EvaluationResult;
use crate::domain::instance::InstanceId;
use crate::domain::search_space::Params;
use crate::domain::validation::UnitOutcome;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuditEntry {
    Evaluation {
        params: Params,
        result: EvaluationResult,
    },
    Match {
        round: usize,
        winner: InstanceId,
        loser: InstanceId,
        winner_fitness: f64,
        loser_fitness: f64,
        tie_break: Option<String>,
    },
    Round {
        round: usize,
        entrants: usize,
        matches: usize,
        bye: Option<InstanceId>,
        advanced: Vec<InstanceId>,
        duration_ms: u64,
    },
    ValidationUnit {
        instance_id: InstanceId,
        outcome: UnitOutcome,
    },
    Promotion {
        promotion_id: String,
        from: Option<String>,
        to: String,
        reason: String,
    },
    Escalation {
        symptom: String,
        transition: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cycle_id: Option<String>,
    #[serde(flatten)]
    pub entry: AuditEntry,
}

/// Append-only writer. A failed write is logged and dropped: the audit
/// trail must never abort the decision it records.
#[derive(Debug)]
pub struct AuditLog {
    log: JsonlLog<AuditRecord>,
}

impl AuditLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            log: JsonlLog::new(path),
        }
    }

    pub fn record(&self, cycle_id: Option<&str>, at: DateTime<Utc>, entry: AuditEntry) {
        let record = AuditRecord {
            at,
            cycle_id: cycle_id.map(str::to_string),
            entry,
        };
        if let Err(e) = self.log.append(&record) {
            warn!(path = %self.log.path().display(), error = %e, "audit write failed");
        }
    }

    pub fn read_all(&self) -> crate::Result<Vec<AuditRecord>> {
        Ok(self.log.read_all()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_are_flat_and_tagged() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::new(dir.path().join("audit.jsonl"));
        log.record(
            Some("cycle-1"),
            Utc::now(),
            AuditEntry::Escalation {
                symptom: "latency".into(),
                transition: "armed".into(),
            },
        );

        let raw = std::fs::read_to_string(dir.path().join("audit.jsonl")).unwrap();
        let value: serde_json::Value = serde_json::from_str(raw.trim()).unwrap();
        assert_eq!(value["kind"], "escalation");
        assert_eq!(value["cycle_id"], "cycle-1");
        assert_eq!(value["symptom"], "latency");

        let back = log.read_all().unwrap();
        assert_eq!(back.len(), 1);
    }
}
