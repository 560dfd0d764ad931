//! Append-only ledger of promoted winners (`winners.jsonl`). The candidate
//! generator reads it to seed mutation.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crucible_state::JsonlLog;

use crate::domain::candidate::Candidate;
use crate::domain::error::Result;
use crate::domain::instance::InstanceId;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WinnerRecord {
    pub instance_id: InstanceId,
    pub candidate: Candidate,
    pub fitness: f64,
    pub cycle_id: String,
    pub promoted_at: DateTime<Utc>,
}

impl WinnerRecord {
    pub fn new(candidate: Candidate, fitness: f64, cycle_id: &str, promoted_at: DateTime<Utc>) -> Self {
        Self {
            instance_id: InstanceId::for_candidate(&candidate.id),
            candidate,
            fitness,
            cycle_id: cycle_id.to_string(),
            promoted_at,
        }
    }
}

#[derive(Debug)]
pub struct WinnersLedger {
    log: JsonlLog<WinnerRecord>,
}

impl WinnersLedger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            log: JsonlLog::new(path),
        }
    }

    pub fn append(&self, record: &WinnerRecord) -> Result<()> {
        Ok(self.log.append(record)?)
    }

    pub fn all(&self) -> Result<Vec<WinnerRecord>> {
        Ok(self.log.read_all()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::candidate::CandidateOrigin;
    use crate::domain::search_space::Params;

    #[test]
    fn append_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = WinnersLedger::new(dir.path().join("winners.jsonl"));
        let c = Candidate::new(Params::new(), 1, None, CandidateOrigin::Random, Utc::now());
        let rec = WinnerRecord::new(c.clone(), 0.8, "cycle-1", Utc::now());
        ledger.append(&rec).unwrap();

        let all = ledger.all().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].instance_id, InstanceId::for_candidate(&c.id));
        assert_eq!(all[0].fitness, 0.8);
    }
}
