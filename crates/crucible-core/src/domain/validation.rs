//! Sequential validation records.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::candidate::Candidate;
use crate::domain::evaluation::EvaluationStatus;
use crate::domain::instance::InstanceId;

/// One epoch × slice × replica execution unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ValidationUnit {
    pub epoch: u32,
    pub slice: u32,
    pub replica: u32,
}

impl ValidationUnit {
    /// All units of a plan in execution order.
    pub fn plan(epochs: u32, slices: u32, replicas: u32) -> Vec<ValidationUnit> {
        let mut units = Vec::with_capacity((epochs * slices * replicas) as usize);
        for epoch in 0..epochs {
            for slice in 0..slices {
                for replica in 0..replicas {
                    units.push(ValidationUnit {
                        epoch,
                        slice,
                        replica,
                    });
                }
            }
        }
        units
    }
}

impl fmt::Display for ValidationUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "e{}s{}r{}", self.epoch, self.slice, self.replica)
    }
}

/// Result of one executed unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitOutcome {
    pub unit: ValidationUnit,
    pub passed: u64,
    pub failed: u64,
    pub status: EvaluationStatus,
    pub duration_ms: u64,
    pub mean_latency_ms: Option<f64>,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Pass,
    Fail,
    Inconclusive,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Verdict::Pass => "pass",
            Verdict::Fail => "fail",
            Verdict::Inconclusive => "inconclusive",
        })
    }
}

/// A metric that moved past the allowed regression against its baseline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Regression {
    pub metric: String,
    pub baseline: f64,
    pub observed: f64,
    pub delta: f64,
}

/// Completed validation pass over one champion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationRun {
    pub instance_id: InstanceId,
    pub epochs: u32,
    pub slices: u32,
    pub replicas: u32,
    pub units: Vec<UnitOutcome>,
    pub passed: u64,
    pub failed: u64,
    /// Units that timed out, exhausted resources or were invalid.
    pub failed_units: u32,
    pub failure_rate: f64,
    pub mean_latency_ms: Option<f64>,
    pub regressions: Vec<Regression>,
    pub verdict: Verdict,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Durable progress of an interrupted validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationCheckpoint {
    pub instance_id: InstanceId,
    pub epochs: u32,
    pub slices: u32,
    pub replicas: u32,
    pub completed: Vec<UnitOutcome>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Proof that an instance passed sequential validation.
///
/// Only the validator can construct one, and the promotion pipeline only
/// accepts this type, so no promotion record can exist for an instance that
/// did not pass.
#[derive(Debug, Clone)]
pub struct ValidatedChampion {
    instance_id: InstanceId,
    candidate: Candidate,
    manifest_digest: String,
    fitness: f64,
    run: ValidationRun,
}

impl ValidatedChampion {
    pub(crate) fn new(
        instance_id: InstanceId,
        candidate: Candidate,
        manifest_digest: String,
        fitness: f64,
        run: ValidationRun,
    ) -> Self {
        Self {
            instance_id,
            candidate,
            manifest_digest,
            fitness,
            run,
        }
    }

    pub fn instance_id(&self) -> &InstanceId {
        &self.instance_id
    }

    pub fn candidate(&self) -> &Candidate {
        &self.candidate
    }

    pub fn manifest_digest(&self) -> &str {
        &self.manifest_digest
    }

    pub fn fitness(&self) -> f64 {
        self.fitness
    }

    pub fn run(&self) -> &ValidationRun {
        &self.run
    }
}

/// What a validator call produced.
#[derive(Debug, Clone)]
pub enum ValidationOutcome {
    /// All units ran. `champion` is set only for a passing verdict.
    Completed {
        run: ValidationRun,
        champion: Option<ValidatedChampion>,
    },
    /// The maintenance window closed; progress is checkpointed.
    Suspended {
        instance_id: InstanceId,
        completed: usize,
        total: usize,
    },
}
