//! Evaluation results and the workload report they are scored from.

use serde::{Deserialize, Serialize};

use crate::domain::error::{CrucibleError, Result};
use crate::domain::instance::InstanceId;

/// Fitness assigned to timed-out, exhausted or invalid evaluations. Every
/// scored fitness lies in `[0, 1]`, so the sentinel always loses.
pub const DISQUALIFIED_FITNESS: f64 = -1.0;

/// Outcome class of one evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluationStatus {
    Ok,
    Timeout,
    ResourceExhausted,
    Invalid,
}

impl EvaluationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            EvaluationStatus::Ok => "ok",
            EvaluationStatus::Timeout => "timeout",
            EvaluationStatus::ResourceExhausted => "resource_exhausted",
            EvaluationStatus::Invalid => "invalid",
        }
    }

    pub fn is_disqualifying(self) -> bool {
        self != EvaluationStatus::Ok
    }
}

/// Scored result of running the workload against one instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationResult {
    pub instance_id: InstanceId,
    pub passed: u64,
    pub failed: u64,
    pub duration_ms: u64,
    pub mean_latency_ms: Option<f64>,
    pub peak_rss_bytes: Option<u64>,
    pub fitness: f64,
    pub status: EvaluationStatus,
    pub detail: Option<String>,
}

impl EvaluationResult {
    pub fn is_disqualified(&self) -> bool {
        self.status.is_disqualifying()
    }

    pub fn pass_rate(&self) -> Option<f64> {
        let total = self.passed + self.failed;
        (total > 0).then(|| self.passed as f64 / total as f64)
    }
}

/// Raw facts a workload reports for one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkloadReport {
    pub passed: u64,
    pub failed: u64,
    /// Mean latency of the measured operations.
    pub mean_latency_ms: f64,
    /// Stability fact in `[0, 1]` (clamped when scored).
    pub stability: f64,
    pub peak_rss_bytes: Option<u64>,
}

/// Workload failures that disqualify rather than score.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum WorkloadFailure {
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),
    #[error("invalid run: {0}")]
    Invalid(String),
}

/// What an evaluation is for. Workloads may scale their effort by it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum EvalContext {
    Match {
        round: usize,
    },
    Validation {
        epoch: u32,
        slice: u32,
        replica: u32,
        /// Wall-clock span of production use this unit stands in for.
        soak_span_secs: u64,
    },
}

/// Evaluator weights over the three normalized fitness facts.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FitnessWeights {
    pub pass_rate: f64,
    pub latency: f64,
    pub stability: f64,
}

impl Default for FitnessWeights {
    fn default() -> Self {
        Self {
            pass_rate: 0.6,
            latency: 0.25,
            stability: 0.15,
        }
    }
}

impl FitnessWeights {
    /// Weights must be non-negative, finite, and sum to 1.
    pub fn validate(&self) -> Result<()> {
        let all = [self.pass_rate, self.latency, self.stability];
        if all.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(CrucibleError::InvalidConfig(format!(
                "evaluator.weights must be non-negative: {all:?}"
            )));
        }
        let sum: f64 = all.iter().sum();
        if (sum - 1.0).abs() > 1e-6 {
            return Err(CrucibleError::InvalidConfig(format!(
                "evaluator.weights must sum to 1, got {sum}"
            )));
        }
        Ok(())
    }
}
