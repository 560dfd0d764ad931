//! Fitness Evaluator.
//!
//! Runs the workload against an instance under a hard wall-clock timeout
//! and reduces the report to one bounded fitness score. Timeouts, resource
//! exhaustion and runs that executed nothing are disqualified with
//! [`DISQUALIFIED_FITNESS`]; partial counts are kept for the audit trail but
//! never scored.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use crate::audit::{AuditEntry, AuditLog};
use crate::config::EvaluatorConfig;
use crate::domain::evaluation::{
    EvalContext, EvaluationResult, EvaluationStatus, FitnessWeights, WorkloadFailure,
    WorkloadReport, DISQUALIFIED_FITNESS,
};
use crate::domain::instance::Instance;
use crate::metrics::METRICS;
use crate::obs;

/// The measurement run behind an evaluation.
///
/// Implementations must stop all child work when the returned future is
/// dropped; the evaluator enforces its timeout by dropping it.
#[async_trait]
pub trait Workload: Send + Sync {
    async fn run(
        &self,
        instance: &Instance,
        context: &EvalContext,
    ) -> std::result::Result<WorkloadReport, WorkloadFailure>;
}

/// Weighted score in `[0, 1]`.
pub fn score(report: &WorkloadReport, weights: &FitnessWeights, latency_budget_ms: f64) -> f64 {
    let total = report.passed + report.failed;
    let pass_rate = if total == 0 {
        0.0
    } else {
        report.passed as f64 / total as f64
    };
    let latency_term = if latency_budget_ms > 0.0 && report.mean_latency_ms.is_finite() {
        1.0 - (report.mean_latency_ms.max(0.0) / latency_budget_ms).min(1.0)
    } else {
        0.0
    };
    let stability = if report.stability.is_finite() {
        report.stability.clamp(0.0, 1.0)
    } else {
        0.0
    };
    weights.pass_rate * pass_rate + weights.latency * latency_term + weights.stability * stability
}

pub struct FitnessEvaluator {
    workload: Arc<dyn Workload>,
    timeout: Duration,
    weights: FitnessWeights,
    latency_budget_ms: f64,
    audit: Option<(Arc<AuditLog>, String)>,
}

impl FitnessEvaluator {
    pub fn new(workload: Arc<dyn Workload>, config: &EvaluatorConfig) -> Self {
        Self {
            workload,
            timeout: config.timeout(),
            weights: config.weights,
            latency_budget_ms: config.latency_budget_ms,
            audit: None,
        }
    }

    /// Record one audit line per evaluation under `cycle_id`.
    pub fn with_audit(mut self, audit: Arc<AuditLog>, cycle_id: &str) -> Self {
        self.audit = Some((audit, cycle_id.to_string()));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Evaluate with the configured timeout.
    pub async fn evaluate(&self, instance: &Instance, context: &EvalContext) -> EvaluationResult {
        self.evaluate_within(instance, context, self.timeout).await
    }

    /// Evaluate with an explicit timeout (validation units use their own).
    pub async fn evaluate_within(
        &self,
        instance: &Instance,
        context: &EvalContext,
        timeout: Duration,
    ) -> EvaluationResult {
        let started = tokio::time::Instant::now();
        let outcome = tokio::time::timeout(timeout, self.workload.run(instance, context)).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let disqualified = |status: EvaluationStatus, detail: String| EvaluationResult {
            instance_id: instance.id.clone(),
            passed: 0,
            failed: 0,
            duration_ms,
            mean_latency_ms: None,
            peak_rss_bytes: None,
            fitness: DISQUALIFIED_FITNESS,
            status,
            detail: Some(detail),
        };

        let result = match outcome {
            Err(_) => disqualified(
                EvaluationStatus::Timeout,
                format!("exceeded {}s", timeout.as_secs_f64()),
            ),
            Ok(Err(WorkloadFailure::ResourceExhausted(detail))) => {
                disqualified(EvaluationStatus::ResourceExhausted, detail)
            }
            Ok(Err(WorkloadFailure::Invalid(detail))) => {
                disqualified(EvaluationStatus::Invalid, detail)
            }
            Ok(Ok(report)) if report.passed + report.failed == 0 => {
                let mut r = disqualified(
                    EvaluationStatus::Invalid,
                    "workload executed no tests".to_string(),
                );
                r.peak_rss_bytes = report.peak_rss_bytes;
                r
            }
            Ok(Ok(report)) => EvaluationResult {
                instance_id: instance.id.clone(),
                passed: report.passed,
                failed: report.failed,
                duration_ms,
                mean_latency_ms: Some(report.mean_latency_ms),
                peak_rss_bytes: report.peak_rss_bytes,
                fitness: score(&report, &self.weights, self.latency_budget_ms),
                status: EvaluationStatus::Ok,
                detail: None,
            },
        };

        METRICS.inc_evaluations();
        if result.is_disqualified() {
            METRICS.inc_disqualifications();
        }
        obs::emit_evaluation_finished(
            instance.id.as_str(),
            result.status.as_str(),
            result.fitness,
            result.duration_ms,
        );
        if let Some((audit, cycle_id)) = &self.audit {
            audit.record(
                Some(cycle_id),
                Utc::now(),
                AuditEntry::Evaluation {
                    params: instance.candidate.params.clone(),
                    result: result.clone(),
                },
            );
        }
        result
    }
}
