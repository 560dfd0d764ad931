//! Stage pipeline as a [`Workload`].

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crucible_core::{
    CrucibleConfig, EvalContext, Instance, Workload, WorkloadFailure, WorkloadReport,
};

use crate::error::{Result, WorkloadRunError};
use crate::report::{judge, StageCounts, StageVerdict};
use crate::runner::{StageResult, StageRunner};
use crate::spec::WorkloadSpec;

/// Runs the configured stages in order inside the instance directory and
/// folds their output into one [`WorkloadReport`].
///
/// Any stage that cannot start or overruns its own timeout makes the whole
/// run invalid. An OOM-looking stage makes it resource-exhausted. A failing
/// exit code only costs the stage's tests.
#[derive(Debug, Clone)]
pub struct CommandWorkload {
    spec: WorkloadSpec,
    digest: String,
}

impl CommandWorkload {
    pub fn new(spec: WorkloadSpec) -> Result<Self> {
        spec.validate()?;
        let digest = spec.digest();
        Ok(Self { spec, digest })
    }

    /// Build from the `[workload]` section of the loaded config.
    pub fn from_config(config: &CrucibleConfig) -> Result<Self> {
        Self::new(WorkloadSpec::from_value(&config.workload)?)
    }

    pub fn spec(&self) -> &WorkloadSpec {
        &self.spec
    }

    pub fn digest(&self) -> &str {
        &self.digest
    }

    async fn run_stages(
        &self,
        instance: &Instance,
        context: &EvalContext,
    ) -> std::result::Result<Vec<(StageResult, StageCounts)>, WorkloadFailure> {
        let runner = StageRunner::new(instance, context, &self.spec.env);
        let mut finished = Vec::new();

        for stage in self.spec.stages_for(context) {
            let result = runner
                .execute_stage(stage)
                .await
                .map_err(|e| stage_failure(&instance.id.to_string(), e))?;

            match judge(
                stage.output,
                result.exit_code,
                result.signal,
                &result.combined_output(),
            ) {
                StageVerdict::OutOfMemory(how) => {
                    warn!(
                        instance = %instance.id,
                        stage = %stage.name,
                        how = %how,
                        "stage ran out of memory"
                    );
                    return Err(WorkloadFailure::ResourceExhausted(format!(
                        "stage {}: {how}",
                        stage.name
                    )));
                }
                StageVerdict::Counted(counts) => {
                    debug!(
                        instance = %instance.id,
                        stage = %stage.name,
                        passed = counts.passed,
                        failed = counts.failed,
                        "stage counted"
                    );
                    finished.push((result, counts));
                }
            }
        }
        Ok(finished)
    }
}

fn stage_failure(instance: &str, err: WorkloadRunError) -> WorkloadFailure {
    warn!(instance = %instance, error = %err, "stage could not complete");
    WorkloadFailure::Invalid(err.to_string())
}

/// Fold per-stage results into one report.
///
/// Latency is the mean of reported `latency_ms` facts, or wall time per
/// test when no stage reports one. Stability is the mean of reported
/// `stability` facts, or the fraction of stages that exited 0.
pub fn aggregate(stages: &[(StageResult, StageCounts)]) -> WorkloadReport {
    let passed: u64 = stages.iter().map(|(_, c)| c.passed).sum();
    let failed: u64 = stages.iter().map(|(_, c)| c.failed).sum();

    let latencies: Vec<f64> = stages.iter().filter_map(|(_, c)| c.latency_ms).collect();
    let mean_latency_ms = if latencies.is_empty() {
        let wall: u64 = stages.iter().map(|(r, _)| r.duration_ms).sum();
        wall as f64 / (passed + failed).max(1) as f64
    } else {
        latencies.iter().sum::<f64>() / latencies.len() as f64
    };

    let reported: Vec<f64> = stages.iter().filter_map(|(_, c)| c.stability).collect();
    let stability = if !reported.is_empty() {
        reported.iter().sum::<f64>() / reported.len() as f64
    } else if stages.is_empty() {
        0.0
    } else {
        let clean = stages.iter().filter(|(r, _)| r.passed()).count();
        clean as f64 / stages.len() as f64
    };

    WorkloadReport {
        passed,
        failed,
        mean_latency_ms,
        stability,
        peak_rss_bytes: stages.iter().filter_map(|(_, c)| c.peak_rss_bytes).max(),
    }
}

#[async_trait]
impl Workload for CommandWorkload {
    async fn run(
        &self,
        instance: &Instance,
        context: &EvalContext,
    ) -> std::result::Result<WorkloadReport, WorkloadFailure> {
        let stages = self.run_stages(instance, context).await?;
        let report = aggregate(&stages);
        info!(
            instance = %instance.id,
            workload = %&self.digest[..12],
            stages = stages.len(),
            passed = report.passed,
            failed = report.failed,
            "workload finished"
        );
        Ok(report)
    }
}
