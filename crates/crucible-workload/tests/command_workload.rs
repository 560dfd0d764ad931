//! Command stages run against real instance directories.

use std::sync::Arc;

use chrono::Utc;
use crucible_core::config::EvaluatorConfig;
use crucible_core::{
    Candidate, CandidateOrigin, EvalContext, EvaluationStatus, FitnessEvaluator, Instance,
    InstanceStore, LineageSigner, ParamValue, Params, Workload, WorkloadFailure,
};
use crucible_workload::{CommandWorkload, OutputFormat, StageConfig, WorkloadSpec};

fn instance(root: &std::path::Path, quality: i64) -> Instance {
    let store = InstanceStore::new(
        root.join("instances"),
        LineageSigner::from_hex("00112233445566778899aabbccddeeff").unwrap(),
    );
    let mut params = Params::new();
    params.insert("quality".to_string(), ParamValue::Int(quality));
    let candidate = Candidate::new(params, 0, None, CandidateOrigin::Seeded, Utc::now());
    store.spawn(&candidate, Utc::now()).unwrap()
}

fn workload(stages: Vec<StageConfig>) -> CommandWorkload {
    CommandWorkload::new(WorkloadSpec::new(stages)).unwrap()
}

fn matched() -> EvalContext {
    EvalContext::Match { round: 0 }
}

#[tokio::test]
async fn parameters_reach_the_stage_and_counts_come_back() {
    let dir = tempfile::tempdir().unwrap();
    let inst = instance(dir.path(), 70);
    let w = workload(vec![StageConfig::shell(
        "bench",
        r#"echo "passed=$CRUCIBLE_PARAM_QUALITY failed=$((100 - CRUCIBLE_PARAM_QUALITY))"; echo latency_ms=12.5"#,
        10,
    )]);

    let report = w.run(&inst, &matched()).await.unwrap();
    assert_eq!(report.passed, 70);
    assert_eq!(report.failed, 30);
    assert!((report.mean_latency_ms - 12.5).abs() < 1e-9);
    assert!((report.stability - 1.0).abs() < 1e-9);
}

#[tokio::test]
async fn stages_run_inside_the_instance_directory() {
    let dir = tempfile::tempdir().unwrap();
    let inst = instance(dir.path(), 50);
    std::fs::write(inst.path.join("marker.txt"), "here").unwrap();
    let w = workload(vec![StageConfig::shell(
        "cwd",
        r#"test -f marker.txt && test "$CRUCIBLE_UNIT" = "match-r0""#,
        10,
    )
    .with_output(OutputFormat::ExitCode)]);

    let report = w.run(&inst, &matched()).await.unwrap();
    assert_eq!((report.passed, report.failed), (1, 0));
}

#[tokio::test]
async fn relative_program_resolves_against_the_instance() {
    let dir = tempfile::tempdir().unwrap();
    let inst = instance(dir.path(), 50);
    let script = inst.path.join("bench.sh");
    std::fs::write(&script, "#!/bin/sh\necho 'test result: ok. 3 passed; 1 failed; 0 ignored'\n")
        .unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
    }
    let w = workload(vec![StageConfig::custom(
        "bench",
        vec!["./bench.sh".to_string()],
        10,
    )]);

    let report = w.run(&inst, &matched()).await.unwrap();
    assert_eq!((report.passed, report.failed), (3, 1));
}

#[tokio::test]
async fn failing_stage_costs_its_tests_only() {
    let dir = tempfile::tempdir().unwrap();
    let inst = instance(dir.path(), 50);
    let w = workload(vec![
        StageConfig::shell("good", "echo passed=4 failed=0", 10),
        StageConfig::shell("bad", "exit 2", 10),
    ]);

    let report = w.run(&inst, &matched()).await.unwrap();
    assert_eq!((report.passed, report.failed), (4, 1));
    assert!((report.stability - 0.5).abs() < 1e-9);
}

#[tokio::test]
async fn killed_stage_is_resource_exhaustion() {
    let dir = tempfile::tempdir().unwrap();
    let inst = instance(dir.path(), 50);
    let w = workload(vec![
        StageConfig::shell("oom", "kill -9 $$", 10),
        StageConfig::shell("never", "echo passed=1 failed=0", 10),
    ]);

    let err = w.run(&inst, &matched()).await.unwrap_err();
    assert!(matches!(err, WorkloadFailure::ResourceExhausted(_)), "{err}");
}

#[tokio::test]
async fn stage_timeout_invalidates_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let inst = instance(dir.path(), 50);
    let w = workload(vec![StageConfig::shell("hang", "sleep 30", 1)]);

    let started = std::time::Instant::now();
    let err = w.run(&inst, &matched()).await.unwrap_err();
    assert!(matches!(err, WorkloadFailure::Invalid(_)), "{err}");
    assert!(started.elapsed() < std::time::Duration::from_secs(10));
}

#[tokio::test]
async fn missing_program_invalidates_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let inst = instance(dir.path(), 50);
    let w = workload(vec![StageConfig::custom(
        "missing",
        vec!["./does-not-exist.sh".to_string()],
        10,
    )]);

    let err = w.run(&inst, &matched()).await.unwrap_err();
    assert!(matches!(err, WorkloadFailure::Invalid(_)), "{err}");
}

#[tokio::test]
async fn validation_only_stages_join_validation_units() {
    let dir = tempfile::tempdir().unwrap();
    let inst = instance(dir.path(), 50);
    let w = workload(vec![
        StageConfig::shell("bench", "echo passed=2 failed=0", 10),
        StageConfig::shell(
            "soak",
            r#"test "$CRUCIBLE_SOAK_SPAN_SECS" = "3600""#,
            10,
        )
        .validation_only(),
    ]);

    let report = w.run(&inst, &matched()).await.unwrap();
    assert_eq!((report.passed, report.failed), (2, 0));

    let unit = EvalContext::Validation {
        epoch: 0,
        slice: 1,
        replica: 0,
        soak_span_secs: 3600,
    };
    let report = w.run(&inst, &unit).await.unwrap();
    assert_eq!((report.passed, report.failed), (3, 0));
}

#[tokio::test]
async fn evaluator_timeout_kills_a_hanging_stage() {
    let dir = tempfile::tempdir().unwrap();
    let inst = instance(dir.path(), 50);
    let marker = dir.path().join("finished");
    let script = format!("sleep 3; touch {}", marker.display());
    let w: Arc<dyn Workload> = Arc::new(workload(vec![StageConfig::shell("slow", &script, 0)]));

    let cfg = EvaluatorConfig {
        timeout_secs: 1,
        ..EvaluatorConfig::default()
    };
    let result = FitnessEvaluator::new(w, &cfg)
        .evaluate(&inst, &matched())
        .await;
    assert_eq!(result.status, EvaluationStatus::Timeout);
    assert!(result.fitness < 0.0);

    // The dropped child was killed, so the marker never appears.
    tokio::time::sleep(std::time::Duration::from_secs(4)).await;
    assert!(!marker.exists());
}
