//! Shared fixtures: a scripted workload whose results follow the candidate's
//! parameters, and helpers to spawn real instances into a temp directory.

#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};

use crucible_core::domain::search_space::ParamSpec;
use crucible_core::{
    Candidate, CandidateOrigin, CrucibleConfig, EvalContext, Instance, InstanceStore,
    LineageSigner, ManualClock, ParamValue, Params, SearchSpace, Workload, WorkloadFailure,
    WorkloadReport,
};

pub const LINEAGE_KEY_HEX: &str = "00112233445566778899aabbccddeeff";

/// Results are driven by the instance's parameters:
/// - `quality` (int, default 50): `passed = quality`, `failed = 100 - quality`
/// - `sleep_ms` (int): delay before reporting, on tokio time
/// - `oom` (bool): report resource exhaustion
///
/// With a clock attached, every run advances it by `advance`.
#[derive(Default)]
pub struct ScriptedWorkload {
    pub runs: AtomicUsize,
    pub clock: Option<Arc<ManualClock>>,
    pub advance: Option<Duration>,
}

impl ScriptedWorkload {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advancing(clock: Arc<ManualClock>, by: Duration) -> Self {
        Self {
            runs: AtomicUsize::new(0),
            clock: Some(clock),
            advance: Some(by),
        }
    }

    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }
}

fn int_param(params: &Params, name: &str) -> Option<i64> {
    match params.get(name) {
        Some(ParamValue::Int(i)) => Some(*i),
        _ => None,
    }
}

#[async_trait]
impl Workload for ScriptedWorkload {
    async fn run(
        &self,
        instance: &Instance,
        _context: &EvalContext,
    ) -> Result<WorkloadReport, WorkloadFailure> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        let params = &instance.candidate.params;
        if let Some(ms) = int_param(params, "sleep_ms") {
            tokio::time::sleep(std::time::Duration::from_millis(ms as u64)).await;
        }
        if let (Some(clock), Some(by)) = (&self.clock, self.advance) {
            clock.advance(by);
        }
        if matches!(params.get("oom"), Some(ParamValue::Bool(true))) {
            return Err(WorkloadFailure::ResourceExhausted("out of memory".into()));
        }
        let quality = int_param(params, "quality").unwrap_or(50).clamp(0, 100) as u64;
        Ok(WorkloadReport {
            passed: quality,
            failed: 100 - quality,
            mean_latency_ms: 100.0,
            stability: 1.0,
            peak_rss_bytes: None,
        })
    }
}

pub fn params(pairs: &[(&str, ParamValue)]) -> Params {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

pub fn quality(q: i64) -> Params {
    params(&[("quality", ParamValue::Int(q))])
}

pub fn store(root: &Path) -> InstanceStore {
    InstanceStore::new(
        root.join("instances"),
        LineageSigner::from_hex(LINEAGE_KEY_HEX).unwrap(),
    )
}

pub fn spawn(store: &InstanceStore, params: Params) -> Instance {
    let now = Utc::now();
    let candidate = Candidate::new(params, 0, None, CandidateOrigin::Seeded, now);
    store.spawn(&candidate, now).unwrap()
}

/// 02:00 UTC on a fixed date; inside the default 02:00-05:00 window.
pub fn window_open() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 10, 2, 0, 0).unwrap()
}

/// Config rooted at `root`: one `quality` parameter, a fixed RNG seed, a
/// seeded perfect candidate and a small validation plan.
pub fn config(root: &Path) -> CrucibleConfig {
    let mut cfg = CrucibleConfig {
        root: root.to_path_buf(),
        search_space: SearchSpace::new().with("quality", ParamSpec::IntRange { min: 0, max: 100 }),
        ..CrucibleConfig::default()
    };
    cfg.generator.population = 4;
    cfg.generator.seed = Some(7);
    cfg.generator.seeds = vec![quality(100)];
    cfg.evaluator.timeout_secs = 30;
    cfg.validator.epochs = 1;
    cfg.validator.slices = 2;
    cfg.validator.replicas = 1;
    cfg.validator.unit_timeout_secs = 30;
    cfg.lineage.key_hex = Some(LINEAGE_KEY_HEX.to_string());
    cfg
}
