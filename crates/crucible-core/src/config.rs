//! `crucible.toml` schema.
//!
//! Every section has defaults, so an empty file plus a `[search_space]` is a
//! valid configuration. [`CrucibleConfig::load`] applies environment
//! overrides and validates before returning, so out-of-range values are
//! rejected at load time rather than mid-cycle.

use std::path::{Path, PathBuf};

use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::domain::error::{CrucibleError, Result};
use crate::domain::evaluation::FitnessWeights;
use crate::domain::search_space::{Params, SearchSpace};
use crate::generator::GenerationPolicy;
use crate::window::MaintenanceWindow;

pub const DEFAULT_CONFIG_FILE: &str = "crucible.toml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CrucibleConfig {
    /// Directory holding instances, promotions, leases and logs.
    pub root: PathBuf,
    pub search_space: SearchSpace,
    pub generator: GeneratorConfig,
    pub evaluator: EvaluatorConfig,
    /// Opaque workload description, interpreted by the workload crate.
    pub workload: serde_json::Value,
    pub tournament: TournamentConfig,
    pub retention: RetentionConfig,
    pub validator: ValidatorConfig,
    pub promotion: PromotionConfig,
    pub escalation: EscalationConfig,
    pub maintenance: MaintenanceConfig,
    pub locks: LockConfig,
    pub lineage: LineageConfig,
}

impl Default for CrucibleConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from(".crucible"),
            search_space: SearchSpace::default(),
            generator: GeneratorConfig::default(),
            evaluator: EvaluatorConfig::default(),
            workload: serde_json::Value::Null,
            tournament: TournamentConfig::default(),
            retention: RetentionConfig::default(),
            validator: ValidatorConfig::default(),
            promotion: PromotionConfig::default(),
            escalation: EscalationConfig::default(),
            maintenance: MaintenanceConfig::default(),
            locks: LockConfig::default(),
            lineage: LineageConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GeneratorConfig {
    /// Candidates per cycle.
    pub population: usize,
    pub policy: GenerationPolicy,
    /// Fixed RNG seed for reproducible cycles.
    pub seed: Option<u64>,
    /// Parameter sets entered into every cycle alongside generated ones.
    pub seeds: Vec<Params>,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            population: 8,
            policy: GenerationPolicy::MutationBiased {
                top_k: 3,
                mutation_rate: 0.3,
            },
            seed: None,
            seeds: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EvaluatorConfig {
    /// Hard wall-clock cap per evaluation.
    pub timeout_secs: u64,
    /// Latency at or above which the latency fact scores 0.
    pub latency_budget_ms: f64,
    pub weights: FitnessWeights,
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 300,
            latency_budget_ms: 1_000.0,
            weights: FitnessWeights::default(),
        }
    }
}

impl EvaluatorConfig {
    pub fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TournamentConfig {
    /// Matches run at once within a round.
    pub concurrency: usize,
    /// `false` selects the legacy fully-sequential bracket.
    pub parallel: bool,
}

impl Default for TournamentConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            parallel: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetentionConfig {
    pub max_instances: usize,
    pub max_age_days: u32,
    pub min_free_bytes: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            max_instances: 32,
            max_age_days: 14,
            min_free_bytes: 1 << 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ValidatorConfig {
    pub epochs: u32,
    pub slices: u32,
    pub replicas: u32,
    pub unit_timeout_secs: u64,
    /// Production time the whole pass stands in for.
    pub simulated_soak_hours: f64,
    pub max_failure_rate: f64,
    /// Units allowed to time out or exhaust resources.
    pub max_failed_units: u32,
    pub max_regression: f64,
    pub baseline_days: u32,
    /// How often to retry the `validator` lease while another process holds it.
    pub lease_poll_secs: u64,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            epochs: 2,
            slices: 3,
            replicas: 2,
            unit_timeout_secs: 600,
            simulated_soak_hours: 24.0,
            max_failure_rate: 0.05,
            max_failed_units: 0,
            max_regression: 0.10,
            baseline_days: 7,
            lease_poll_secs: 5,
        }
    }
}

impl ValidatorConfig {
    pub fn total_units(&self) -> usize {
        (self.epochs * self.slices * self.replicas) as usize
    }

    /// Soak span each slice simulates.
    pub fn soak_span_secs(&self) -> u64 {
        let slices = (self.epochs * self.slices).max(1) as f64;
        (self.simulated_soak_hours * 3600.0 / slices).round() as u64
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PromotionConfig {
    pub ack_deadline_secs: u64,
    pub poll_interval_secs: u64,
}

impl Default for PromotionConfig {
    fn default() -> Self {
        Self {
            ack_deadline_secs: 3600,
            poll_interval_secs: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EscalationConfig {
    /// Occurrences within `window_hours` that arm a flag.
    pub threshold: u32,
    pub window_hours: u32,
    pub ttl_hours: u32,
    pub baseline_days: u32,
    /// An observation counts when severity >= baseline mean * (1 + tolerance).
    pub severity_tolerance: f64,
    pub nightly_cycle_budget: u32,
    pub nightly_minutes: u32,
    pub cooldown_minutes: u32,
    pub tick_secs: u64,
    pub symptoms_per_tick: usize,
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            threshold: 3,
            window_hours: 24,
            ttl_hours: 72,
            baseline_days: 7,
            severity_tolerance: 0.25,
            nightly_cycle_budget: 2,
            nightly_minutes: 180,
            cooldown_minutes: 90,
            tick_secs: 60,
            symptoms_per_tick: 256,
        }
    }
}

impl EscalationConfig {
    pub fn window(&self) -> Duration {
        Duration::hours(i64::from(self.window_hours))
    }

    pub fn ttl(&self) -> Duration {
        Duration::hours(i64::from(self.ttl_hours))
    }

    pub fn cooldown(&self) -> Duration {
        Duration::minutes(i64::from(self.cooldown_minutes))
    }

    pub fn baseline_span(&self) -> Duration {
        Duration::days(i64::from(self.baseline_days))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MaintenanceConfig {
    /// `HH:MM` UTC.
    pub start: String,
    /// `HH:MM` UTC; earlier than `start` wraps midnight.
    pub end: String,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            start: "02:00".to_string(),
            end: "05:00".to_string(),
        }
    }
}

impl MaintenanceConfig {
    pub fn window(&self) -> Result<MaintenanceWindow> {
        MaintenanceWindow::parse(&self.start, &self.end)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LockConfig {
    pub cycle_ttl_secs: i64,
    pub validator_ttl_secs: i64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            cycle_ttl_secs: 4 * 3600,
            validator_ttl_secs: 1800,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LineageConfig {
    /// Hex HMAC key. When absent, `<root>/lineage.key` is created on first use.
    pub key_hex: Option<String>,
}

impl CrucibleConfig {
    /// Read `path`, apply `CRUCIBLE_*` overrides from the process
    /// environment, and validate.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            CrucibleError::InvalidConfig(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_toml_with_env(&raw, |k| std::env::var(k).ok())
    }

    /// Parse `raw`, apply overrides from `env`, and validate.
    pub fn from_toml_with_env(raw: &str, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config: CrucibleConfig =
            toml::from_str(raw).map_err(|e| CrucibleError::InvalidConfig(e.to_string()))?;
        config.apply_env(env)?;
        config.validate()?;
        Ok(config)
    }

    /// Environment-level switches. Unparsable values are errors.
    pub fn apply_env(&mut self, env: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(v) = env("CRUCIBLE_PARALLEL_BRACKET") {
            self.tournament.parallel = parse_switch("CRUCIBLE_PARALLEL_BRACKET", &v)?;
        }
        if let Some(v) = env("CRUCIBLE_AUTONOMY_THRESHOLD") {
            self.escalation.threshold = parse_num("CRUCIBLE_AUTONOMY_THRESHOLD", &v)?;
        }
        if let Some(v) = env("CRUCIBLE_NIGHTLY_BUDGET") {
            self.escalation.nightly_cycle_budget = parse_num("CRUCIBLE_NIGHTLY_BUDGET", &v)?;
        }
        if let Some(v) = env("CRUCIBLE_COOLDOWN_MINUTES") {
            self.escalation.cooldown_minutes = parse_num("CRUCIBLE_COOLDOWN_MINUTES", &v)?;
        }
        if let Some(v) = env("CRUCIBLE_LINEAGE_KEY") {
            self.lineage.key_hex = Some(v.trim().to_string());
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let bad = |msg: String| Err(CrucibleError::InvalidConfig(msg));

        self.search_space.validate()?;
        self.evaluator.weights.validate()?;
        self.maintenance.window()?;

        if self.generator.population == 0 {
            return bad("generator.population must be at least 1".into());
        }
        if let GenerationPolicy::MutationBiased {
            top_k,
            mutation_rate,
        } = self.generator.policy
        {
            if top_k == 0 {
                return bad("generator.policy.top_k must be at least 1".into());
            }
            if !(0.0..=1.0).contains(&mutation_rate) {
                return bad(format!(
                    "generator.policy.mutation_rate {mutation_rate} outside [0, 1]"
                ));
            }
        }
        if self.evaluator.timeout_secs == 0 {
            return bad("evaluator.timeout_secs must be positive".into());
        }
        if !(self.evaluator.latency_budget_ms > 0.0) {
            return bad("evaluator.latency_budget_ms must be positive".into());
        }
        if self.tournament.concurrency == 0 {
            return bad("tournament.concurrency must be at least 1".into());
        }
        if self.retention.max_instances == 0 {
            return bad("retention.max_instances must be at least 1".into());
        }
        let v = &self.validator;
        if v.epochs == 0 || v.slices == 0 || v.replicas == 0 {
            return bad("validator epochs, slices and replicas must all be at least 1".into());
        }
        if v.unit_timeout_secs == 0 {
            return bad("validator.unit_timeout_secs must be positive".into());
        }
        if !(0.0..=1.0).contains(&v.max_failure_rate) {
            return bad(format!(
                "validator.max_failure_rate {} outside [0, 1]",
                v.max_failure_rate
            ));
        }
        if !(v.max_regression >= 0.0) {
            return bad("validator.max_regression must be non-negative".into());
        }
        if !(v.simulated_soak_hours > 0.0) {
            return bad("validator.simulated_soak_hours must be positive".into());
        }
        if self.promotion.poll_interval_secs == 0 {
            return bad("promotion.poll_interval_secs must be positive".into());
        }
        let e = &self.escalation;
        if e.threshold == 0 {
            return bad("escalation.threshold must be at least 1".into());
        }
        if e.window_hours == 0 || e.ttl_hours == 0 {
            return bad("escalation.window_hours and ttl_hours must be positive".into());
        }
        if !(e.severity_tolerance >= 0.0) {
            return bad("escalation.severity_tolerance must be non-negative".into());
        }
        if e.tick_secs == 0 || e.symptoms_per_tick == 0 {
            return bad("escalation.tick_secs and symptoms_per_tick must be positive".into());
        }
        if self.locks.cycle_ttl_secs <= 0 || self.locks.validator_ttl_secs <= 0 {
            return bad("lock TTLs must be positive".into());
        }
        // The cycle lease is renewed between evaluations and units, so it
        // must outlast the longest single one.
        let longest = self.evaluator.timeout_secs.max(v.unit_timeout_secs);
        if (self.locks.cycle_ttl_secs as u64) < longest {
            return bad(format!(
                "locks.cycle_ttl_secs ({}) is shorter than one evaluation or validation unit ({longest}s)",
                self.locks.cycle_ttl_secs
            ));
        }
        if (self.locks.validator_ttl_secs as u64) < v.unit_timeout_secs {
            return bad(format!(
                "locks.validator_ttl_secs ({}) is shorter than validator.unit_timeout_secs ({})",
                self.locks.validator_ttl_secs, v.unit_timeout_secs
            ));
        }
        if let Some(key) = &self.lineage.key_hex {
            match hex::decode(key) {
                Ok(bytes) if bytes.len() >= 16 => {}
                _ => return bad("lineage key must be at least 16 bytes of hex".into()),
            }
        }
        Ok(())
    }
}

fn parse_switch(name: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(CrucibleError::InvalidConfig(format!(
            "{name}={other:?} is not a boolean switch"
        ))),
    }
}

fn parse_num<T: std::str::FromStr>(name: &str, raw: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e| CrucibleError::InvalidConfig(format!("{name}={raw:?}: {e}")))
}
