//! Workload specification, read from the opaque `[workload]` config section.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crucible_core::EvalContext;

use crate::error::{Result, WorkloadRunError};
use crate::stage::StageConfig;

/// Ordered stages plus extra environment for every stage.
///
/// ```toml
/// [workload]
/// env = { BENCH_PROFILE = "nightly" }
///
/// [[workload.stages]]
/// name = "bench"
/// command = ["./bench.sh", "--quick"]
/// timeout_secs = 120
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct WorkloadSpec {
    pub stages: Vec<StageConfig>,

    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl WorkloadSpec {
    pub fn new(stages: Vec<StageConfig>) -> Self {
        Self {
            stages,
            env: BTreeMap::new(),
        }
    }

    /// Parse and validate the `[workload]` value.
    pub fn from_value(value: &serde_json::Value) -> Result<Self> {
        if value.is_null() {
            return Err(WorkloadRunError::InvalidSpec(
                "missing [workload] section".to_string(),
            ));
        }
        let spec: WorkloadSpec = serde_json::from_value(value.clone())
            .map_err(|e| WorkloadRunError::InvalidSpec(e.to_string()))?;
        spec.validate()?;
        Ok(spec)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.stages.iter().any(|s| s.enabled && !s.validation_only) {
            return Err(WorkloadRunError::InvalidSpec(
                "workload needs at least one enabled tournament stage".to_string(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for stage in &self.stages {
            if stage.command.is_empty() {
                return Err(WorkloadRunError::EmptyCommand {
                    stage: stage.name.clone(),
                });
            }
            if !seen.insert(stage.name.as_str()) {
                return Err(WorkloadRunError::InvalidSpec(format!(
                    "duplicate stage name {}",
                    stage.name
                )));
            }
        }
        Ok(())
    }

    /// Enabled stages that apply to `context`, in order.
    pub fn stages_for<'a>(&'a self, context: &EvalContext) -> impl Iterator<Item = &'a StageConfig> {
        let validating = matches!(context, EvalContext::Validation { .. });
        self.stages
            .iter()
            .filter(move |s| s.enabled && (validating || !s.validation_only))
    }

    /// Digest of the ordered stage names and commands.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        for stage in &self.stages {
            hasher.update(stage.name.as_bytes());
            hasher.update(b"\0");
            for arg in &stage.command {
                hasher.update(arg.as_bytes());
                hasher.update(b"\x1f");
            }
            hasher.update(b"\0");
        }
        hex::encode(hasher.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_value_round_trips_config_shape() {
        let spec = WorkloadSpec::from_value(&json!({
            "env": {"BENCH_PROFILE": "nightly"},
            "stages": [
                {"name": "bench", "command": ["./bench.sh"], "timeout_secs": 120},
                {"name": "soak", "command": ["./soak.sh"], "validation_only": true},
            ]
        }))
        .expect("valid spec");
        assert_eq!(spec.stages.len(), 2);
        assert_eq!(spec.env["BENCH_PROFILE"], "nightly");
    }

    #[test]
    fn test_missing_section_rejected() {
        let err = WorkloadSpec::from_value(&serde_json::Value::Null).unwrap_err();
        assert!(matches!(err, WorkloadRunError::InvalidSpec(_)));
    }

    #[test]
    fn test_validation_only_stages_are_not_enough() {
        let spec = WorkloadSpec::new(vec![
            StageConfig::shell("soak", "true", 0).validation_only(),
        ]);
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let spec = WorkloadSpec::new(vec![
            StageConfig::shell("a", "true", 0),
            StageConfig::shell("a", "false", 0),
        ]);
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_stages_for_context() {
        let spec = WorkloadSpec::new(vec![
            StageConfig::shell("bench", "true", 0),
            StageConfig::shell("soak", "true", 0).validation_only(),
            StageConfig::shell("off", "true", 0).disabled(),
        ]);
        let matched: Vec<_> = spec
            .stages_for(&EvalContext::Match { round: 0 })
            .map(|s| s.name.as_str())
            .collect();
        assert_eq!(matched, vec!["bench"]);
        let validating: Vec<_> = spec
            .stages_for(&EvalContext::Validation {
                epoch: 0,
                slice: 0,
                replica: 0,
                soak_span_secs: 60,
            })
            .map(|s| s.name.as_str())
            .collect();
        assert_eq!(validating, vec!["bench", "soak"]);
    }

    #[test]
    fn test_digest_order_sensitive() {
        let a = WorkloadSpec::new(vec![
            StageConfig::shell("x", "true", 0),
            StageConfig::shell("y", "true", 0),
        ]);
        let b = WorkloadSpec::new(vec![
            StageConfig::shell("y", "true", 0),
            StageConfig::shell("x", "true", 0),
        ]);
        assert_eq!(a.digest(), a.clone().digest());
        assert_ne!(a.digest(), b.digest());
    }
}
