//! Workload stage definitions and configuration.

use serde::{Deserialize, Serialize};

/// How a stage's output is turned into test counts.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    /// Parse `test result: ok. N passed; M failed` or `passed=N failed=M`
    /// lines; fall back to the exit code when neither appears.
    #[default]
    Auto,

    /// The stage counts as one test that passes on exit code 0.
    ExitCode,
}

/// Configuration for one workload stage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct StageConfig {
    /// Human-readable stage name.
    pub name: String,

    /// Command to execute (first element is executable). Relative paths
    /// resolve against the instance directory.
    pub command: Vec<String>,

    /// Per-stage timeout in seconds; 0 leaves only the evaluator's cap.
    #[serde(default)]
    pub timeout_secs: u64,

    /// Whether this stage is enabled.
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,

    #[serde(default)]
    pub output: OutputFormat,

    /// Only run this stage during validation units.
    #[serde(default)]
    pub validation_only: bool,
}

fn enabled_by_default() -> bool {
    true
}

impl StageConfig {
    /// Create a stage with auto-detected output.
    pub fn custom(name: impl Into<String>, command: Vec<String>, timeout_secs: u64) -> Self {
        Self {
            name: name.into(),
            command,
            timeout_secs,
            enabled: true,
            output: OutputFormat::Auto,
            validation_only: false,
        }
    }

    /// Shell one-liner run with `sh -c`.
    pub fn shell(name: impl Into<String>, script: &str, timeout_secs: u64) -> Self {
        Self::custom(
            name,
            vec!["sh".to_string(), "-c".to_string(), script.to_string()],
            timeout_secs,
        )
    }

    pub fn with_output(mut self, output: OutputFormat) -> Self {
        self.output = output;
        self
    }

    /// Disable this stage.
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn validation_only(mut self) -> Self {
        self.validation_only = true;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_config_custom() {
        let config = StageConfig::custom("bench", vec!["./bench".to_string()], 60);
        assert_eq!(config.name, "bench");
        assert_eq!(config.timeout_secs, 60);
        assert!(config.enabled);
        assert_eq!(config.output, OutputFormat::Auto);
    }

    #[test]
    fn test_stage_config_disabled() {
        let config = StageConfig::shell("soak", "true", 5).disabled();
        assert!(!config.enabled);
        assert_eq!(config.command[0], "sh");
    }

    #[test]
    fn test_stage_config_defaults_from_json() {
        let config: StageConfig = serde_json::from_value(serde_json::json!({
            "name": "smoke",
            "command": ["./smoke.sh"],
        }))
        .unwrap();
        assert!(config.enabled);
        assert_eq!(config.timeout_secs, 0);
        assert_eq!(config.output, OutputFormat::Auto);
        assert!(!config.validation_only);
    }

    #[test]
    fn test_unknown_stage_field_rejected() {
        let err = serde_json::from_value::<StageConfig>(serde_json::json!({
            "name": "smoke",
            "command": ["./smoke.sh"],
            "retries": 3,
        }));
        assert!(err.is_err());
    }
}
