//! Stage process execution against one instance.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::process::Command;
use tracing::debug;

use crucible_core::{EvalContext, Instance};

use crate::error::{Result, WorkloadRunError};
use crate::stage::StageConfig;

/// Result of a stage execution.
#[derive(Debug, Clone)]
pub struct StageResult {
    pub stage_name: String,

    /// Exit code; `None` when the process was ended by a signal.
    pub exit_code: Option<i32>,

    /// Terminating signal, if any.
    pub signal: Option<i32>,

    pub stdout: String,
    pub stderr: String,

    /// Duration in milliseconds.
    pub duration_ms: u64,

    /// Whether execution succeeded.
    pub success: bool,
}

impl StageResult {
    /// Whether this stage passed (exit code 0).
    pub fn passed(&self) -> bool {
        self.success && self.exit_code == Some(0)
    }

    /// Stdout followed by stderr, for parsing.
    pub fn combined_output(&self) -> String {
        let mut out = String::with_capacity(self.stdout.len() + self.stderr.len() + 1);
        out.push_str(&self.stdout);
        if !self.stderr.is_empty() {
            out.push('\n');
            out.push_str(&self.stderr);
        }
        out
    }
}

/// Runs stages inside one instance directory with its parameters exported.
///
/// Every stage sees `CRUCIBLE_INSTANCE_DIR`, `CRUCIBLE_UNIT` and one
/// `CRUCIBLE_PARAM_<NAME>` per candidate parameter. Validation units also
/// get `CRUCIBLE_SOAK_SPAN_SECS`.
pub struct StageRunner {
    workdir: PathBuf,
    env: BTreeMap<String, String>,
}

impl StageRunner {
    pub fn new(instance: &Instance, context: &EvalContext, extra_env: &BTreeMap<String, String>) -> Self {
        let mut env = extra_env.clone();
        for (name, value) in &instance.candidate.params {
            env.insert(param_var(name), value.to_string());
        }
        env.insert(
            "CRUCIBLE_INSTANCE_DIR".to_string(),
            instance.path.to_string_lossy().into_owned(),
        );
        env.insert("CRUCIBLE_UNIT".to_string(), unit_label(context));
        if let EvalContext::Validation { soak_span_secs, .. } = context {
            env.insert(
                "CRUCIBLE_SOAK_SPAN_SECS".to_string(),
                soak_span_secs.to_string(),
            );
        }
        Self {
            workdir: instance.path.clone(),
            env,
        }
    }

    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    /// Execute a single stage and return the result.
    ///
    /// The child is killed if this future is dropped, so an outer timeout
    /// never leaves a stage running.
    pub async fn execute_stage(&self, config: &StageConfig) -> Result<StageResult> {
        let start = Instant::now();

        let Some((exe, args)) = config.command.split_first() else {
            return Err(WorkloadRunError::EmptyCommand {
                stage: config.name.clone(),
            });
        };

        let child = Command::new(resolve_program(&self.workdir, exe))
            .args(args)
            .current_dir(&self.workdir)
            .envs(&self.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| WorkloadRunError::Spawn {
                stage: config.name.clone(),
                source,
            })?;

        debug!(stage = %config.name, "stage started");

        let output = if config.timeout_secs > 0 {
            tokio::time::timeout(
                Duration::from_secs(config.timeout_secs),
                child.wait_with_output(),
            )
            .await
            .map_err(|_| WorkloadRunError::StageTimeout {
                stage: config.name.clone(),
                timeout_secs: config.timeout_secs,
            })??
        } else {
            child.wait_with_output().await?
        };

        let duration_ms = start.elapsed().as_millis() as u64;
        let result = StageResult {
            stage_name: config.name.clone(),
            exit_code: output.status.code(),
            signal: exit_signal(&output.status),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            duration_ms,
            success: output.status.success(),
        };
        debug!(
            stage = %result.stage_name,
            exit_code = ?result.exit_code,
            signal = ?result.signal,
            duration_ms,
            "stage finished"
        );
        Ok(result)
    }
}

/// `CRUCIBLE_PARAM_` plus the upper-cased name, non-alphanumerics as `_`.
pub fn param_var(name: &str) -> String {
    let suffix: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("CRUCIBLE_PARAM_{suffix}")
}

fn unit_label(context: &EvalContext) -> String {
    match context {
        EvalContext::Match { round } => format!("match-r{round}"),
        EvalContext::Validation {
            epoch,
            slice,
            replica,
            ..
        } => format!("validation-e{epoch}-s{slice}-r{replica}"),
    }
}

/// Relative paths with a separator resolve against the instance directory;
/// bare names go through `PATH`.
fn resolve_program(workdir: &Path, exe: &str) -> PathBuf {
    let path = Path::new(exe);
    if path.is_relative() && path.components().count() > 1 {
        workdir.join(path)
    } else {
        path.to_path_buf()
    }
}

#[cfg(unix)]
fn exit_signal(status: &std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &std::process::ExitStatus) -> Option<i32> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_result_passed() {
        let result = StageResult {
            stage_name: "bench".to_string(),
            exit_code: Some(0),
            signal: None,
            stdout: String::new(),
            stderr: String::new(),
            duration_ms: 100,
            success: true,
        };
        assert!(result.passed());
    }

    #[test]
    fn test_stage_result_killed() {
        let result = StageResult {
            stage_name: "bench".to_string(),
            exit_code: None,
            signal: Some(9),
            stdout: "partial".to_string(),
            stderr: "oom".to_string(),
            duration_ms: 100,
            success: false,
        };
        assert!(!result.passed());
        assert_eq!(result.combined_output(), "partial\noom");
    }

    #[test]
    fn test_param_var_names() {
        assert_eq!(param_var("cache_size"), "CRUCIBLE_PARAM_CACHE_SIZE");
        assert_eq!(param_var("gc.ratio"), "CRUCIBLE_PARAM_GC_RATIO");
    }

    #[test]
    fn test_unit_labels() {
        assert_eq!(unit_label(&EvalContext::Match { round: 2 }), "match-r2");
        assert_eq!(
            unit_label(&EvalContext::Validation {
                epoch: 1,
                slice: 0,
                replica: 3,
                soak_span_secs: 60,
            }),
            "validation-e1-s0-r3"
        );
    }

    #[test]
    fn test_resolve_program() {
        let dir = Path::new("/srv/instances/abc");
        assert_eq!(
            resolve_program(dir, "./bench.sh"),
            PathBuf::from("/srv/instances/abc/./bench.sh")
        );
        assert_eq!(resolve_program(dir, "sh"), PathBuf::from("sh"));
        assert_eq!(resolve_program(dir, "/bin/true"), PathBuf::from("/bin/true"));
    }
}
