//! Stage output parsing.
//!
//! Recognizes two summary shapes:
//!
//! ```text
//! test result: ok. 12 passed; 1 failed; 0 ignored
//! passed=12 failed=1 latency_ms=4.5 stability=0.98 peak_rss_bytes=1048576
//! ```
//!
//! The last matching line wins. The extra `key=value` facts are optional and
//! may appear on any line.

use std::sync::OnceLock;

use regex::Regex;

use crate::stage::OutputFormat;

/// Counts and facts read from one stage's output.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StageCounts {
    pub passed: u64,
    pub failed: u64,
    pub latency_ms: Option<f64>,
    pub stability: Option<f64>,
    pub peak_rss_bytes: Option<u64>,
}

impl StageCounts {
    pub fn total(&self) -> u64 {
        self.passed + self.failed
    }
}

/// How a finished stage is judged.
#[derive(Debug, Clone, PartialEq)]
pub enum StageVerdict {
    /// The stage ran; its counts feed the report.
    Counted(StageCounts),
    /// The process was killed for memory, or said so.
    OutOfMemory(String),
}

static CARGO_RESULT_RE: OnceLock<Option<Regex>> = OnceLock::new();
static KEY_VALUE_RE: OnceLock<Option<Regex>> = OnceLock::new();
static FACT_RE: OnceLock<Option<Regex>> = OnceLock::new();

fn cargo_result_re() -> Option<&'static Regex> {
    CARGO_RESULT_RE
        .get_or_init(|| Regex::new(r"test result: \w+\. (\d+) passed; (\d+) failed").ok())
        .as_ref()
}

fn key_value_re() -> Option<&'static Regex> {
    KEY_VALUE_RE
        .get_or_init(|| Regex::new(r"\bpassed=(\d+)\s+failed=(\d+)").ok())
        .as_ref()
}

fn fact_re() -> Option<&'static Regex> {
    FACT_RE
        .get_or_init(|| {
            Regex::new(r"\b(latency_ms|stability|peak_rss_bytes)=([0-9]+(?:\.[0-9]+)?)").ok()
        })
        .as_ref()
}

fn capture_u64(caps: &regex::Captures<'_>, index: usize) -> u64 {
    caps.get(index)
        .and_then(|m| m.as_str().parse().ok())
        .unwrap_or(0)
}

/// Pass/fail counts from the last summary line, if any.
pub fn parse_counts(output: &str) -> Option<(u64, u64)> {
    let patterns: Vec<&Regex> = [cargo_result_re(), key_value_re()]
        .into_iter()
        .flatten()
        .collect();
    for line in output.lines().rev() {
        for re in &patterns {
            if let Some(caps) = re.captures(line) {
                return Some((capture_u64(&caps, 1), capture_u64(&caps, 2)));
            }
        }
    }
    None
}

/// Apply any optional facts found in `output` to `counts`. Later lines win.
fn parse_facts(output: &str, counts: &mut StageCounts) {
    let Some(re) = fact_re() else {
        return;
    };
    for caps in re.captures_iter(output) {
        let (Some(key), Some(value)) = (caps.get(1), caps.get(2)) else {
            continue;
        };
        let value = value.as_str();
        match key.as_str() {
            "latency_ms" => counts.latency_ms = value.parse().ok(),
            "stability" => counts.stability = value.parse().ok(),
            "peak_rss_bytes" => counts.peak_rss_bytes = value.parse().ok(),
            _ => {}
        }
    }
}

/// Whether the process ended the way an OOM kill ends.
pub fn looks_out_of_memory(exit_code: Option<i32>, signal: Option<i32>, output: &str) -> bool {
    signal == Some(9)
        || exit_code == Some(137)
        || output.to_ascii_lowercase().contains("out of memory")
}

/// Judge one stage from its exit status and combined output.
pub fn judge(
    format: OutputFormat,
    exit_code: Option<i32>,
    signal: Option<i32>,
    output: &str,
) -> StageVerdict {
    if looks_out_of_memory(exit_code, signal, output) {
        let how = match (signal, exit_code) {
            (Some(sig), _) => format!("killed by signal {sig}"),
            (None, Some(code)) => format!("exit code {code}"),
            (None, None) => "no exit status".to_string(),
        };
        return StageVerdict::OutOfMemory(how);
    }

    let succeeded = exit_code == Some(0);
    let mut counts = StageCounts::default();
    let parsed = match format {
        OutputFormat::Auto => parse_counts(output),
        OutputFormat::ExitCode => None,
    };
    match parsed {
        Some((passed, failed)) => {
            counts.passed = passed;
            counts.failed = failed;
        }
        None if succeeded => counts.passed = 1,
        None => counts.failed = 1,
    }
    parse_facts(output, &mut counts);
    StageVerdict::Counted(counts)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cargo_summary() {
        let output = "running 13 tests\n\
                      test a ... ok\n\
                      test result: FAILED. 12 passed; 1 failed; 0 ignored; 0 measured";
        assert_eq!(parse_counts(output), Some((12, 1)));
    }

    #[test]
    fn test_parse_key_value_summary() {
        assert_eq!(parse_counts("warmup\npassed=40 failed=2\n"), Some((40, 2)));
    }

    #[test]
    fn test_last_summary_wins() {
        let output = "passed=1 failed=9\ntest result: ok. 7 passed; 0 failed; 0 ignored";
        assert_eq!(parse_counts(output), Some((7, 0)));
    }

    #[test]
    fn test_no_summary() {
        assert_eq!(parse_counts("all good\n"), None);
    }

    #[test]
    fn test_exit_code_fallback_counts_one_test() {
        match judge(OutputFormat::Auto, Some(0), None, "done") {
            StageVerdict::Counted(c) => assert_eq!((c.passed, c.failed), (1, 0)),
            other => panic!("unexpected {other:?}"),
        }
        match judge(OutputFormat::Auto, Some(3), None, "boom") {
            StageVerdict::Counted(c) => assert_eq!((c.passed, c.failed), (0, 1)),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_exit_code_format_ignores_summary_lines() {
        match judge(OutputFormat::ExitCode, Some(0), None, "passed=0 failed=50") {
            StageVerdict::Counted(c) => assert_eq!((c.passed, c.failed), (1, 0)),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_facts_are_read() {
        let output = "passed=9 failed=1\nlatency_ms=12.5 stability=0.9\npeak_rss_bytes=2048";
        match judge(OutputFormat::Auto, Some(1), None, output) {
            StageVerdict::Counted(c) => {
                assert_eq!((c.passed, c.failed), (9, 1));
                assert_eq!(c.latency_ms, Some(12.5));
                assert_eq!(c.stability, Some(0.9));
                assert_eq!(c.peak_rss_bytes, Some(2048));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_oom_detection() {
        assert!(matches!(
            judge(OutputFormat::Auto, None, Some(9), ""),
            StageVerdict::OutOfMemory(_)
        ));
        assert!(matches!(
            judge(OutputFormat::Auto, Some(137), None, ""),
            StageVerdict::OutOfMemory(_)
        ));
        assert!(matches!(
            judge(OutputFormat::Auto, Some(1), None, "fatal: Out of memory"),
            StageVerdict::OutOfMemory(_)
        ));
        assert!(!looks_out_of_memory(Some(1), None, "segfault"));
    }
}
