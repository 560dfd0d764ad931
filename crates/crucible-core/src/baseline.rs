//! Rolling per-metric baseline for validation regressions
//! (`baseline.jsonl`).

use std::path::PathBuf;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crucible_state::JsonlLog;

use crate::domain::error::Result;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaselineSample {
    pub metric: String,
    pub value: f64,
    pub at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct MetricBaseline {
    log: JsonlLog<BaselineSample>,
}

impl MetricBaseline {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            log: JsonlLog::new(path),
        }
    }

    pub fn record(&self, metric: &str, value: f64, at: DateTime<Utc>) -> Result<()> {
        if !value.is_finite() {
            return Ok(());
        }
        Ok(self.log.append(&BaselineSample {
            metric: metric.to_string(),
            value,
            at,
        })?)
    }

    /// Mean of the samples for `metric` within `span` before `now`; `None`
    /// when there are none.
    pub fn rolling_mean(&self, metric: &str, now: DateTime<Utc>, span: Duration) -> Result<Option<f64>> {
        let since = now - span;
        let (sum, n) = self
            .log
            .read_all()?
            .into_iter()
            .filter(|s| s.metric == metric && s.at >= since && s.at <= now)
            .fold((0.0, 0usize), |(sum, n), s| (sum + s.value, n + 1));
        Ok((n > 0).then(|| sum / n as f64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mean_ignores_old_and_other_metrics() {
        let dir = tempfile::tempdir().unwrap();
        let b = MetricBaseline::new(dir.path().join("baseline.jsonl"));
        let now = Utc::now();
        b.record("failure_rate", 0.9, now - Duration::days(10)).unwrap();
        b.record("failure_rate", 0.1, now - Duration::days(2)).unwrap();
        b.record("failure_rate", 0.3, now - Duration::days(1)).unwrap();
        b.record("mean_latency_ms", 500.0, now).unwrap();

        let mean = b
            .rolling_mean("failure_rate", now, Duration::days(7))
            .unwrap()
            .unwrap();
        assert!((mean - 0.2).abs() < 1e-9);
        assert_eq!(b.rolling_mean("missing", now, Duration::days(7)).unwrap(), None);
    }
}
