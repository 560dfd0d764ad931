//! Tracing initialisation for the Crucible binaries.
//!
//! Call [`init_tracing`] once at program start. Later calls are ignored
//! because the global subscriber can only be set once per process.

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

pub const LOG_ENV: &str = "CRUCIBLE_LOG";
pub const LOG_FORMAT_ENV: &str = "CRUCIBLE_LOG_FORMAT";

/// Filter directives: `CRUCIBLE_LOG`, then `RUST_LOG`, then `level`.
fn filter(level: Level) -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(level.as_str()))
}

/// True when `CRUCIBLE_LOG_FORMAT=json`.
pub fn json_requested() -> bool {
    std::env::var(LOG_FORMAT_ENV)
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false)
}

/// Initialise the global tracing subscriber. Logs go to stderr so command
/// output on stdout stays parseable.
///
/// * `json`: newline-delimited JSON log lines for log pipelines.
/// * `level`: default verbosity when neither env filter is set.
pub fn init_tracing(json: bool, level: Level) {
    let env_filter = filter(level);

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_writer(std::io::stderr)
                    .json(),
            )
            .try_init()
            .ok();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .try_init()
            .ok();
    }
}
