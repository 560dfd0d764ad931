//! Crucible Workload - command stages as a fitness measurement
//!
//! Provides the concrete [`Workload`](crucible_core::Workload) used by the
//! evaluator and validator:
//! - Runs configured command stages inside an instance directory
//! - Passes candidate parameters through `CRUCIBLE_PARAM_*` variables
//! - Parses pass/fail counts and latency from stage output
//! - Reports resource exhaustion (OOM kills) distinctly from failures

mod error;
pub mod pipeline;
pub mod report;
pub mod runner;
pub mod spec;
pub mod stage;

// Re-export key types
pub use error::{Result, WorkloadRunError};
pub use pipeline::CommandWorkload;
pub use report::{StageCounts, StageVerdict};
pub use runner::{StageResult, StageRunner};
pub use spec::WorkloadSpec;
pub use stage::{OutputFormat, StageConfig};
