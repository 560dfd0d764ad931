//! Crucible Core Library
//!
//! Candidate generation, instance materialization, elimination tournaments,
//! sequential soak validation, the promotion pipeline and the escalation
//! controller, plus the cycle runner that strings them together.

pub mod audit;
pub mod baseline;
pub mod clock;
pub mod config;
pub mod cycle;
pub mod domain;
pub mod escalation;
pub mod evaluator;
pub mod generator;
pub mod layout;
pub mod lease;
pub mod lineage;
pub mod metrics;
pub mod obs;
pub mod promotion;
pub mod retention;
pub mod spawner;
pub mod telemetry;
pub mod tournament;
pub mod validator;
pub mod window;
pub mod winners;

pub use domain::{
    AckStatus, Candidate, CandidateId, CandidateOrigin, CrucibleError, EscalationFlag,
    EvalContext, EvaluationResult, EvaluationStatus, Gate, Instance, InstanceId, Manifest, Match,
    ParamSpec, ParamValue, Params, PromotionId, PromotionRecord, PromotionStatus, Result, Round,
    SearchSpace, TickDecision, TournamentResult, ValidatedChampion, ValidationOutcome,
    ValidationRun, Verdict, WorkloadFailure, WorkloadReport,
};

pub use audit::{AuditEntry, AuditLog, AuditRecord};
pub use baseline::MetricBaseline;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::CrucibleConfig;
pub use cycle::{
    Autopilot, CycleFeedback, CycleOptions, CycleOutcome, CycleReport, CycleRunner, TickReport,
};
pub use escalation::{EscalationController, IngestReport};
pub use evaluator::{FitnessEvaluator, Workload};
pub use generator::{CandidateGenerator, GenerationPolicy, GenerationReport};
pub use layout::Layout;
pub use lineage::LineageSigner;
pub use promotion::PromotionPipeline;
pub use retention::{DiskProbe, FixedDiskProbe, RetentionManager, RetentionPolicy, StatvfsProbe};
pub use spawner::InstanceStore;
pub use tournament::TournamentOrchestrator;
pub use validator::SequentialValidator;
pub use window::MaintenanceWindow;
pub use winners::{WinnerRecord, WinnersLedger};

pub use metrics::METRICS;
pub use obs::{cycle_span, CycleSpan};
pub use telemetry::init_tracing;

/// Crucible version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
