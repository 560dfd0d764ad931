//! Domain models for Crucible.
//!
//! Canonical definitions for the core entities:
//! - `Candidate` / `SearchSpace`: proposed configurations and their bounds
//! - `Instance`: a materialized candidate with manifest and lineage
//! - `EvaluationResult`, `Match`, `Round`, `TournamentResult`
//! - `ValidationRun` and the `ValidatedChampion` proof token
//! - `PromotionRecord` and the apply-step artifacts
//! - `EscalationFlag` and controller state

pub mod candidate;
pub mod digest;
pub mod error;
pub mod escalation;
pub mod evaluation;
pub mod instance;
pub mod promotion;
pub mod search_space;
pub mod tournament;
pub mod validation;

pub use candidate::{Candidate, CandidateId, CandidateOrigin};
pub use error::{CrucibleError, Result};
pub use escalation::{
    ClearReason, EscalationFlag, EscalationState, FlagState, Gate, NightBudget, SeveritySample,
    TickDecision,
};
pub use evaluation::{
    EvalContext, EvaluationResult, EvaluationStatus, FitnessWeights, WorkloadFailure,
    WorkloadReport, DISQUALIFIED_FITNESS,
};
pub use instance::{Instance, InstanceId, LineageRecord, Manifest};
pub use promotion::{
    AckStatus, Acknowledgement, ProductionPointer, PromotionId, PromotionRecord, PromotionStatus,
    RollbackMarker, RollbackReason, Transition,
};
pub use search_space::{ParamSpec, ParamValue, Params, SearchSpace};
pub use tournament::{Match, Round, Standing, TournamentResult};
pub use validation::{
    Regression, UnitOutcome, ValidatedChampion, ValidationCheckpoint, ValidationOutcome,
    ValidationRun, ValidationUnit, Verdict,
};
