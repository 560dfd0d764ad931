use thiserror::Error;

/// Errors from configuring or launching workload stages.
#[derive(Debug, Error)]
pub enum WorkloadRunError {
    #[error("invalid workload configuration: {0}")]
    InvalidSpec(String),

    #[error("stage {stage} has an empty command")]
    EmptyCommand { stage: String },

    #[error("failed to start stage {stage}: {source}")]
    Spawn {
        stage: String,
        #[source]
        source: std::io::Error,
    },

    #[error("stage {stage} timed out after {timeout_secs}s")]
    StageTimeout { stage: String, timeout_secs: u64 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, WorkloadRunError>;
