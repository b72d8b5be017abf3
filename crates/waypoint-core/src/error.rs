use thiserror::Error;

/// Storage, request and lookup failures.
///
/// Gate rejections and tool failures are not errors: they end a run with a
/// terminal status and are reported through the finalization bundle.
#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Record already exists: {0}")]
    RecordExists(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Rollback already recorded for run {0}")]
    RollbackAlreadyRecorded(String),
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
