//! Batch Engine Errors

use thiserror::Error;

/// Batch engine errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BatchError {
    #[error("Batch queue is full")]
    QueueFull,

    #[error("Batch engine is not running")]
    NotRunning,

    #[error("Batch engine already started")]
    AlreadyStarted,

    #[error("Batch engine was stopped")]
    Stopped,

    #[error("Batch processing failed: {0}")]
    Processing(String),
}

/// Result type for batch engine operations
pub type EngineResult<T> = Result<T, BatchError>;
