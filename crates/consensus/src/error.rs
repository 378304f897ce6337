//! Consensus Error Types

use thiserror::Error;

/// Errors surfaced by the coordinator and validator service
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConsensusError {
    #[error("Unknown validation request: {0}")]
    UnknownRequest(String),

    #[error("Message hash does not match request {0}")]
    DigestMismatch(String),

    #[error("Invalid validation request: {0}")]
    InvalidRequest(String),
}

/// Result type for consensus operations
pub type ConsensusResult<T> = Result<T, ConsensusError>;
