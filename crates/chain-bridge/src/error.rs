//! Chain Bridge Errors

use thiserror::Error;

/// Errors from on-chain collaborators
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BridgeError {
    #[error("Validator {0} is already registered")]
    AlreadyRegistered(String),

    #[error("Invalid stake {stake}: minimum is {minimum}")]
    InvalidStake { stake: u64, minimum: u64 },
}

/// Result type for bridge operations
pub type BridgeResult<T> = Result<T, BridgeError>;
