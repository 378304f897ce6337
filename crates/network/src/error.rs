//! Network Error Types

use thiserror::Error;

/// Network errors
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Failed to bind listener: {0}")]
    Bind(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Already connected to peer: {0}")]
    DuplicatePeer(String),

    #[error("Network already running")]
    AlreadyRunning,
}

impl From<tokio_tungstenite::tungstenite::Error> for NetworkError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        NetworkError::Connection(e.to_string())
    }
}

impl From<serde_json::Error> for NetworkError {
    fn from(e: serde_json::Error) -> Self {
        NetworkError::Serialization(e.to_string())
    }
}

/// Result type for network operations
pub type NetworkResult<T> = Result<T, NetworkError>;
