//! Gateway Error Types

use attest_consensus::ConsensusError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chain_bridge::BridgeError;
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error(transparent)]
    Consensus(#[from] ConsensusError),

    #[error(transparent)]
    Bridge(#[from] BridgeError),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::Consensus(ConsensusError::UnknownRequest(_)) => StatusCode::NOT_FOUND,
            GatewayError::Consensus(ConsensusError::DigestMismatch(_))
            | GatewayError::Consensus(ConsensusError::InvalidRequest(_)) => StatusCode::BAD_REQUEST,
            GatewayError::Bridge(BridgeError::InvalidStake { .. }) => StatusCode::BAD_REQUEST,
            GatewayError::Bridge(BridgeError::AlreadyRegistered(_)) => StatusCode::CONFLICT,
            GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        tracing::debug!("Gateway rejected request ({}): {}", status, self);
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;
