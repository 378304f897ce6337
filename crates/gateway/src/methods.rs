//! Gateway Methods - HTTP handlers
//!
//! Handlers only read lock-protected tables or call non-blocking network
//! entry points, so no request ever waits on peer I/O.

use crate::error::{GatewayError, GatewayResult};
use attest_consensus::{ValidationRequest, ValidationState, ValidationSubmission, ValidatorService};
use attest_network::{GossipMessage, NetworkStats, Peer, PeerNetwork};
use axum::{
    extract::{Path, Query, State},
    Json,
};
use chain_bridge::StakeRegistry;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// State shared across handlers
pub struct GatewayContext {
    pub service: Arc<ValidatorService>,
    pub network: Arc<PeerNetwork>,
    pub registry: Arc<dyn StakeRegistry>,
    /// Identity this node registers stake under
    pub node_id: String,
}

impl GatewayContext {
    /// Send gossip produced by the service; returns peers reached
    fn gossip(&self, outbound: &[GossipMessage]) -> usize {
        outbound
            .iter()
            .map(|message| self.network.broadcast(message))
            .max()
            .unwrap_or(0)
    }
}

// ============ Request/Response Types ============

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub node_id: String,
    pub registered: bool,
    pub stake: Option<u64>,
    pub peer_count: usize,
    pub pending_validations: usize,
    pub network_running: bool,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    #[serde(flatten)]
    pub health: HealthResponse,
    pub peers: Vec<Peer>,
    pub network: NetworkStats,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ValidateRequest {
    pub payment_id: String,
    pub message_hash: String,
    #[serde(default)]
    pub required_signatures: u32,
    #[serde(default)]
    pub is_high_value: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ValidateResponse {
    pub request_id: String,
    pub status: String,
    pub deadline: DateTime<Utc>,
    pub required_signatures: u32,
    pub peers_notified: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SignRequest {
    pub request_id: String,
    pub message_hash: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SignResponse {
    pub request_id: String,
    pub state: ValidationState,
    pub current_signatures: usize,
    pub required_signatures: u32,
    /// Signer -> signature
    pub signatures: BTreeMap<String, String>,
}

#[derive(Debug, Serialize)]
pub struct PeersResponse {
    pub count: usize,
    pub peers: Vec<Peer>,
}

#[derive(Debug, Deserialize)]
pub struct RegisterParams {
    pub stake: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub status: String,
    pub node_id: String,
    pub stake: u64,
    pub registered_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ValidationStatusResponse {
    pub request_id: String,
    pub payment_id: String,
    pub message_hash: String,
    pub state: ValidationState,
    pub is_high_value: bool,
    pub current_signatures: usize,
    pub required_signatures: u32,
    pub created_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub signatures: BTreeMap<String, String>,
}

impl From<ValidationRequest> for ValidationStatusResponse {
    fn from(request: ValidationRequest) -> Self {
        Self {
            current_signatures: request.signature_count(),
            signatures: request.signatures(),
            request_id: request.id,
            payment_id: request.payment_id,
            message_hash: request.message_hash,
            state: request.state,
            is_high_value: request.is_high_value,
            required_signatures: request.required_signatures,
            created_at: request.created_at,
            deadline: request.deadline,
            completed_at: request.completed_at,
        }
    }
}

// ============ Handlers ============

fn health(ctx: &GatewayContext) -> HealthResponse {
    let registration = ctx.registry.registration(&ctx.node_id);
    HealthResponse {
        status: "ok".to_string(),
        node_id: ctx.node_id.clone(),
        registered: registration.is_some(),
        stake: registration.map(|r| r.stake),
        peer_count: ctx.network.peer_count(),
        pending_validations: ctx.service.coordinator().pending_count(),
        network_running: ctx.network.is_running(),
    }
}

/// GET /health
pub async fn handle_health(State(ctx): State<Arc<GatewayContext>>) -> Json<HealthResponse> {
    Json(health(&ctx))
}

/// GET /status
pub async fn handle_status(State(ctx): State<Arc<GatewayContext>>) -> Json<StatusResponse> {
    Json(StatusResponse {
        health: health(&ctx),
        peers: ctx.network.get_peers(),
        network: ctx.network.stats(),
    })
}

/// POST /validate
pub async fn handle_validate(
    State(ctx): State<Arc<GatewayContext>>,
    Json(body): Json<ValidateRequest>,
) -> GatewayResult<Json<ValidateResponse>> {
    let dispatch = ctx
        .service
        .submit_validation(ValidationSubmission {
            payment_id: body.payment_id,
            message_hash: body.message_hash,
            required_signatures: body.required_signatures,
            is_high_value: body.is_high_value,
        })
        .await?;

    let peers_notified = ctx.gossip(&dispatch.outbound);
    tracing::info!(
        "Validation {} requested, gossiped to {} peers",
        dispatch.request.id,
        peers_notified
    );

    Ok(Json(ValidateResponse {
        request_id: dispatch.request.id,
        status: "requested".to_string(),
        deadline: dispatch.request.deadline,
        required_signatures: dispatch.request.required_signatures,
        peers_notified,
    }))
}

/// POST /sign
pub async fn handle_sign(
    State(ctx): State<Arc<GatewayContext>>,
    Json(body): Json<SignRequest>,
) -> GatewayResult<Json<SignResponse>> {
    let dispatch = ctx.service.sign(&body.request_id, &body.message_hash)?;
    ctx.gossip(&dispatch.outbound);

    let request = dispatch.request;
    Ok(Json(SignResponse {
        current_signatures: request.signature_count(),
        signatures: request.signatures(),
        request_id: request.id,
        state: request.state,
        required_signatures: request.required_signatures,
    }))
}

/// GET /peers
pub async fn handle_peers(State(ctx): State<Arc<GatewayContext>>) -> Json<PeersResponse> {
    let peers = ctx.network.get_peers();
    Json(PeersResponse {
        count: peers.len(),
        peers,
    })
}

/// POST /register?stake=<amount>
pub async fn handle_register(
    State(ctx): State<Arc<GatewayContext>>,
    Query(params): Query<RegisterParams>,
) -> GatewayResult<Json<RegisterResponse>> {
    let registration = ctx.registry.register(&ctx.node_id, params.stake).await?;
    tracing::info!(
        "Registered {} with stake {}",
        registration.node_id,
        registration.stake
    );

    Ok(Json(RegisterResponse {
        status: "registered".to_string(),
        node_id: registration.node_id,
        stake: registration.stake,
        registered_at: registration.registered_at,
    }))
}

/// GET /validations/:id
pub async fn handle_validation_status(
    State(ctx): State<Arc<GatewayContext>>,
    Path(request_id): Path<String>,
) -> GatewayResult<Json<ValidationStatusResponse>> {
    ctx.service
        .coordinator()
        .get_validation_status(&request_id)
        .map(|request| Json(request.into()))
        .ok_or(GatewayError::NotFound(request_id))
}
