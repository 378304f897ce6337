//! Validator service - glue between gateway, coordinator, signer and network
//!
//! The service never touches the network directly. Every operation returns
//! the gossip it wants sent, and the caller (gateway or dispatch loop)
//! broadcasts it.

use crate::coordinator::Coordinator;
use crate::error::{ConsensusError, ConsensusResult};
use crate::signer::Signer;
use crate::types::{NewValidation, ShareOutcome, ValidationRequest, ValidationState};
use attest_network::{GossipHandler, GossipMessage, MessageType};
use async_trait::async_trait;
use batch_engine::{BatchEngine, BatchItem};
use chain_bridge::{CompletedAttestation, PaymentLedger};
use chrono::Utc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// A payment submitted for attestation
#[derive(Debug, Clone)]
pub struct ValidationSubmission {
    pub payment_id: String,
    pub message_hash: String,
    /// 0 means the coordinator's default quorum
    pub required_signatures: u32,
    pub is_high_value: bool,
}

/// Request snapshot plus the gossip an operation produced
#[derive(Debug, Clone)]
pub struct Dispatch {
    pub request: ValidationRequest,
    pub outbound: Vec<GossipMessage>,
}

pub struct ValidatorService {
    coordinator: Arc<Coordinator>,
    signer: Arc<dyn Signer>,
    ledger: Arc<dyn PaymentLedger>,
    attestations: Option<Arc<BatchEngine<CompletedAttestation>>>,
    /// Payments worth at least this much use the high-value quorum
    high_value_threshold: u64,
    next_attestation_id: AtomicU64,
}

impl ValidatorService {
    pub fn new(
        coordinator: Arc<Coordinator>,
        signer: Arc<dyn Signer>,
        ledger: Arc<dyn PaymentLedger>,
        high_value_threshold: u64,
    ) -> Self {
        Self {
            coordinator,
            signer,
            ledger,
            attestations: None,
            high_value_threshold,
            next_attestation_id: AtomicU64::new(1),
        }
    }

    /// Hand completed attestations to a batch engine
    pub fn with_attestation_engine(mut self, engine: Arc<BatchEngine<CompletedAttestation>>) -> Self {
        self.attestations = Some(engine);
        self
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    pub fn signer_id(&self) -> &str {
        self.signer.signer_id()
    }

    /// Admit a new payment, sign it locally and produce the gossip that
    /// asks peers for their shares
    pub async fn submit_validation(&self, submission: ValidationSubmission) -> ConsensusResult<Dispatch> {
        let is_high_value = self
            .resolve_high_value(&submission.payment_id, submission.is_high_value)
            .await;
        let request_id = request_id(&submission.payment_id, &submission.message_hash);

        let admission = self.coordinator.process_validation_request(NewValidation {
            request_id: request_id.clone(),
            payment_id: submission.payment_id.clone(),
            message_hash: submission.message_hash.clone(),
            required_signatures: submission.required_signatures,
            is_high_value,
        })?;

        let mut outbound = vec![GossipMessage::validation_request(
            &request_id,
            &submission.payment_id,
            &submission.message_hash,
            submission.required_signatures,
            is_high_value,
        )];
        if admission.completed {
            self.on_completed(&admission.request, &mut outbound);
        }

        let request = self.sign_if_needed(&admission.request, &mut outbound)?;
        Ok(Dispatch { request, outbound })
    }

    /// Add this node's share to a known request
    pub fn sign(&self, request_id: &str, message_hash: &str) -> ConsensusResult<Dispatch> {
        let request = self
            .coordinator
            .get_validation_status(request_id)
            .ok_or_else(|| ConsensusError::UnknownRequest(request_id.to_string()))?;
        if request.message_hash != message_hash {
            return Err(ConsensusError::DigestMismatch(request_id.to_string()));
        }

        let mut outbound = Vec::new();
        let request = self.sign_if_needed(&request, &mut outbound)?;
        Ok(Dispatch { request, outbound })
    }

    /// Payment is high value if flagged or if the ledger says so
    async fn resolve_high_value(&self, payment_id: &str, flagged: bool) -> bool {
        if flagged {
            return true;
        }
        match self.ledger.is_high_value(payment_id, self.high_value_threshold).await {
            Ok(high) => high,
            Err(e) => {
                tracing::warn!("Payment ledger lookup for {} failed: {}", payment_id, e);
                false
            }
        }
    }

    /// Sign a pending request this node has not signed yet
    fn sign_if_needed(
        &self,
        request: &ValidationRequest,
        outbound: &mut Vec<GossipMessage>,
    ) -> ConsensusResult<ValidationRequest> {
        let me = self.signer.signer_id();
        if request.state != ValidationState::Pending || request.has_signed(me) {
            return Ok(request.clone());
        }

        let signature = self.signer.sign(&request.message_hash);
        outbound.push(GossipMessage::signature_share(
            &request.id,
            &request.payment_id,
            &request.message_hash,
            me,
            &signature,
        ));
        self.ingest(&request.id, &request.message_hash, me, &signature, outbound)?;

        self.coordinator
            .get_validation_status(&request.id)
            .ok_or_else(|| ConsensusError::UnknownRequest(request.id.clone()))
    }

    fn ingest(
        &self,
        request_id: &str,
        message_hash: &str,
        signer: &str,
        signature: &str,
        outbound: &mut Vec<GossipMessage>,
    ) -> ConsensusResult<ShareOutcome> {
        let outcome = self
            .coordinator
            .add_signature(request_id, message_hash, signer, signature)?;
        if let ShareOutcome::Completed(request) = &outcome {
            self.on_completed(request, outbound);
        }
        Ok(outcome)
    }

    /// Announce completion and queue the attestation for commit
    fn on_completed(&self, request: &ValidationRequest, outbound: &mut Vec<GossipMessage>) {
        outbound.push(GossipMessage::validation_complete(
            &request.id,
            &request.payment_id,
            &request.message_hash,
        ));

        let Some(engine) = &self.attestations else {
            return;
        };
        let attestation = CompletedAttestation {
            request_id: request.id.clone(),
            payment_id: request.payment_id.clone(),
            message_hash: request.message_hash.clone(),
            signatures: request.signatures(),
            completed_at: request.completed_at.unwrap_or_else(Utc::now),
        };
        let id = self.next_attestation_id.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = engine.submit(BatchItem::new(id, attestation)) {
            tracing::warn!("Attestation for {} not queued: {}", request.id, e);
        }
    }

    async fn on_validation_request(&self, from: &str, message: GossipMessage) -> Vec<GossipMessage> {
        let is_high_value = self
            .resolve_high_value(&message.payment_id, message.is_high_value.unwrap_or(false))
            .await;

        let admission = match self.coordinator.process_validation_request(NewValidation {
            request_id: message.request_id.clone(),
            payment_id: message.payment_id,
            message_hash: message.message_hash,
            required_signatures: message.required_signatures.unwrap_or(0),
            is_high_value,
        }) {
            Ok(admission) => admission,
            Err(e) => {
                tracing::warn!("Rejected validation request from {}: {}", from, e);
                return Vec::new();
            }
        };

        let mut outbound = Vec::new();
        if admission.completed {
            self.on_completed(&admission.request, &mut outbound);
        }
        if let Err(e) = self.sign_if_needed(&admission.request, &mut outbound) {
            tracing::warn!("Could not sign {}: {}", message.request_id, e);
        }
        outbound
    }

    fn on_signature_share(&self, from: &str, message: GossipMessage) -> Vec<GossipMessage> {
        let (Some(signer), Some(signature)) = (message.signer.as_deref(), message.signature.as_deref()) else {
            tracing::warn!(
                "Signature share for {} from {} is missing signer or signature",
                message.request_id,
                from
            );
            return Vec::new();
        };

        if !self.signer.verify(signer, &message.message_hash, signature) {
            tracing::warn!(
                "Invalid signature from {} for {} (relayed by {})",
                signer,
                message.request_id,
                from
            );
            return Vec::new();
        }

        let mut outbound = Vec::new();
        match self.ingest(&message.request_id, &message.message_hash, signer, signature, &mut outbound) {
            Ok(outcome) => {
                tracing::trace!("Share from {} for {}: {:?}", signer, message.request_id, outcome);
            }
            Err(e) => {
                tracing::debug!("Dropped share from {} for {}: {}", signer, message.request_id, e);
            }
        }
        outbound
    }
}

#[async_trait]
impl GossipHandler for ValidatorService {
    async fn handle(&self, from: &str, message: GossipMessage) -> Vec<GossipMessage> {
        let kind = message.kind.clone();
        match kind {
            MessageType::ValidationRequest => self.on_validation_request(from, message).await,
            MessageType::SignatureShare => self.on_signature_share(from, message),
            MessageType::ValidationComplete => {
                tracing::info!(
                    "Peer {} reports validation {} complete for payment {}",
                    from,
                    message.request_id,
                    message.payment_id
                );
                Vec::new()
            }
            MessageType::Unknown(_) => Vec::new(),
        }
    }
}

/// `val-` plus 16 hex chars of blake3(payment, hash, admission time)
fn request_id(payment_id: &str, message_hash: &str) -> String {
    let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
    let mut hasher = blake3::Hasher::new();
    hasher.update(payment_id.as_bytes());
    hasher.update(b"|");
    hasher.update(message_hash.as_bytes());
    hasher.update(b"|");
    hasher.update(&nanos.to_le_bytes());
    let hex = hasher.finalize().to_hex();
    format!("val-{}", &hex.as_str()[..16])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signer::Ed25519Signer;
    use crate::types::CoordinatorConfig;
    use batch_engine::{BatchConfig, BatchProcessor};
    use chain_bridge::{AttestationCommitter, InMemoryPaymentLedger};
    use std::time::Duration;
    use tokio::sync::watch;

    fn service_with(seed: u8, ledger: Arc<InMemoryPaymentLedger>) -> ValidatorService {
        ValidatorService::new(
            Arc::new(Coordinator::new(CoordinatorConfig::default())),
            Arc::new(Ed25519Signer::from_seed([seed; 32])),
            ledger,
            1_000,
        )
    }

    fn service(seed: u8) -> ValidatorService {
        service_with(seed, Arc::new(InMemoryPaymentLedger::new()))
    }

    fn submission(required: u32) -> ValidationSubmission {
        ValidationSubmission {
            payment_id: "pay-1".to_string(),
            message_hash: "0xfeed".to_string(),
            required_signatures: required,
            is_high_value: false,
        }
    }

    fn kinds(messages: &[GossipMessage]) -> Vec<MessageType> {
        messages.iter().map(|m| m.kind.clone()).collect()
    }

    #[tokio::test]
    async fn test_submit_signs_locally() {
        let service = service(1);
        let dispatch = service.submit_validation(submission(2)).await.unwrap();

        assert!(dispatch.request.id.starts_with("val-"));
        assert_eq!(dispatch.request.id.len(), 20);
        assert_eq!(dispatch.request.state, ValidationState::Pending);
        assert_eq!(dispatch.request.signature_count(), 1);
        assert!(dispatch.request.has_signed(service.signer_id()));
        assert_eq!(
            kinds(&dispatch.outbound),
            vec![MessageType::ValidationRequest, MessageType::SignatureShare]
        );
        assert_eq!(dispatch.outbound[0].required_signatures, Some(2));
    }

    #[tokio::test]
    async fn test_two_nodes_reach_quorum() {
        let origin = service(1);
        let peer = service(2);

        let dispatch = origin.submit_validation(submission(2)).await.unwrap();
        let request_id = dispatch.request.id.clone();

        // The peer sees the request and its origin's share, in either order
        let replies = peer.handle("origin", dispatch.outbound[1].clone()).await;
        assert!(replies.is_empty());
        let replies = peer.handle("origin", dispatch.outbound[0].clone()).await;
        assert_eq!(
            kinds(&replies),
            vec![MessageType::SignatureShare, MessageType::ValidationComplete]
        );
        let on_peer = peer.coordinator().get_validation_status(&request_id).unwrap();
        assert_eq!(on_peer.state, ValidationState::Complete);

        // The origin receives the peer's share
        let replies = origin.handle("peer", replies[0].clone()).await;
        assert_eq!(kinds(&replies), vec![MessageType::ValidationComplete]);

        let signatures = origin.coordinator().get_signatures(&request_id).unwrap();
        assert_eq!(signatures.len(), 2);
        assert!(signatures.contains_key(peer.signer_id()));
    }

    #[tokio::test]
    async fn test_repeated_request_not_resigned() {
        let origin = service(1);
        let peer = service(2);
        let dispatch = origin.submit_validation(submission(3)).await.unwrap();

        let first = peer.handle("origin", dispatch.outbound[0].clone()).await;
        assert_eq!(kinds(&first), vec![MessageType::SignatureShare]);
        let second = peer.handle("origin", dispatch.outbound[0].clone()).await;
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn test_forged_share_ignored() {
        let origin = service(1);
        let dispatch = origin.submit_validation(submission(2)).await.unwrap();
        let request_id = dispatch.request.id;

        let forger = Ed25519Signer::from_seed([9; 32]);
        let victim = Ed25519Signer::from_seed([3; 32]);
        let forged = GossipMessage::signature_share(
            &request_id,
            "pay-1",
            "0xfeed",
            victim.signer_id(),
            &forger.sign("0xfeed"),
        );

        assert!(origin.handle("mallory", forged).await.is_empty());
        let status = origin.coordinator().get_validation_status(&request_id).unwrap();
        assert_eq!(status.signature_count(), 1);
    }

    #[tokio::test]
    async fn test_ledger_marks_high_value() {
        let ledger = Arc::new(InMemoryPaymentLedger::new());
        ledger.record_payment("pay-1", 5_000);
        let service = service_with(1, ledger);

        let dispatch = service.submit_validation(submission(2)).await.unwrap();
        assert!(dispatch.request.is_high_value);
        assert_eq!(dispatch.request.required_signatures, 4);
        assert_eq!(dispatch.outbound[0].is_high_value, Some(true));
    }

    #[tokio::test]
    async fn test_sign_known_and_unknown() {
        let origin = service(1);
        let peer = service(2);
        let dispatch = origin.submit_validation(submission(3)).await.unwrap();
        let request_id = dispatch.request.id.clone();

        assert_eq!(
            peer.sign(&request_id, "0xfeed").unwrap_err(),
            ConsensusError::UnknownRequest(request_id.clone())
        );

        // Already signed locally: nothing new to gossip
        let again = origin.sign(&request_id, "0xfeed").unwrap();
        assert!(again.outbound.is_empty());
        assert_eq!(again.request.signature_count(), 1);

        assert_eq!(
            origin.sign(&request_id, "0xbeef").unwrap_err(),
            ConsensusError::DigestMismatch(request_id)
        );
    }

    #[tokio::test]
    async fn test_completed_attestation_committed() {
        let committer = Arc::new(AttestationCommitter::new("http://127.0.0.1:8545"));
        let processor: Arc<dyn BatchProcessor<CompletedAttestation>> = committer.clone();
        let engine = Arc::new(BatchEngine::new(
            BatchConfig {
                max_batch_size: 8,
                flush_timeout: Duration::from_millis(10),
                queue_capacity: 16,
            },
            Some(processor),
        ));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let worker = engine.start(shutdown_rx).unwrap();

        let service = service(1).with_attestation_engine(engine.clone());
        let dispatch = service.submit_validation(submission(1)).await.unwrap();
        assert_eq!(dispatch.request.state, ValidationState::Complete);
        assert_eq!(
            kinds(&dispatch.outbound),
            vec![
                MessageType::ValidationRequest,
                MessageType::SignatureShare,
                MessageType::ValidationComplete
            ]
        );

        shutdown_tx.send(true).unwrap();
        worker.await.unwrap();
        assert_eq!(committer.committed().await, vec![dispatch.request.id]);
    }

    #[tokio::test]
    async fn test_share_without_signature_ignored() {
        let service = service(1);
        let mut message = GossipMessage::signature_share("r", "p", "h", "s", "sig");
        message.signature = None;
        assert!(service.handle("peer", message).await.is_empty());
        assert!(service.coordinator().get_validation_status("r").is_none());
    }
}
