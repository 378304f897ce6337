//! Validator Coordinator - owns in-flight validation requests
//!
//! Share aggregation is a set union keyed by signer identity; quorum is
//! checked after every insert. Deadlines are checked when a share arrives
//! and by a periodic sweep, never with a timer per request.

use crate::error::{ConsensusError, ConsensusResult};
use crate::types::{
    CoordinatorConfig, NewValidation, ShareOutcome, SignatureShare, ValidationRequest,
    ValidationState,
};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Result of admitting a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
    /// Current state of the request
    pub request: ValidationRequest,
    /// False when the id was already known (nothing was changed)
    pub newly_admitted: bool,
    /// True when held-back shares completed the request on admission
    pub completed: bool,
}

/// A share received before its request
#[derive(Debug, Clone)]
struct DeferredShare {
    message_hash: String,
    share: SignatureShare,
}

#[derive(Default)]
struct RequestTable {
    requests: HashMap<String, ValidationRequest>,
    deferred: HashMap<String, Vec<DeferredShare>>,
    deferred_count: usize,
}

/// Coordinates threshold signing for validation requests
pub struct Coordinator {
    config: CoordinatorConfig,
    table: RwLock<RequestTable>,
}

impl Coordinator {
    /// Create a new coordinator
    pub fn new(config: CoordinatorConfig) -> Self {
        Self {
            config,
            table: RwLock::new(RequestTable::default()),
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Quorum for a request: the requested count (or the default), raised
    /// by the configured multiplier for high-value payments
    pub fn required_quorum(&self, requested: u32, is_high_value: bool) -> u32 {
        let base = if requested > 0 {
            requested
        } else {
            self.config.default_quorum
        };
        let quorum = if is_high_value {
            base.saturating_mul(self.config.high_value_multiplier)
        } else {
            base
        };
        quorum.max(1)
    }

    /// Admit a request if unknown. Resubmitting a known id returns the
    /// existing request untouched.
    pub fn process_validation_request(&self, new: NewValidation) -> ConsensusResult<Admission> {
        self.process_validation_request_at(new, Utc::now())
    }

    fn process_validation_request_at(
        &self,
        new: NewValidation,
        now: DateTime<Utc>,
    ) -> ConsensusResult<Admission> {
        if new.request_id.is_empty() {
            return Err(ConsensusError::InvalidRequest("empty request id".to_string()));
        }
        if new.payment_id.is_empty() {
            return Err(ConsensusError::InvalidRequest("empty payment id".to_string()));
        }
        if new.message_hash.is_empty() {
            return Err(ConsensusError::InvalidRequest("empty message hash".to_string()));
        }

        let required = self.required_quorum(new.required_signatures, new.is_high_value);
        let deadline = now + to_chrono(self.config.validation_window);

        let mut table = self.table.write();
        if let Some(existing) = table.requests.get(&new.request_id) {
            return Ok(Admission {
                request: existing.clone(),
                newly_admitted: false,
                completed: false,
            });
        }

        let mut request = ValidationRequest {
            id: new.request_id.clone(),
            payment_id: new.payment_id,
            message_hash: new.message_hash,
            required_signatures: required,
            is_high_value: new.is_high_value,
            created_at: now,
            deadline,
            state: ValidationState::Pending,
            shares: BTreeMap::new(),
            completed_at: None,
        };

        let mut completed = false;
        for held in table.take_deferred(&new.request_id) {
            if held.message_hash != request.message_hash {
                tracing::debug!(
                    "Dropping held share from {} for {}: digest mismatch",
                    held.share.signer,
                    request.id
                );
                continue;
            }
            if let ShareOutcome::Completed(_) = apply_share(&mut request, held.share, now) {
                completed = true;
            }
        }

        tracing::info!(
            "Admitted validation {} for payment {} (quorum {}{}, deadline {})",
            request.id,
            request.payment_id,
            required,
            if request.is_high_value { ", high value" } else { "" },
            request.deadline
        );

        table.requests.insert(request.id.clone(), request.clone());

        Ok(Admission {
            request,
            newly_admitted: true,
            completed,
        })
    }

    /// Offer a signer's share for a request
    pub fn add_signature(
        &self,
        request_id: &str,
        message_hash: &str,
        signer: &str,
        signature: &str,
    ) -> ConsensusResult<ShareOutcome> {
        self.add_signature_at(request_id, message_hash, signer, signature, Utc::now())
    }

    fn add_signature_at(
        &self,
        request_id: &str,
        message_hash: &str,
        signer: &str,
        signature: &str,
        now: DateTime<Utc>,
    ) -> ConsensusResult<ShareOutcome> {
        let share = SignatureShare {
            signer: signer.to_string(),
            signature: signature.to_string(),
            received_at: now,
        };

        let mut table = self.table.write();
        match table.requests.get_mut(request_id) {
            Some(request) => {
                if request.message_hash != message_hash {
                    return Err(ConsensusError::DigestMismatch(request_id.to_string()));
                }
                Ok(apply_share(request, share, now))
            }
            None => {
                let limit = self.config.max_deferred_shares;
                if table.defer(request_id, message_hash, share, limit) {
                    Ok(ShareOutcome::Deferred)
                } else {
                    Err(ConsensusError::UnknownRequest(request_id.to_string()))
                }
            }
        }
    }

    /// Snapshot of a request
    pub fn get_validation_status(&self, request_id: &str) -> Option<ValidationRequest> {
        self.table.read().requests.get(request_id).cloned()
    }

    /// Signer -> signature map of a request
    pub fn get_signatures(&self, request_id: &str) -> Option<BTreeMap<String, String>> {
        self.table
            .read()
            .requests
            .get(request_id)
            .map(ValidationRequest::signatures)
    }

    /// Number of requests still collecting shares
    pub fn pending_count(&self) -> usize {
        self.table
            .read()
            .requests
            .values()
            .filter(|r| r.state == ValidationState::Pending)
            .count()
    }

    /// Number of tracked requests in any state
    pub fn len(&self) -> usize {
        self.table.read().requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.read().requests.is_empty()
    }

    /// Move every pending request past its deadline to `expired`
    pub fn expire_overdue(&self) -> Vec<String> {
        self.expire_overdue_at(Utc::now())
    }

    fn expire_overdue_at(&self, now: DateTime<Utc>) -> Vec<String> {
        let mut table = self.table.write();
        let mut expired = Vec::new();
        for request in table.requests.values_mut() {
            if request.state == ValidationState::Pending && request.is_past_deadline(now) {
                request.state = ValidationState::Expired;
                expired.push(request.id.clone());
            }
        }
        for id in &expired {
            tracing::info!("Validation {} expired without quorum", id);
        }
        expired
    }

    /// Forget terminal requests and held shares older than the retention window
    fn prune_finished_at(&self, now: DateTime<Utc>) -> usize {
        let retention = to_chrono(self.config.retention);
        let mut table = self.table.write();

        let before = table.requests.len();
        table
            .requests
            .retain(|_, r| !(r.state.is_terminal() && now > r.deadline + retention));
        let pruned = before - table.requests.len();

        let mut dropped = 0;
        table.deferred.retain(|_, held| {
            held.retain(|h| now <= h.share.received_at + retention);
            dropped += held.len();
            !held.is_empty()
        });
        table.deferred_count = dropped;

        pruned
    }

    /// Periodically expire overdue requests and prune old ones until shutdown
    pub async fn run_sweeper(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.sweep_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let now = Utc::now();
                    self.expire_overdue_at(now);
                    let pruned = self.prune_finished_at(now);
                    if pruned > 0 {
                        tracing::debug!("Pruned {} finished validations", pruned);
                    }
                }
                _ = shutdown.changed() => break,
            }
        }

        tracing::debug!("Validation sweeper stopped");
    }
}

impl RequestTable {
    fn defer(&mut self, request_id: &str, message_hash: &str, share: SignatureShare, limit: usize) -> bool {
        let held = self.deferred.entry(request_id.to_string()).or_default();
        if held.iter().any(|h| h.share.signer == share.signer) {
            return true;
        }
        if self.deferred_count >= limit {
            if held.is_empty() {
                self.deferred.remove(request_id);
            }
            return false;
        }
        held.push(DeferredShare {
            message_hash: message_hash.to_string(),
            share,
        });
        self.deferred_count += 1;
        true
    }

    fn take_deferred(&mut self, request_id: &str) -> Vec<DeferredShare> {
        let held = self.deferred.remove(request_id).unwrap_or_default();
        self.deferred_count = self.deferred_count.saturating_sub(held.len());
        held
    }
}

/// Add a share to a request and advance its state
fn apply_share(request: &mut ValidationRequest, share: SignatureShare, now: DateTime<Utc>) -> ShareOutcome {
    match request.state {
        ValidationState::Complete => return ShareOutcome::AlreadyComplete,
        ValidationState::Expired => return ShareOutcome::Expired,
        ValidationState::Pending => {}
    }

    if request.is_past_deadline(now) {
        request.state = ValidationState::Expired;
        tracing::info!("Validation {} expired without quorum", request.id);
        return ShareOutcome::Expired;
    }

    if request.has_signed(&share.signer) {
        return ShareOutcome::Duplicate;
    }

    tracing::debug!(
        "Share from {} for {} ({}/{})",
        share.signer,
        request.id,
        request.shares.len() + 1,
        request.required_signatures
    );
    request.shares.insert(share.signer.clone(), share);

    if request.quorum_reached() {
        request.state = ValidationState::Complete;
        request.completed_at = Some(now);
        tracing::info!(
            "Validation {} complete with {} signatures",
            request.id,
            request.shares.len()
        );
        return ShareOutcome::Completed(Box::new(request.clone()));
    }

    ShareOutcome::Accepted {
        signatures: request.shares.len(),
        required: request.required_signatures,
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(365))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coordinator() -> Coordinator {
        Coordinator::new(CoordinatorConfig {
            validation_window: Duration::from_secs(60),
            ..Default::default()
        })
    }

    fn new_validation(id: &str, required: u32, high_value: bool) -> NewValidation {
        NewValidation {
            request_id: id.to_string(),
            payment_id: format!("pay-{}", id),
            message_hash: "0xabc".to_string(),
            required_signatures: required,
            is_high_value: high_value,
        }
    }

    #[test]
    fn test_quorum_policy() {
        let coordinator = coordinator();
        assert_eq!(coordinator.required_quorum(3, false), 3);
        assert_eq!(coordinator.required_quorum(3, true), 6);
        assert_eq!(coordinator.required_quorum(0, false), 2);
        assert_eq!(coordinator.required_quorum(0, true), 4);

        let single = Coordinator::new(CoordinatorConfig {
            default_quorum: 0,
            ..Default::default()
        });
        assert_eq!(single.required_quorum(0, false), 1);
    }

    #[test]
    fn test_two_signers_complete_request() {
        let coordinator = coordinator();
        let admission = coordinator
            .process_validation_request(new_validation("1", 2, false))
            .unwrap();
        assert!(admission.newly_admitted);
        assert_eq!(admission.request.signature_count(), 0);
        assert_eq!(admission.request.required_signatures, 2);

        let outcome = coordinator.add_signature("1", "0xabc", "A", "sig-a").unwrap();
        assert_eq!(outcome, ShareOutcome::Accepted { signatures: 1, required: 2 });
        assert_eq!(coordinator.pending_count(), 1);

        let outcome = coordinator.add_signature("1", "0xabc", "B", "sig-b").unwrap();
        let ShareOutcome::Completed(done) = outcome else {
            panic!("expected completion, got {:?}", outcome);
        };
        assert_eq!(done.state, ValidationState::Complete);
        assert_eq!(done.signature_count(), 2);

        // A second share from A changes nothing
        let outcome = coordinator.add_signature("1", "0xabc", "A", "sig-a2").unwrap();
        assert_eq!(outcome, ShareOutcome::AlreadyComplete);

        let status = coordinator.get_validation_status("1").unwrap();
        assert_eq!(status.state, ValidationState::Complete);
        assert_eq!(status.signature_count(), 2);
        let signatures = coordinator.get_signatures("1").unwrap();
        assert_eq!(signatures.get("A").map(String::as_str), Some("sig-a"));
        assert_eq!(signatures.get("B").map(String::as_str), Some("sig-b"));
        assert_eq!(coordinator.pending_count(), 0);
    }

    #[test]
    fn test_duplicate_signer_counts_once() {
        let coordinator = coordinator();
        coordinator
            .process_validation_request(new_validation("1", 3, false))
            .unwrap();

        coordinator.add_signature("1", "0xabc", "A", "s1").unwrap();
        let outcome = coordinator.add_signature("1", "0xabc", "A", "s2").unwrap();
        assert_eq!(outcome, ShareOutcome::Duplicate);

        let status = coordinator.get_validation_status("1").unwrap();
        assert_eq!(status.signature_count(), 1);
        assert_eq!(status.shares["A"].signature, "s1");
        assert_eq!(status.state, ValidationState::Pending);
    }

    #[test]
    fn test_resubmission_keeps_shares() {
        let coordinator = coordinator();
        coordinator
            .process_validation_request(new_validation("1", 2, false))
            .unwrap();
        coordinator.add_signature("1", "0xabc", "A", "sig-a").unwrap();

        let again = coordinator
            .process_validation_request(new_validation("1", 5, true))
            .unwrap();
        assert!(!again.newly_admitted);
        assert_eq!(again.request.required_signatures, 2);
        assert_eq!(again.request.signature_count(), 1);
        assert_eq!(coordinator.len(), 1);
    }

    #[test]
    fn test_high_value_raises_quorum() {
        let coordinator = coordinator();
        coordinator
            .process_validation_request(new_validation("hv", 2, true))
            .unwrap();

        for signer in ["A", "B", "C"] {
            let outcome = coordinator.add_signature("hv", "0xabc", signer, "s").unwrap();
            assert!(matches!(outcome, ShareOutcome::Accepted { required: 4, .. }));
        }
        let outcome = coordinator.add_signature("hv", "0xabc", "D", "s").unwrap();
        assert!(matches!(outcome, ShareOutcome::Completed(_)));
    }

    #[test]
    fn test_share_after_deadline_rejected() {
        let coordinator = coordinator();
        let admission = coordinator
            .process_validation_request(new_validation("1", 2, false))
            .unwrap();
        coordinator.add_signature("1", "0xabc", "A", "sig-a").unwrap();

        // Still queryable before the deadline
        let status = coordinator.get_validation_status("1").unwrap();
        assert_eq!(status.state, ValidationState::Pending);

        let late = admission.request.deadline + chrono::Duration::seconds(1);
        let outcome = coordinator
            .add_signature_at("1", "0xabc", "B", "sig-b", late)
            .unwrap();
        assert_eq!(outcome, ShareOutcome::Expired);

        let status = coordinator.get_validation_status("1").unwrap();
        assert_eq!(status.state, ValidationState::Expired);
        assert_eq!(status.signature_count(), 1);

        let outcome = coordinator.add_signature("1", "0xabc", "C", "sig-c").unwrap();
        assert_eq!(outcome, ShareOutcome::Expired);
    }

    #[test]
    fn test_sweep_expires_overdue() {
        let coordinator = coordinator();
        let admission = coordinator
            .process_validation_request(new_validation("slow", 2, false))
            .unwrap();
        coordinator
            .process_validation_request(new_validation("fast", 1, false))
            .unwrap();
        coordinator.add_signature("fast", "0xabc", "A", "s").unwrap();

        let after = admission.request.deadline + chrono::Duration::seconds(1);
        assert_eq!(coordinator.expire_overdue_at(after), vec!["slow".to_string()]);
        assert_eq!(
            coordinator.get_validation_status("slow").unwrap().state,
            ValidationState::Expired
        );
        assert_eq!(
            coordinator.get_validation_status("fast").unwrap().state,
            ValidationState::Complete
        );
        assert!(coordinator.expire_overdue_at(after).is_empty());
    }

    #[test]
    fn test_prune_after_retention() {
        let coordinator = Coordinator::new(CoordinatorConfig {
            validation_window: Duration::from_secs(60),
            retention: Duration::from_secs(600),
            ..Default::default()
        });
        let admission = coordinator
            .process_validation_request(new_validation("1", 2, false))
            .unwrap();
        let deadline = admission.request.deadline;

        coordinator.expire_overdue_at(deadline + chrono::Duration::seconds(1));
        assert_eq!(coordinator.prune_finished_at(deadline + chrono::Duration::seconds(60)), 0);
        assert!(coordinator.get_validation_status("1").is_some());

        assert_eq!(coordinator.prune_finished_at(deadline + chrono::Duration::seconds(601)), 1);
        assert!(coordinator.get_validation_status("1").is_none());
    }

    #[test]
    fn test_early_shares_replayed_on_admission() {
        let coordinator = coordinator();

        let outcome = coordinator.add_signature("1", "0xabc", "A", "sig-a").unwrap();
        assert_eq!(outcome, ShareOutcome::Deferred);
        coordinator.add_signature("1", "0xother", "B", "sig-b").unwrap();
        assert!(coordinator.get_validation_status("1").is_none());

        let admission = coordinator
            .process_validation_request(new_validation("1", 2, false))
            .unwrap();
        assert_eq!(admission.request.signature_count(), 1);
        assert!(admission.request.has_signed("A"));
        assert!(!admission.completed);

        let outcome = coordinator.add_signature("1", "0xabc", "C", "sig-c").unwrap();
        assert!(matches!(outcome, ShareOutcome::Completed(_)));
    }

    #[test]
    fn test_deferred_shares_can_complete_on_admission() {
        let coordinator = coordinator();
        coordinator.add_signature("1", "0xabc", "A", "sig-a").unwrap();

        let admission = coordinator
            .process_validation_request(new_validation("1", 1, false))
            .unwrap();
        assert!(admission.completed);
        assert_eq!(admission.request.state, ValidationState::Complete);
    }

    #[test]
    fn test_deferred_buffer_is_bounded() {
        let coordinator = Coordinator::new(CoordinatorConfig {
            max_deferred_shares: 1,
            ..Default::default()
        });
        assert_eq!(
            coordinator.add_signature("x", "h", "A", "s").unwrap(),
            ShareOutcome::Deferred
        );
        assert_eq!(
            coordinator.add_signature("y", "h", "A", "s"),
            Err(ConsensusError::UnknownRequest("y".to_string()))
        );
    }

    #[test]
    fn test_digest_mismatch_rejected() {
        let coordinator = coordinator();
        coordinator
            .process_validation_request(new_validation("1", 2, false))
            .unwrap();
        assert_eq!(
            coordinator.add_signature("1", "0xdef", "A", "s"),
            Err(ConsensusError::DigestMismatch("1".to_string()))
        );
    }

    #[test]
    fn test_invalid_request_rejected() {
        let coordinator = coordinator();
        let mut bad = new_validation("1", 2, false);
        bad.message_hash.clear();
        assert!(matches!(
            coordinator.process_validation_request(bad),
            Err(ConsensusError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_signer_count_never_exceeds_quorum_while_pending() {
        let coordinator = coordinator();
        coordinator
            .process_validation_request(new_validation("1", 3, false))
            .unwrap();

        for (i, signer) in ["A", "B", "C", "D", "E"].iter().enumerate() {
            coordinator.add_signature("1", "0xabc", signer, "s").unwrap();
            let status = coordinator.get_validation_status("1").unwrap();
            if status.state == ValidationState::Pending {
                assert!(status.signature_count() < 3);
            } else {
                assert_eq!(status.signature_count(), 3.min(i + 1));
            }
        }
    }
}
