//! Core types for validation requests and signature shares

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Lifecycle of a validation request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationState {
    /// Collecting signature shares
    Pending,
    /// Quorum reached
    Complete,
    /// Deadline passed without quorum
    Expired,
}

impl ValidationState {
    /// Terminal states accept no further shares
    pub fn is_terminal(self) -> bool {
        !matches!(self, ValidationState::Pending)
    }
}

/// One validator's signature over a request digest
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SignatureShare {
    /// Signer identity
    pub signer: String,
    /// Encoded signature
    pub signature: String,
    /// When this node received the share
    pub received_at: DateTime<Utc>,
}

/// Input for admitting a validation request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewValidation {
    pub request_id: String,
    pub payment_id: String,
    pub message_hash: String,
    /// Requested signature count; 0 means the configured default
    pub required_signatures: u32,
    pub is_high_value: bool,
}

/// A payment awaiting threshold attestation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationRequest {
    pub id: String,
    pub payment_id: String,
    /// Digest every validator signs
    pub message_hash: String,
    /// Quorum: distinct signers needed for completion
    pub required_signatures: u32,
    pub is_high_value: bool,
    pub created_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    pub state: ValidationState,
    /// Shares keyed by signer identity
    pub shares: BTreeMap<String, SignatureShare>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ValidationRequest {
    /// Number of distinct signers so far
    pub fn signature_count(&self) -> usize {
        self.shares.len()
    }

    pub fn quorum_reached(&self) -> bool {
        self.shares.len() as u64 >= self.required_signatures as u64
    }

    pub fn is_past_deadline(&self, now: DateTime<Utc>) -> bool {
        now > self.deadline
    }

    pub fn has_signed(&self, signer: &str) -> bool {
        self.shares.contains_key(signer)
    }

    /// Signer -> signature map
    pub fn signatures(&self) -> BTreeMap<String, String> {
        self.shares
            .iter()
            .map(|(signer, share)| (signer.clone(), share.signature.clone()))
            .collect()
    }
}

/// Result of offering a share to the coordinator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShareOutcome {
    /// Share recorded, quorum not yet reached
    Accepted { signatures: usize, required: u32 },
    /// Share recorded and the request just reached quorum
    Completed(Box<ValidationRequest>),
    /// This signer already contributed
    Duplicate,
    /// The request is already complete
    AlreadyComplete,
    /// The request's deadline passed
    Expired,
    /// The request is not known yet; the share is held until it arrives
    Deferred,
}

/// Configuration for the validator coordinator
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Quorum used when a request does not ask for one
    pub default_quorum: u32,
    /// Quorum multiplier for high-value payments
    pub high_value_multiplier: u32,
    /// Time from admission to deadline
    pub validation_window: Duration,
    /// How often overdue requests are expired
    pub sweep_interval: Duration,
    /// How long terminal requests stay queryable after their deadline
    pub retention: Duration,
    /// Maximum shares held for requests not yet admitted
    pub max_deferred_shares: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            default_quorum: 2,
            high_value_multiplier: 2,
            validation_window: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(10),
            retention: Duration::from_secs(3600),
            max_deferred_shares: 1024,
        }
    }
}
