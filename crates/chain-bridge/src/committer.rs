//! Attestation Committer - hands completed attestations to the chain
//!
//! Runs as the processing function of a batch engine so attestations are
//! submitted in groups. The attestation contract is not deployed yet, so a
//! commit currently records the batch and reports success per item.

use async_trait::async_trait;
use batch_engine::{BatchError, BatchProcessor, EngineResult, ItemOutcome};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use tokio::sync::RwLock;

/// A validation request that reached quorum
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompletedAttestation {
    pub request_id: String,
    pub payment_id: String,
    pub message_hash: String,
    /// Signer identity -> signature
    pub signatures: BTreeMap<String, String>,
    pub completed_at: DateTime<Utc>,
}

/// Commits attestations to the attestation contract (stub implementation)
pub struct AttestationCommitter {
    /// Chain RPC URL (stored for future use)
    rpc_url: String,
    /// Attestation contract address (not deployed yet)
    contract_address: Option<String>,
    /// Request ids of every committed attestation, in commit order
    committed: RwLock<Vec<String>>,
    /// Number of commit calls made
    batches: RwLock<u64>,
}

impl AttestationCommitter {
    /// Create a new committer
    pub fn new(rpc_url: &str) -> Self {
        Self {
            rpc_url: rpc_url.to_string(),
            contract_address: None,
            committed: RwLock::new(Vec::new()),
            batches: RwLock::new(0),
        }
    }

    /// Set the attestation contract address
    pub fn with_contract(mut self, address: &str) -> Self {
        self.contract_address = Some(address.to_string());
        self
    }

    /// Get the RPC URL
    pub fn rpc_url(&self) -> &str {
        &self.rpc_url
    }

    /// Commit a batch of attestations (stub - contract not deployed)
    ///
    /// An attestation without signatures can never be accepted on chain and
    /// is reported as failed; the rest of the batch still goes through.
    pub async fn commit(&self, attestations: &[CompletedAttestation]) -> Vec<ItemOutcome> {
        let outcomes: Vec<ItemOutcome> = attestations
            .iter()
            .map(|a| {
                if a.signatures.is_empty() {
                    Err(format!("attestation {} has no signatures", a.request_id))
                } else {
                    Ok(())
                }
            })
            .collect();

        let mut committed = self.committed.write().await;
        for (attestation, outcome) in attestations.iter().zip(&outcomes) {
            if outcome.is_ok() {
                committed.push(attestation.request_id.clone());
            }
        }
        *self.batches.write().await += 1;

        tracing::debug!(
            "Would commit {} attestations to {} (contract {:?} not deployed)",
            committed.len(),
            self.rpc_url,
            self.contract_address
        );

        outcomes
    }

    /// Request ids committed so far
    pub async fn committed(&self) -> Vec<String> {
        self.committed.read().await.clone()
    }

    /// Number of commit batches
    pub async fn batch_count(&self) -> u64 {
        *self.batches.read().await
    }
}

#[async_trait]
impl BatchProcessor<CompletedAttestation> for AttestationCommitter {
    async fn process(&self, items: Vec<CompletedAttestation>) -> EngineResult<Vec<ItemOutcome>> {
        if self.rpc_url.is_empty() {
            return Err(BatchError::Processing("no chain RPC configured".to_string()));
        }
        Ok(self.commit(&items).await)
    }
}
