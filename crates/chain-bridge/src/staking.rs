//! Stake Registry - validator registration against the staking contract
//!
//! Registration here only records intent; locking stake on chain is the
//! staking contract's job.

use crate::error::{BridgeError, BridgeResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;

/// A validator's registration
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Registration {
    pub node_id: String,
    pub stake: u64,
    pub registered_at: DateTime<Utc>,
}

/// Access to the staking contract
#[async_trait]
pub trait StakeRegistry: Send + Sync {
    /// Register `node_id` with `stake`
    async fn register(&self, node_id: &str, stake: u64) -> BridgeResult<Registration>;

    /// Current registration for `node_id`, if any
    fn registration(&self, node_id: &str) -> Option<Registration>;
}

/// Stake registry that records registrations locally
pub struct LocalStakeRegistry {
    /// Smallest stake accepted
    min_stake: u64,
    registrations: RwLock<HashMap<String, Registration>>,
}

impl LocalStakeRegistry {
    pub fn new(min_stake: u64) -> Self {
        Self {
            min_stake: min_stake.max(1),
            registrations: RwLock::new(HashMap::new()),
        }
    }

    pub fn min_stake(&self) -> u64 {
        self.min_stake
    }
}

#[async_trait]
impl StakeRegistry for LocalStakeRegistry {
    async fn register(&self, node_id: &str, stake: u64) -> BridgeResult<Registration> {
        if stake < self.min_stake {
            return Err(BridgeError::InvalidStake {
                stake,
                minimum: self.min_stake,
            });
        }

        let mut registrations = self.registrations.write();
        if registrations.contains_key(node_id) {
            return Err(BridgeError::AlreadyRegistered(node_id.to_string()));
        }

        let registration = Registration {
            node_id: node_id.to_string(),
            stake,
            registered_at: Utc::now(),
        };
        registrations.insert(node_id.to_string(), registration.clone());

        tracing::info!("Recorded registration of {} with stake {}", node_id, stake);
        Ok(registration)
    }

    fn registration(&self, node_id: &str) -> Option<Registration> {
        self.registrations.read().get(node_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_register_once() {
        let registry = LocalStakeRegistry::new(100);

        let registration = registry.register("node-a", 250).await.unwrap();
        assert_eq!(registration.stake, 250);
        assert_eq!(registry.registration("node-a"), Some(registration));

        assert_eq!(
            registry.register("node-a", 500).await,
            Err(BridgeError::AlreadyRegistered("node-a".to_string()))
        );
    }

    #[tokio::test]
    async fn test_stake_below_minimum_rejected() {
        let registry = LocalStakeRegistry::new(100);

        assert_eq!(
            registry.register("node-a", 0).await,
            Err(BridgeError::InvalidStake { stake: 0, minimum: 100 })
        );
        assert!(registry.registration("node-a").is_none());
    }
}
