//! Node Configuration

use anyhow::Context;
use attest_consensus::CoordinatorConfig;
use attest_network::NetworkConfig;
use batch_engine::BatchConfig;
use chain_bridge::InMemoryPaymentLedger;
use gateway::GatewayConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// Node configuration, loadable from a JSON file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Gateway bind address
    pub http_addr: String,
    /// Peer listener bind address
    pub p2p_addr: String,
    /// Peers dialed at startup
    pub bootstrap_peers: Vec<String>,
    /// Passphrase for a deterministic signing key (random key if unset)
    pub key_seed: Option<String>,
    pub default_quorum: u32,
    pub high_value_multiplier: u32,
    /// Payments worth at least this much are high value. Only payments
    /// listed in `known_payments` have a value; others rely on the request flag.
    pub high_value_threshold: u64,
    /// Payment id -> value, loaded into the payment ledger at startup
    pub known_payments: BTreeMap<String, u64>,
    pub validation_window_secs: u64,
    pub min_stake: u64,
    /// Chain RPC URL attestations are committed through
    pub chain_rpc_url: String,
    /// Attestation contract (not deployed yet)
    pub attestation_contract: Option<String>,
    pub attestation_batch_size: usize,
    pub attestation_flush_ms: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        let coordinator = CoordinatorConfig::default();
        let batch = BatchConfig::default();
        Self {
            http_addr: GatewayConfig::default().http_addr,
            p2p_addr: NetworkConfig::default().listen_addr,
            bootstrap_peers: Vec::new(),
            key_seed: None,
            default_quorum: coordinator.default_quorum,
            high_value_multiplier: coordinator.high_value_multiplier,
            high_value_threshold: 1_000_000,
            known_payments: BTreeMap::new(),
            validation_window_secs: coordinator.validation_window.as_secs(),
            min_stake: 1,
            chain_rpc_url: "http://127.0.0.1:8545".to_string(),
            attestation_contract: None,
            attestation_batch_size: batch.max_batch_size,
            attestation_flush_ms: batch.flush_timeout.as_millis() as u64,
        }
    }
}

impl NodeConfig {
    /// Read a JSON config file; missing fields take their defaults
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))
    }

    /// Payment ledger seeded with `known_payments`
    pub fn payment_ledger(&self) -> InMemoryPaymentLedger {
        let ledger = InMemoryPaymentLedger::new();
        for (payment_id, value) in &self.known_payments {
            ledger.record_payment(payment_id, *value);
        }
        ledger
    }

    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            default_quorum: self.default_quorum,
            high_value_multiplier: self.high_value_multiplier,
            validation_window: Duration::from_secs(self.validation_window_secs),
            ..Default::default()
        }
    }

    pub fn network_config(&self) -> NetworkConfig {
        NetworkConfig {
            listen_addr: self.p2p_addr.clone(),
            bootstrap_peers: self.bootstrap_peers.clone(),
            ..Default::default()
        }
    }

    pub fn batch_config(&self) -> BatchConfig {
        BatchConfig {
            max_batch_size: self.attestation_batch_size,
            flush_timeout: Duration::from_millis(self.attestation_flush_ms),
            ..Default::default()
        }
    }

    pub fn gateway_config(&self) -> GatewayConfig {
        GatewayConfig {
            http_addr: self.http_addr.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chain_bridge::PaymentLedger;

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: NodeConfig =
            serde_json::from_str(r#"{"p2p_addr":"0.0.0.0:9100","high_value_multiplier":3}"#).unwrap();

        assert_eq!(config.p2p_addr, "0.0.0.0:9100");
        assert_eq!(config.high_value_multiplier, 3);
        assert_eq!(config.http_addr, NodeConfig::default().http_addr);
        assert_eq!(config.coordinator_config().high_value_multiplier, 3);
        assert_eq!(config.network_config().listen_addr, "0.0.0.0:9100");
    }

    #[test]
    fn test_window_maps_to_coordinator() {
        let config = NodeConfig {
            validation_window_secs: 42,
            ..Default::default()
        };
        assert_eq!(config.coordinator_config().validation_window, Duration::from_secs(42));
    }

    #[tokio::test]
    async fn test_known_payments_seed_ledger() {
        let config: NodeConfig = serde_json::from_str(
            r#"{"high_value_threshold":500,"known_payments":{"pay-big":800,"pay-small":20}}"#,
        )
        .unwrap();

        let ledger = config.payment_ledger();
        assert_eq!(ledger.len(), 2);
        assert!(ledger.is_high_value("pay-big", config.high_value_threshold).await.unwrap());
        assert!(!ledger.is_high_value("pay-small", config.high_value_threshold).await.unwrap());
        assert!(!ledger.is_high_value("pay-other", config.high_value_threshold).await.unwrap());
    }

    #[test]
    fn test_missing_file_is_error() {
        assert!(NodeConfig::load(Path::new("/nonexistent/attest-node.json")).is_err());
    }
}
