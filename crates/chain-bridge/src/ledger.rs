//! Payment Ledger - reads payment state from the payment contract
//!
//! The payment contract is the source of truth for whether a payment exists
//! and what it is worth. The validator only needs the value, to decide if a
//! payment falls in the high-value tier.

use crate::error::BridgeResult;
use async_trait::async_trait;
use dashmap::DashMap;

/// Read access to the on-chain payment contract
#[async_trait]
pub trait PaymentLedger: Send + Sync {
    /// Value of a payment in base units, or `None` if the payment is unknown
    async fn payment_value(&self, payment_id: &str) -> BridgeResult<Option<u64>>;

    /// Check if a payment meets the high-value threshold
    async fn is_high_value(&self, payment_id: &str, threshold: u64) -> BridgeResult<bool> {
        Ok(self
            .payment_value(payment_id)
            .await?
            .is_some_and(|value| value >= threshold))
    }
}

/// Payment ledger backed by a local map (until a chain client is wired in)
#[derive(Default)]
pub struct InMemoryPaymentLedger {
    payments: DashMap<String, u64>,
}

impl InMemoryPaymentLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a payment observed on chain
    pub fn record_payment(&self, payment_id: &str, value: u64) {
        self.payments.insert(payment_id.to_string(), value);
    }

    pub fn len(&self) -> usize {
        self.payments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payments.is_empty()
    }
}

#[async_trait]
impl PaymentLedger for InMemoryPaymentLedger {
    async fn payment_value(&self, payment_id: &str) -> BridgeResult<Option<u64>> {
        Ok(self.payments.get(payment_id).map(|v| *v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_high_value_threshold() {
        let ledger = InMemoryPaymentLedger::new();
        ledger.record_payment("pay-small", 999);
        ledger.record_payment("pay-large", 1_000);

        assert!(!ledger.is_high_value("pay-small", 1_000).await.unwrap());
        assert!(ledger.is_high_value("pay-large", 1_000).await.unwrap());
        assert!(!ledger.is_high_value("pay-unknown", 1_000).await.unwrap());
    }
}
