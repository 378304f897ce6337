//! Chain Bridge - on-chain collaborators of the validator network
//!
//! Handles communication with the payment chain:
//! - Reading payment values to decide whether a payment is high value
//! - Recording stake registration for this validator
//! - Committing completed attestations back on chain
//!
//! The contracts are not reachable from here yet; each adapter keeps its
//! state locally behind a trait so a chain client can replace it.

pub mod committer;
pub mod error;
pub mod ledger;
pub mod staking;

pub use committer::{AttestationCommitter, CompletedAttestation};
pub use error::{BridgeError, BridgeResult};
pub use ledger::{InMemoryPaymentLedger, PaymentLedger};
pub use staking::{LocalStakeRegistry, Registration, StakeRegistry};
