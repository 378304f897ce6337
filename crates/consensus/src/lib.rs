//! Attestation Consensus - threshold signing of payment attestations
//!
//! Architecture:
//! - The coordinator tracks every validation request and the shares collected for it
//! - A request completes once distinct signers reach its quorum, or expires at its deadline
//! - A periodic sweep expires overdue requests and prunes old ones
//! - The validator service signs locally, verifies peer shares and turns
//!   gossip into coordinator calls

pub mod coordinator;
pub mod error;
pub mod service;
pub mod signer;
pub mod types;

pub use coordinator::{Admission, Coordinator};
pub use error::{ConsensusError, ConsensusResult};
pub use service::{Dispatch, ValidationSubmission, ValidatorService};
pub use signer::{digest, verify_share, Ed25519Signer, Signer};
pub use types::*;
