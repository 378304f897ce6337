//! Share signing
//!
//! Validators sign a domain-separated digest of the request's message hash.
//! Signer identities are bs58 Ed25519 public keys; signatures travel as base64.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use ed25519_dalek::{Signature, Signer as _, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;

const DIGEST_CONTEXT: &[u8] = b"payment-attestation-v1:";
const PASSPHRASE_CONTEXT: &str = "payment-attestation validator key v1";

/// Produces and checks signature shares
pub trait Signer: Send + Sync {
    /// Identity announced with every share
    fn signer_id(&self) -> &str;

    /// Sign a request's message hash
    fn sign(&self, message_hash: &str) -> String;

    /// Check another validator's share
    fn verify(&self, signer_id: &str, message_hash: &str, signature: &str) -> bool;
}

/// Bytes actually covered by a share signature
pub fn digest(message_hash: &str) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(DIGEST_CONTEXT);
    hasher.update(message_hash.as_bytes());
    *hasher.finalize().as_bytes()
}

/// Ed25519 signer
pub struct Ed25519Signer {
    key: SigningKey,
    id: String,
}

impl Ed25519Signer {
    /// Fresh random key
    pub fn generate() -> Self {
        Self::from_key(SigningKey::generate(&mut OsRng))
    }

    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self::from_key(SigningKey::from_bytes(&seed))
    }

    /// Deterministic key derived from a passphrase
    pub fn from_passphrase(passphrase: &str) -> Self {
        Self::from_seed(blake3::derive_key(PASSPHRASE_CONTEXT, passphrase.as_bytes()))
    }

    fn from_key(key: SigningKey) -> Self {
        let id = bs58::encode(key.verifying_key().as_bytes()).into_string();
        Self { key, id }
    }
}

impl Signer for Ed25519Signer {
    fn signer_id(&self) -> &str {
        &self.id
    }

    fn sign(&self, message_hash: &str) -> String {
        let signature = self.key.sign(&digest(message_hash));
        STANDARD.encode(signature.to_bytes())
    }

    fn verify(&self, signer_id: &str, message_hash: &str, signature: &str) -> bool {
        verify_share(signer_id, message_hash, signature)
    }
}

/// Check a share against the public key encoded in its signer id
pub fn verify_share(signer_id: &str, message_hash: &str, signature: &str) -> bool {
    let Some(key) = decode_key(signer_id) else {
        return false;
    };
    let Ok(bytes) = STANDARD.decode(signature) else {
        return false;
    };
    let Ok(signature) = Signature::from_slice(&bytes) else {
        return false;
    };
    key.verify(&digest(message_hash), &signature).is_ok()
}

fn decode_key(signer_id: &str) -> Option<VerifyingKey> {
    let bytes = bs58::decode(signer_id).into_vec().ok()?;
    let bytes: [u8; 32] = bytes.try_into().ok()?;
    VerifyingKey::from_bytes(&bytes).ok()
}
