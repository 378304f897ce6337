//! Gossip wire schema
//!
//! Every frame on a peer connection is one JSON object:
//! `{type, request_id, payment_id, message_hash, signature?, signer?, timestamp}`.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Gossip message kind
///
/// Tags this node does not understand decode to [`MessageType::Unknown`] so
/// that the dispatch loop can reject them without dropping the connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MessageType {
    ValidationRequest,
    SignatureShare,
    ValidationComplete,
    Unknown(String),
}

impl MessageType {
    pub fn as_str(&self) -> &str {
        match self {
            MessageType::ValidationRequest => "validation_request",
            MessageType::SignatureShare => "signature_share",
            MessageType::ValidationComplete => "validation_complete",
            MessageType::Unknown(tag) => tag,
        }
    }
}

impl From<String> for MessageType {
    fn from(tag: String) -> Self {
        match tag.as_str() {
            "validation_request" => MessageType::ValidationRequest,
            "signature_share" => MessageType::SignatureShare,
            "validation_complete" => MessageType::ValidationComplete,
            _ => MessageType::Unknown(tag),
        }
    }
}

impl From<MessageType> for String {
    fn from(kind: MessageType) -> Self {
        match kind {
            MessageType::Unknown(tag) => tag,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A message exchanged between validators
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GossipMessage {
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub request_id: String,
    pub payment_id: String,
    pub message_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signer: Option<String>,
    /// Quorum requested by the originator (validation_request only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_signatures: Option<u32>,
    /// High-value flag set by the originator (validation_request only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_high_value: Option<bool>,
    /// Unix millis
    pub timestamp: i64,
}

impl GossipMessage {
    fn new(kind: MessageType, request_id: &str, payment_id: &str, message_hash: &str) -> Self {
        Self {
            kind,
            request_id: request_id.to_string(),
            payment_id: payment_id.to_string(),
            message_hash: message_hash.to_string(),
            signature: None,
            signer: None,
            required_signatures: None,
            is_high_value: None,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Ask peers to attest a payment
    pub fn validation_request(
        request_id: &str,
        payment_id: &str,
        message_hash: &str,
        required_signatures: u32,
        is_high_value: bool,
    ) -> Self {
        let mut msg = Self::new(
            MessageType::ValidationRequest,
            request_id,
            payment_id,
            message_hash,
        );
        msg.required_signatures = Some(required_signatures);
        msg.is_high_value = Some(is_high_value);
        msg
    }

    /// One validator's signature over a request digest
    pub fn signature_share(
        request_id: &str,
        payment_id: &str,
        message_hash: &str,
        signer: &str,
        signature: &str,
    ) -> Self {
        let mut msg = Self::new(
            MessageType::SignatureShare,
            request_id,
            payment_id,
            message_hash,
        );
        msg.signer = Some(signer.to_string());
        msg.signature = Some(signature.to_string());
        msg
    }

    /// Notice that a request reached quorum
    pub fn validation_complete(request_id: &str, payment_id: &str, message_hash: &str) -> Self {
        Self::new(
            MessageType::ValidationComplete,
            request_id,
            payment_id,
            message_hash,
        )
    }

    /// Serialize for network transmission
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from network
    pub fn from_slice(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signature_share_wire_shape() {
        let msg = GossipMessage::signature_share("req-1", "pay-1", "abcd", "signer-a", "sig");
        let value: serde_json::Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();

        assert_eq!(value["type"], "signature_share");
        assert_eq!(value["request_id"], "req-1");
        assert_eq!(value["signer"], "signer-a");
        assert_eq!(value["signature"], "sig");
        assert!(value.get("required_signatures").is_none());
        assert!(value["timestamp"].as_i64().unwrap() > 0);
    }

    #[test]
    fn test_unknown_type_decodes() {
        let raw = br#"{"type":"gossip_v9","request_id":"r","payment_id":"p","message_hash":"h","timestamp":1}"#;
        let msg = GossipMessage::from_slice(raw).unwrap();
        assert_eq!(msg.kind, MessageType::Unknown("gossip_v9".to_string()));
        assert_eq!(msg.kind.to_string(), "gossip_v9");
    }

    #[test]
    fn test_missing_fields_rejected() {
        let raw = br#"{"type":"signature_share","request_id":"r"}"#;
        assert!(GossipMessage::from_slice(raw).is_err());
    }

    #[test]
    fn test_validation_request_carries_quorum() {
        let msg = GossipMessage::validation_request("r", "p", "h", 3, true);
        let decoded = GossipMessage::from_slice(msg.to_json().unwrap().as_bytes()).unwrap();
        assert_eq!(decoded.kind, MessageType::ValidationRequest);
        assert_eq!(decoded.required_signatures, Some(3));
        assert_eq!(decoded.is_high_value, Some(true));
    }
}
