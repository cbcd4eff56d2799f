//! Event structure and signing flow.
//!
//! Implements the canonical event tuple, content-addressed event ids,
//! Schnorr signing and verification:
//! - Event structure (id, pubkey, created_at, kind, tags, content, sig)
//! - Canonical serialization for hashing: `[0, pubkey, created_at, kind, tags, content]`
//! - Signature verification against relay-supplied material

use bitcoin::hashes::{Hash, sha256};
use bitcoin::key::Secp256k1;
use bitcoin::secp256k1::{Message, XOnlyPublicKey, schnorr};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur while building or verifying events.
#[derive(Debug, Error)]
pub enum EventError {
    #[error("invalid event: {0}")]
    InvalidEvent(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("verification error: {0}")]
    Verification(String),
}

/// A signed event, immutable once signed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// 32-byte lowercase hex sha256 of the canonical serialization
    pub id: String,
    /// 32-byte lowercase hex public key of the author
    pub pubkey: String,
    /// Unix timestamp in seconds
    pub created_at: u64,
    /// Event kind (integer category)
    pub kind: u16,
    /// Ordered array of string arrays; order matters, tags are not a map
    pub tags: Vec<Vec<String>>,
    /// Arbitrary string content, possibly an encrypted envelope
    pub content: String,
    /// 64-byte lowercase hex Schnorr signature over `id`
    pub sig: String,
}

/// An event before signing. Carries the author pubkey; `id` and `sig`
/// are attached by the signing flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsignedEvent {
    pub pubkey: String,
    pub created_at: u64,
    pub kind: u16,
    pub tags: Vec<Vec<String>>,
    pub content: String,
}

impl UnsignedEvent {
    /// Attach a precomputed id and signature, producing a signed event.
    pub fn into_signed(self, id: String, sig: String) -> Event {
        Event {
            id,
            pubkey: self.pubkey,
            created_at: self.created_at,
            kind: self.kind,
            tags: self.tags,
            content: self.content,
            sig,
        }
    }
}

impl Event {
    /// View of the signed event's unsigned fields, for digest recomputation.
    pub fn unsigned(&self) -> UnsignedEvent {
        UnsignedEvent {
            pubkey: self.pubkey.clone(),
            created_at: self.created_at,
            kind: self.kind,
            tags: self.tags.clone(),
            content: self.content.clone(),
        }
    }
}

/// Serialize an unsigned event for hashing.
///
/// Format: `[0, pubkey, created_at, kind, tags, content]` with no extra
/// whitespace.
pub fn serialize_event(event: &UnsignedEvent) -> Result<String, EventError> {
    if !validate_unsigned_event(event) {
        return Err(EventError::InvalidEvent(
            "can't serialize event with wrong or missing properties".to_string(),
        ));
    }

    serde_json::to_string(&(
        0,
        &event.pubkey,
        event.created_at,
        event.kind,
        &event.tags,
        &event.content,
    ))
    .map_err(|e| EventError::Serialization(e.to_string()))
}

/// Compute the 32-byte digest of the canonical serialization.
pub fn event_digest(event: &UnsignedEvent) -> Result<[u8; 32], EventError> {
    let serialized = serialize_event(event)?;
    let hash = sha256::Hash::hash(serialized.as_bytes());
    Ok(hash.to_byte_array())
}

/// Get the event hash (id) as lowercase hex.
pub fn get_event_id(event: &UnsignedEvent) -> Result<String, EventError> {
    Ok(hex::encode(event_digest(event)?))
}

/// Validate an unsigned event structure.
pub fn validate_unsigned_event(event: &UnsignedEvent) -> bool {
    if event.pubkey.len() != 64 {
        return false;
    }
    if !event.pubkey.chars().all(|c| c.is_ascii_hexdigit()) {
        return false;
    }
    if event.pubkey != event.pubkey.to_lowercase() {
        return false;
    }
    true
}

/// Validate a signed event's shape (not the signature itself).
pub fn validate_event(event: &Event) -> bool {
    if event.id.len() != 64 || !event.id.chars().all(|c| c.is_ascii_hexdigit()) {
        return false;
    }
    if event.pubkey.len() != 64 || !event.pubkey.chars().all(|c| c.is_ascii_hexdigit()) {
        return false;
    }
    if event.pubkey != event.pubkey.to_lowercase() {
        return false;
    }
    if event.sig.len() != 128 || !event.sig.chars().all(|c| c.is_ascii_hexdigit()) {
        return false;
    }
    true
}

/// Verify an event's id and signature.
///
/// The id must equal the recomputed digest of the canonical tuple, and the
/// signature must verify against the id under the author pubkey.
pub fn verify_event(event: &Event) -> Result<bool, EventError> {
    if !validate_event(event) {
        return Ok(false);
    }

    let computed_id = get_event_id(&event.unsigned())?;
    if computed_id != event.id {
        return Ok(false);
    }

    let secp = Secp256k1::verification_only();

    let id_bytes = hex::decode(&event.id)
        .map_err(|e| EventError::Verification(format!("invalid id hex: {}", e)))?;
    let message = Message::from_digest_slice(&id_bytes)
        .map_err(|e| EventError::Verification(format!("invalid message: {}", e)))?;

    let sig_bytes = hex::decode(&event.sig)
        .map_err(|e| EventError::Verification(format!("invalid sig hex: {}", e)))?;
    let sig = schnorr::Signature::from_slice(&sig_bytes)
        .map_err(|e| EventError::Verification(format!("invalid signature: {}", e)))?;

    let pubkey_bytes = hex::decode(&event.pubkey)
        .map_err(|e| EventError::Verification(format!("invalid pubkey hex: {}", e)))?;
    let pubkey = XOnlyPublicKey::from_slice(&pubkey_bytes)
        .map_err(|e| EventError::Verification(format!("invalid pubkey: {}", e)))?;

    Ok(secp.verify_schnorr(&sig, &message, &pubkey).is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signer::{Keys, Signer};

    const TEST_PRIVATE_KEY: &str =
        "d217c1ff2f8a65c3e3a1740db3b9f58b8c848bb45e26d00ed4714e4a0f4ceecf";

    fn test_keys() -> Keys {
        Keys::from_hex(TEST_PRIVATE_KEY).unwrap()
    }

    fn sign(unsigned: UnsignedEvent, keys: &Keys) -> Event {
        let digest = event_digest(&unsigned).unwrap();
        let id = hex::encode(digest);
        let sig = keys.sign(&digest).unwrap();
        unsigned.into_signed(id, sig)
    }

    #[test]
    fn test_serialize_event_canonical() {
        let keys = test_keys();
        let unsigned = UnsignedEvent {
            pubkey: keys.pubkey(),
            created_at: 1617932115,
            kind: 1,
            tags: vec![],
            content: "Hello, world!".to_string(),
        };

        let serialized = serialize_event(&unsigned).unwrap();
        let expected = format!("[0,\"{}\",1617932115,1,[],\"Hello, world!\"]", keys.pubkey());
        assert_eq!(serialized, expected);
    }

    #[test]
    fn test_serialize_event_invalid_pubkey() {
        let unsigned = UnsignedEvent {
            pubkey: "invalid".to_string(),
            created_at: 1617932115,
            kind: 1,
            tags: vec![],
            content: "Hello".to_string(),
        };
        assert!(serialize_event(&unsigned).is_err());
    }

    #[test]
    fn test_sign_and_verify_round_trip() {
        let keys = test_keys();
        let unsigned = UnsignedEvent {
            pubkey: keys.pubkey(),
            created_at: 1617932115,
            kind: 1,
            tags: vec![vec!["d".to_string(), "topic".to_string()]],
            content: "Hello, world!".to_string(),
        };

        let event = sign(unsigned, &keys);
        assert_eq!(event.id.len(), 64);
        assert_eq!(event.sig.len(), 128);
        assert!(verify_event(&event).unwrap());
    }

    #[test]
    fn test_content_flip_changes_id_and_breaks_sig() {
        let keys = test_keys();
        let unsigned = UnsignedEvent {
            pubkey: keys.pubkey(),
            created_at: 1617932115,
            kind: 1,
            tags: vec![],
            content: "Hello, world!".to_string(),
        };

        let mut event = sign(unsigned, &keys);
        let original_id = event.id.clone();

        event.content = "Hello, world?".to_string();
        let new_id = get_event_id(&event.unsigned()).unwrap();
        assert_ne!(original_id, new_id);

        // Prior id no longer matches the tuple, so verification fails.
        assert!(!verify_event(&event).unwrap());

        // Even with the id recomputed, the prior sig no longer verifies.
        event.id = new_id;
        assert!(!verify_event(&event).unwrap());
    }

    #[test]
    fn test_verify_rejects_tampered_sig() {
        let keys = test_keys();
        let unsigned = UnsignedEvent {
            pubkey: keys.pubkey(),
            created_at: 1617932115,
            kind: 1,
            tags: vec![],
            content: "Hello".to_string(),
        };

        let mut event = sign(unsigned, &keys);
        let mut sig: Vec<char> = event.sig.chars().collect();
        sig[0] = if sig[0] == '6' { '7' } else { '6' };
        event.sig = sig.into_iter().collect();

        assert!(!verify_event(&event).unwrap());
    }

    #[test]
    fn test_verify_rejects_wrong_pubkey() {
        let keys = test_keys();
        let other = Keys::generate();

        let unsigned = UnsignedEvent {
            pubkey: keys.pubkey(),
            created_at: 1617932115,
            kind: 1,
            tags: vec![],
            content: "Hello".to_string(),
        };

        let mut event = sign(unsigned, &keys);
        event.pubkey = other.pubkey();
        assert!(!verify_event(&event).unwrap());
    }

    #[test]
    fn test_deterministic_event_id() {
        let keys = test_keys();
        let unsigned = UnsignedEvent {
            pubkey: keys.pubkey(),
            created_at: 1617932115,
            kind: 1,
            tags: vec![],
            content: "Hello, world!".to_string(),
        };

        assert_eq!(
            get_event_id(&unsigned).unwrap(),
            get_event_id(&unsigned).unwrap()
        );
    }

    #[test]
    fn test_event_json_round_trip() {
        let keys = test_keys();
        let unsigned = UnsignedEvent {
            pubkey: keys.pubkey(),
            created_at: 1617932115,
            kind: 30000,
            tags: vec![vec!["t".to_string(), "nostr".to_string()]],
            content: "round trip".to_string(),
        };

        let event = sign(unsigned, &keys);
        let json = serde_json::to_string(&event).unwrap();
        let event2: Event = serde_json::from_str(&json).unwrap();

        assert_eq!(event, event2);
        assert!(verify_event(&event2).unwrap());
    }
}
