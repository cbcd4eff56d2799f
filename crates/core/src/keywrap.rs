//! Store key recovery tags.
//!
//! Lets a signer recover a store's symmetric topic secret from public relay
//! data without ever transmitting the secret in recoverable plaintext.
//!
//! Scheme: `hmac = signer.hmac(sha256(content))`; the secret is sealed under
//! `hmac` as the symmetric key, and `["rec", hex(sha256(hmac)), ciphertext]`
//! rides on the event. Only the signer that produced the same keyed
//! commitment can re-derive `hmac` and open the tag.

use bitcoin::hashes::{Hash, sha256};
use thiserror::Error;

use crate::envelope::{EnvelopeError, decrypt_content, encrypt_content};
use crate::event::Event;
use crate::signer::Signer;
use crate::util::get_entry;

/// Label of the recovery tag.
pub const REC_TAG: &str = "rec";

/// Errors that can occur while recovering a store secret.
#[derive(Debug, Error)]
pub enum KeyWrapError {
    #[error("event has no recovery tag")]
    MissingTag,

    #[error("recovery tag is malformed")]
    MalformedTag,

    #[error("recovery tag commitment does not match signer")]
    CommitmentMismatch,

    #[error("envelope error: {0}")]
    Envelope(#[from] EnvelopeError),

    #[error("recovered secret has wrong length: {0}")]
    InvalidSecret(usize),
}

fn derive_wrap_key(content: &str, signer: &dyn Signer) -> [u8; 32] {
    let digest = sha256::Hash::hash(content.as_bytes());
    signer.hmac(digest.as_byte_array())
}

fn commitment_hex(wrap_key: &[u8; 32]) -> String {
    hex::encode(sha256::Hash::hash(wrap_key).to_byte_array())
}

/// Build the recovery tag for a store event.
///
/// `content` is the event content the tag will ride on; the commitment is
/// bound to it, so the tag must be built after the content is final.
pub fn wrap_store_key(
    secret: &[u8; 32],
    content: &str,
    signer: &dyn Signer,
) -> Result<Vec<String>, KeyWrapError> {
    let wrap_key = derive_wrap_key(content, signer);
    let ciphertext = encrypt_content(&hex::encode(secret), &wrap_key)?;
    Ok(vec![
        REC_TAG.to_string(),
        commitment_hex(&wrap_key),
        ciphertext,
    ])
}

/// Pure predicate: does this event carry a recovery tag produced by this
/// signer? No decryption is attempted; this is the cheap pre-filter for
/// candidate events in listings.
pub fn check_store_key(event: &Event, signer: &dyn Signer) -> bool {
    let Some(tag) = get_entry(REC_TAG, &event.tags) else {
        return false;
    };
    if tag.len() < 3 {
        return false;
    }
    let wrap_key = derive_wrap_key(&event.content, signer);
    tag[1] == commitment_hex(&wrap_key)
}

/// Recover the 32-byte topic secret from an event's recovery tag.
pub fn decrypt_store_key(event: &Event, signer: &dyn Signer) -> Result<[u8; 32], KeyWrapError> {
    let tag = get_entry(REC_TAG, &event.tags).ok_or(KeyWrapError::MissingTag)?;
    if tag.len() < 3 {
        return Err(KeyWrapError::MalformedTag);
    }

    let wrap_key = derive_wrap_key(&event.content, signer);
    if tag[1] != commitment_hex(&wrap_key) {
        return Err(KeyWrapError::CommitmentMismatch);
    }

    let secret_hex = decrypt_content(&tag[2], &wrap_key)?;
    let bytes = hex::decode(&secret_hex)
        .map_err(|_| KeyWrapError::InvalidSecret(secret_hex.len()))?;
    bytes
        .try_into()
        .map_err(|v: Vec<u8>| KeyWrapError::InvalidSecret(v.len()))
}
