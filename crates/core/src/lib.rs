//! Protocol-level primitives for the relay client engine.
//!
//! This crate provides the transport-free half of the stack:
//! - Event structure, canonical serialization, signing and verification
//! - Subscription filters and the filter merge
//! - The encrypted content envelope (`<ct>?iv=<iv>`, url-safe base64)
//! - Store secret recovery tags (key-wrap)
//! - The `Signer` seam and a secp256k1-backed default implementation

mod envelope;
mod event;
mod filter;
mod keywrap;
mod signer;
mod util;

pub use envelope::{
    EnvelopeError, IV_SEPARATOR, IV_SIZE, decrypt_content, encrypt_content, is_envelope,
};
pub use event::{
    Event, EventError, UnsignedEvent, event_digest, get_event_id, serialize_event, validate_event,
    validate_unsigned_event, verify_event,
};
pub use filter::{Filter, combine_filters};
pub use keywrap::{KeyWrapError, REC_TAG, check_store_key, decrypt_store_key, wrap_store_key};
pub use signer::{Keys, Signer, SignerError};
pub use util::{get_entry, has_entry, is_hash, is_hex, now, sha256_digest, sha256_hex};
