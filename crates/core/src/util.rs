//! Small shared helpers for tags, hashing, hex validation, and timestamps.

use std::time::{SystemTime, UNIX_EPOCH};

use bitcoin::hashes::{Hash, sha256};

/// SHA-256 digest of the input bytes.
pub fn sha256_digest(bytes: &[u8]) -> [u8; 32] {
    sha256::Hash::hash(bytes).to_byte_array()
}

/// Hex-encoded SHA-256 digest of the input bytes.
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(sha256_digest(bytes))
}

/// Current unix timestamp in seconds.
pub fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Check whether a tag with the given label exists.
pub fn has_entry(label: &str, tags: &[Vec<String>]) -> bool {
    tags.iter().any(|tag| tag.first().map(String::as_str) == Some(label))
}

/// Find the first tag with the given label.
pub fn get_entry<'a>(label: &str, tags: &'a [Vec<String>]) -> Option<&'a [String]> {
    tags.iter()
        .find(|tag| tag.first().map(String::as_str) == Some(label))
        .map(|tag| tag.as_slice())
}

/// Check whether a string is even-length hex.
pub fn is_hex(value: &str) -> bool {
    !value.is_empty()
        && value.len() % 2 == 0
        && value.chars().all(|c| c.is_ascii_hexdigit())
}

/// Check whether a string is a 64-char hex digest.
pub fn is_hash(value: &str) -> bool {
    is_hex(value) && value.len() == 64
}
