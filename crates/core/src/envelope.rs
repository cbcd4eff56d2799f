//! Encrypted content envelope.
//!
//! Envelope format: `<ciphertext, url-safe base64>?iv=<iv, url-safe base64>`.
//! The cipher primitive is XChaCha20-Poly1305; this module owns only the
//! envelope encoding and iv handling.

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chacha20poly1305::{
    XChaCha20Poly1305,
    aead::{Aead, KeyInit},
};
use rand::RngCore;
use thiserror::Error;

/// Size of the envelope iv (XChaCha20 nonce, 24 bytes).
pub const IV_SIZE: usize = 24;

/// Separator between ciphertext and iv in the envelope encoding.
pub const IV_SEPARATOR: &str = "?iv=";

/// Errors that can occur while opening or sealing an envelope.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("content is not an encrypted envelope")]
    NotAnEnvelope,

    #[error("invalid base64: {0}")]
    InvalidBase64(String),

    #[error("invalid iv length: expected {IV_SIZE}, got {0}")]
    InvalidIv(usize),

    #[error("encryption failed: {0}")]
    Encryption(String),

    #[error("decryption failed: {0}")]
    Decryption(String),

    #[error("invalid utf8 in plaintext: {0}")]
    InvalidUtf8(String),
}

/// Check whether a content string carries the envelope marker.
///
/// Cheap shape test only; decryption may still fail.
pub fn is_envelope(content: &str) -> bool {
    content.contains(IV_SEPARATOR)
}

/// Seal a plaintext under a 32-byte secret with a fresh random iv.
pub fn encrypt_content(plaintext: &str, secret: &[u8; 32]) -> Result<String, EnvelopeError> {
    let mut iv = [0u8; IV_SIZE];
    rand::rng().fill_bytes(&mut iv);

    let cipher = XChaCha20Poly1305::new(secret.into());
    let ciphertext = cipher
        .encrypt(&iv.into(), plaintext.as_bytes())
        .map_err(|e| EnvelopeError::Encryption(e.to_string()))?;

    Ok(format!(
        "{}{}{}",
        URL_SAFE_NO_PAD.encode(&ciphertext),
        IV_SEPARATOR,
        URL_SAFE_NO_PAD.encode(iv)
    ))
}

/// Open an envelope under a 32-byte secret, returning the plaintext.
pub fn decrypt_content(content: &str, secret: &[u8; 32]) -> Result<String, EnvelopeError> {
    let (enc, iv_enc) = content
        .split_once(IV_SEPARATOR)
        .ok_or(EnvelopeError::NotAnEnvelope)?;

    let ciphertext = URL_SAFE_NO_PAD
        .decode(enc)
        .map_err(|e| EnvelopeError::InvalidBase64(e.to_string()))?;
    let iv_bytes = URL_SAFE_NO_PAD
        .decode(iv_enc)
        .map_err(|e| EnvelopeError::InvalidBase64(e.to_string()))?;

    let iv: [u8; IV_SIZE] = iv_bytes
        .try_into()
        .map_err(|v: Vec<u8>| EnvelopeError::InvalidIv(v.len()))?;

    let cipher = XChaCha20Poly1305::new(secret.into());
    let plaintext = cipher
        .decrypt(&iv.into(), ciphertext.as_ref())
        .map_err(|e| EnvelopeError::Decryption(e.to_string()))?;

    String::from_utf8(plaintext).map_err(|e| EnvelopeError::InvalidUtf8(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secret() -> [u8; 32] {
        [42u8; 32]
    }

    #[test]
    fn test_round_trip() {
        for plaintext in ["", "hello", "{\"a\":1}", "unicode ✓ content"] {
            let sealed = encrypt_content(plaintext, &secret()).unwrap();
            assert!(is_envelope(&sealed));
            assert_eq!(decrypt_content(&sealed, &secret()).unwrap(), plaintext);
        }
    }

    #[test]
    fn test_fresh_iv_per_encryption() {
        let a = encrypt_content("same plaintext", &secret()).unwrap();
        let b = encrypt_content("same plaintext", &secret()).unwrap();
        assert_ne!(a, b);

        let iv_a = a.split_once(IV_SEPARATOR).unwrap().1;
        let iv_b = b.split_once(IV_SEPARATOR).unwrap().1;
        assert_ne!(iv_a, iv_b);
    }

    #[test]
    fn test_wrong_key_fails() {
        let sealed = encrypt_content("payload", &secret()).unwrap();
        let result = decrypt_content(&sealed, &[7u8; 32]);
        assert!(matches!(result, Err(EnvelopeError::Decryption(_))));
    }

    #[test]
    fn test_not_an_envelope() {
        assert!(!is_envelope("plain text"));
        let result = decrypt_content("plain text", &secret());
        assert!(matches!(result, Err(EnvelopeError::NotAnEnvelope)));
    }

    #[test]
    fn test_truncated_iv_rejected() {
        let sealed = encrypt_content("payload", &secret()).unwrap();
        let (ct, _) = sealed.split_once(IV_SEPARATOR).unwrap();
        let mangled = format!("{}{}{}", ct, IV_SEPARATOR, URL_SAFE_NO_PAD.encode([1u8; 8]));
        assert!(matches!(
            decrypt_content(&mangled, &secret()),
            Err(EnvelopeError::InvalidIv(8))
        ));
    }
}
