//! The signing seam.
//!
//! The engine never implements signature or HMAC algorithms inline; it calls
//! a [`Signer`] and verifies signatures against relay-supplied material. The
//! [`Keys`] type is the default implementation backed by a secp256k1 keypair.

use bitcoin::key::Secp256k1;
use bitcoin::secp256k1::{Keypair, Message, SecretKey};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Errors raised by a signer implementation.
#[derive(Debug, Error)]
pub enum SignerError {
    #[error("invalid secret key: {0}")]
    InvalidKey(String),

    #[error("signing failed: {0}")]
    Signing(String),
}

/// Capabilities supplied by an external signer: a public key, a signing
/// function over an opaque 32-byte digest, and a keyed commitment (HMAC).
pub trait Signer: Send + Sync {
    /// Lowercase hex x-only public key (64 chars).
    fn pubkey(&self) -> String;

    /// Sign a 32-byte message digest, returning a lowercase hex signature.
    fn sign(&self, digest: &[u8; 32]) -> Result<String, SignerError>;

    /// Keyed commitment over an arbitrary message.
    fn hmac(&self, message: &[u8]) -> [u8; 32];
}

/// In-memory secp256k1 keypair implementing [`Signer`] with Schnorr
/// signatures and HMAC-SHA256 keyed by the secret key.
#[derive(Clone)]
pub struct Keys {
    secret: [u8; 32],
    pubkey: String,
}

impl Keys {
    /// Build from 32 raw secret key bytes.
    pub fn new(secret: [u8; 32]) -> Result<Self, SignerError> {
        let secp = Secp256k1::new();
        let sk =
            SecretKey::from_slice(&secret).map_err(|e| SignerError::InvalidKey(e.to_string()))?;
        let (xonly, _parity) = sk.x_only_public_key(&secp);
        Ok(Self {
            secret,
            pubkey: hex::encode(xonly.serialize()),
        })
    }

    /// Build from a 64-char hex secret key.
    pub fn from_hex(secret: &str) -> Result<Self, SignerError> {
        let bytes = hex::decode(secret).map_err(|e| SignerError::InvalidKey(e.to_string()))?;
        let secret: [u8; 32] = bytes
            .try_into()
            .map_err(|_| SignerError::InvalidKey("secret key must be 32 bytes".to_string()))?;
        Self::new(secret)
    }

    /// Generate a fresh random keypair.
    pub fn generate() -> Self {
        loop {
            let mut secret = [0u8; 32];
            rand::rng().fill_bytes(&mut secret);
            // Retry on the negligible chance the bytes are out of range.
            if let Ok(keys) = Self::new(secret) {
                return keys;
            }
        }
    }

    /// Raw secret key bytes.
    pub fn secret_bytes(&self) -> &[u8; 32] {
        &self.secret
    }
}

impl Signer for Keys {
    fn pubkey(&self) -> String {
        self.pubkey.clone()
    }

    fn sign(&self, digest: &[u8; 32]) -> Result<String, SignerError> {
        let secp = Secp256k1::new();
        let sk =
            SecretKey::from_slice(&self.secret).map_err(|e| SignerError::Signing(e.to_string()))?;
        let keypair = Keypair::from_secret_key(&secp, &sk);
        let message = Message::from_digest_slice(digest)
            .map_err(|e| SignerError::Signing(e.to_string()))?;
        let sig = secp.sign_schnorr_no_aux_rand(&message, &keypair);
        Ok(hex::encode(sig.serialize()))
    }

    fn hmac(&self, message: &[u8]) -> [u8; 32] {
        // new_from_slice accepts any key length for HMAC.
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .unwrap_or_else(|_| unreachable!("hmac accepts any key length"));
        mac.update(message);
        mac.finalize().into_bytes().into()
    }
}

impl std::fmt::Debug for Keys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keys").field("pubkey", &self.pubkey).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_keys() {
        let keys = Keys::generate();
        assert_eq!(keys.pubkey().len(), 64);
        assert!(keys.pubkey().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_pubkey_deterministic() {
        let keys = Keys::generate();
        let again = Keys::new(*keys.secret_bytes()).unwrap();
        assert_eq!(keys.pubkey(), again.pubkey());
    }

    #[test]
    fn test_from_hex_rejects_bad_length() {
        assert!(Keys::from_hex("abcd").is_err());
        assert!(Keys::from_hex("zz").is_err());
    }

    #[test]
    fn test_hmac_deterministic_and_keyed() {
        let a = Keys::generate();
        let b = Keys::generate();

        let msg = b"commitment input";
        assert_eq!(a.hmac(msg), a.hmac(msg));
        assert_ne!(a.hmac(msg), b.hmac(msg));
        assert_ne!(a.hmac(msg), a.hmac(b"other input"));
    }

    #[test]
    fn test_sign_produces_hex_signature() {
        let keys = Keys::generate();
        let sig = keys.sign(&[7u8; 32]).unwrap();
        assert_eq!(sig.len(), 128);
    }
}
