//! Request signing.
//!
//! The HMAC arm generalizes `BinanceClient::sign_request` (`binance/client.rs`)
//! out of the client struct into its own pure value. ED25519 and RSA are new
//! arms of the same contract so the rest of the core can treat all three
//! schemes identically (`enum Signer` per the polymorphic-signers note).

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use ed25519_dalek::pkcs8::DecodePrivateKey as _;
use ed25519_dalek::{Signature as EdSignature, Signer as _, SigningKey};
use hmac::{Hmac, Mac};
use rsa::pkcs1::DecodeRsaPrivateKey as _;
use rsa::pkcs1v15::SigningKey as RsaSigningKey;
use rsa::pkcs8::DecodePrivateKey as _;
use rsa::sha2::Sha256 as RsaSha256;
use rsa::signature::{SignatureEncoding, Signer as _};
use rsa::RsaPrivateKey;
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

#[derive(Error, Debug)]
pub enum SignerError {
    #[error("invalid HMAC key material: {0}")]
    InvalidHmacKey(String),
    #[error("invalid ED25519 key: {0}")]
    InvalidEd25519Key(String),
    #[error("invalid RSA key: {0}")]
    InvalidRsaKey(String),
}

/// Signature scheme selected in the client's key-material configuration.
///
/// Construction-time failures (malformed key, unreadable key file) are
/// reported by the constructors below, not by `sign`; once built, signing is
/// infallible, pure, and safe to call from any thread.
pub enum Signer {
    Hmac(HmacSigner),
    Ed25519(Box<SigningKey>),
    Rsa(Box<RsaSigningKey<RsaSha256>>),
}

pub struct HmacSigner {
    secret: Vec<u8>,
}

impl Signer {
    pub fn hmac(secret: impl AsRef<[u8]>) -> Result<Self, SignerError> {
        // Validated eagerly so a bad secret surfaces at construction, not on
        // the first signed request.
        HmacSha256::new_from_slice(secret.as_ref())
            .map_err(|e| SignerError::InvalidHmacKey(e.to_string()))?;
        Ok(Signer::Hmac(HmacSigner {
            secret: secret.as_ref().to_vec(),
        }))
    }

    /// `pem` is a PKCS#8 ED25519 private key.
    pub fn ed25519_from_pem(pem: &str) -> Result<Self, SignerError> {
        let key = SigningKey::from_pkcs8_pem(pem)
            .map_err(|e| SignerError::InvalidEd25519Key(e.to_string()))?;
        Ok(Signer::Ed25519(Box::new(key)))
    }

    /// `pem` is a PKCS#1 or PKCS#8 RSA private key.
    pub fn rsa_from_pem(pem: &str) -> Result<Self, SignerError> {
        let key = RsaPrivateKey::from_pkcs8_pem(pem)
            .or_else(|_| RsaPrivateKey::from_pkcs1_pem(pem))
            .map_err(|e| SignerError::InvalidRsaKey(e.to_string()))?;
        Ok(Signer::Rsa(Box::new(RsaSigningKey::<RsaSha256>::new(key))))
    }

    /// Signs the canonical query string. HMAC output is lowercase hex;
    /// ED25519 and RSA-over-SHA256 output is base64.
    pub fn sign(&self, message: &str) -> String {
        match self {
            Signer::Hmac(signer) => {
                let mut mac = HmacSha256::new_from_slice(&signer.secret)
                    .expect("validated at construction");
                mac.update(message.as_bytes());
                hex::encode(mac.finalize().into_bytes())
            }
            Signer::Ed25519(key) => {
                let sig: EdSignature = key.sign(message.as_bytes());
                BASE64.encode(sig.to_bytes())
            }
            Signer::Rsa(key) => {
                let sig = key.sign(message.as_bytes());
                BASE64.encode(sig.to_vec())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hmac_sign_is_deterministic() {
        let signer = Signer::hmac("secret-key").unwrap();
        let a = signer.sign("symbol=BTCUSDT&timestamp=1");
        let b = signer.sign("symbol=BTCUSDT&timestamp=1");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64); // hex-encoded SHA-256 digest
    }

    #[test]
    fn hmac_sign_differs_per_message() {
        let signer = Signer::hmac("secret-key").unwrap();
        assert_ne!(signer.sign("a=1"), signer.sign("a=2"));
    }

    #[test]
    fn rejects_malformed_ed25519_pem() {
        assert!(Signer::ed25519_from_pem("not a pem").is_err());
    }

    #[test]
    fn rejects_malformed_rsa_pem() {
        assert!(Signer::rsa_from_pem("not a pem").is_err());
    }
}
