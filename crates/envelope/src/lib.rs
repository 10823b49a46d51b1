//! # Credential Envelope
//!
//! Authenticated encryption for exchange secrets at rest. Every secret is
//! sealed with AES-256-GCM under the master key supplied by the embedding
//! environment, with a fresh random 96-bit IV per call and a 128-bit tag.
//!
//! An [`Envelope`] keeps the IV, ciphertext and tag as separate byte strings
//! plus an algorithm identifier, so the stored format can be versioned.
//! Any tampering, truncation or wrong key makes [`open`] fail with
//! [`EnvelopeError::Decryption`]; corrupted plaintext is never returned.
//!
//! This crate performs no I/O.

use aes_gcm::{
    aead::{AeadInPlace, KeyInit},
    Aes256Gcm, Nonce, Tag,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub mod error;

pub use error::EnvelopeError;

pub const KEY_LENGTH: usize = 32;
pub const IV_LENGTH: usize = 12;
pub const TAG_LENGTH: usize = 16;

/// Identifies how an envelope was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EnvelopeAlgorithm {
    #[serde(rename = "aes-256-gcm/v1")]
    Aes256GcmV1,
}

impl EnvelopeAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvelopeAlgorithm::Aes256GcmV1 => "aes-256-gcm/v1",
        }
    }
}

impl FromStr for EnvelopeAlgorithm {
    type Err = EnvelopeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "aes-256-gcm/v1" => Ok(EnvelopeAlgorithm::Aes256GcmV1),
            other => Err(EnvelopeError::UnsupportedAlgorithm(other.to_string())),
        }
    }
}

/// The 256-bit key every envelope is sealed under. Read-only once loaded.
#[derive(Clone)]
pub struct MasterKey([u8; KEY_LENGTH]);

impl MasterKey {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        let key: [u8; KEY_LENGTH] = bytes
            .try_into()
            .map_err(|_| EnvelopeError::InvalidKeyLength(bytes.len()))?;
        Ok(Self(key))
    }

    /// Decodes a base64 key as it is stored in the environment.
    pub fn from_base64(encoded: &str) -> Result<Self, EnvelopeError> {
        let bytes = BASE64
            .decode(encoded.trim())
            .map_err(|e| EnvelopeError::InvalidKeyEncoding(e.to_string()))?;
        Self::from_bytes(&bytes)
    }

    /// Draws a fresh key from the OS random source.
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_LENGTH];
        rand::rngs::OsRng.fill_bytes(&mut key);
        Self(key)
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(self.0)
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(&self.0.into())
    }
}

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MasterKey(<redacted>)")
    }
}

/// An authenticated ciphertext bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub algorithm: EnvelopeAlgorithm,
    pub iv: Vec<u8>,
    pub ciphertext: Vec<u8>,
    pub auth_tag: Vec<u8>,
}

/// Seals `plaintext` under `key` without associated data.
pub fn seal(plaintext: &[u8], key: &MasterKey) -> Result<Envelope, EnvelopeError> {
    seal_with_context(plaintext, key, &[])
}

/// Opens an envelope produced by [`seal`].
pub fn open(envelope: &Envelope, key: &MasterKey) -> Result<Vec<u8>, EnvelopeError> {
    open_with_context(envelope, key, &[])
}

/// Seals `plaintext`, binding it to `context` as associated data.
///
/// The same context must be supplied to [`open_with_context`]. The vault uses
/// it to tie an envelope to its owner and field so two envelopes cannot be
/// swapped between records.
pub fn seal_with_context(
    plaintext: &[u8],
    key: &MasterKey,
    context: &[u8],
) -> Result<Envelope, EnvelopeError> {
    let mut iv = [0u8; IV_LENGTH];
    rand::rngs::OsRng.fill_bytes(&mut iv);

    let mut buffer = plaintext.to_vec();
    let tag = key
        .cipher()
        .encrypt_in_place_detached(Nonce::from_slice(&iv), context, &mut buffer)
        .map_err(|_| EnvelopeError::Encryption)?;

    Ok(Envelope {
        algorithm: EnvelopeAlgorithm::Aes256GcmV1,
        iv: iv.to_vec(),
        ciphertext: buffer,
        auth_tag: tag.to_vec(),
    })
}

/// Opens an envelope sealed with [`seal_with_context`].
pub fn open_with_context(
    envelope: &Envelope,
    key: &MasterKey,
    context: &[u8],
) -> Result<Vec<u8>, EnvelopeError> {
    match envelope.algorithm {
        EnvelopeAlgorithm::Aes256GcmV1 => {}
    }
    // Wrong lengths would panic inside `from_slice`; reject them up front.
    if envelope.iv.len() != IV_LENGTH || envelope.auth_tag.len() != TAG_LENGTH {
        return Err(EnvelopeError::Decryption);
    }

    let mut buffer = envelope.ciphertext.clone();
    key.cipher()
        .decrypt_in_place_detached(
            Nonce::from_slice(&envelope.iv),
            context,
            &mut buffer,
            Tag::from_slice(&envelope.auth_tag),
        )
        .map_err(|_| EnvelopeError::Decryption)?;
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> MasterKey {
        let mut key = [0u8; KEY_LENGTH];
        for (i, byte) in key.iter_mut().enumerate() {
            *byte = i as u8;
        }
        MasterKey::from_bytes(&key).unwrap()
    }

    #[test]
    fn seal_open_roundtrip() {
        let key = test_key();
        let envelope = seal(b"api-secret-value", &key).unwrap();
        assert_eq!(open(&envelope, &key).unwrap(), b"api-secret-value");
        assert_eq!(envelope.iv.len(), IV_LENGTH);
        assert_eq!(envelope.auth_tag.len(), TAG_LENGTH);
        assert_eq!(envelope.ciphertext.len(), "api-secret-value".len());
    }

    #[test]
    fn empty_plaintext_roundtrip() {
        let key = test_key();
        let envelope = seal(b"", &key).unwrap();
        assert!(open(&envelope, &key).unwrap().is_empty());
    }

    #[test]
    fn every_single_bit_flip_fails_closed() {
        let key = test_key();
        let envelope = seal(b"0123456789abcdef-secret", &key).unwrap();

        fn field(e: &mut Envelope, which: usize) -> &mut Vec<u8> {
            match which {
                0 => &mut e.iv,
                1 => &mut e.ciphertext,
                _ => &mut e.auth_tag,
            }
        }

        for which in 0..3 {
            let len = field(&mut envelope.clone(), which).len();
            for byte in 0..len {
                for bit in 0..8 {
                    let mut tampered = envelope.clone();
                    field(&mut tampered, which)[byte] ^= 1 << bit;
                    assert!(matches!(
                        open(&tampered, &key),
                        Err(EnvelopeError::Decryption)
                    ));
                }
            }
        }
    }

    #[test]
    fn wrong_key_fails() {
        let envelope = seal(b"secret", &test_key()).unwrap();
        let other = MasterKey::generate();
        assert!(matches!(
            open(&envelope, &other),
            Err(EnvelopeError::Decryption)
        ));
    }

    #[test]
    fn context_is_authenticated() {
        let key = test_key();
        let envelope = seal_with_context(b"secret", &key, b"user-1/binance/api_secret").unwrap();
        assert_eq!(
            open_with_context(&envelope, &key, b"user-1/binance/api_secret").unwrap(),
            b"secret"
        );
        assert!(open_with_context(&envelope, &key, b"user-2/binance/api_secret").is_err());
        assert!(open(&envelope, &key).is_err());
    }

    #[test]
    fn truncated_fields_fail_without_panicking() {
        let key = test_key();
        let mut envelope = seal(b"secret", &key).unwrap();
        envelope.iv.pop();
        assert!(open(&envelope, &key).is_err());

        let mut envelope = seal(b"secret", &key).unwrap();
        envelope.auth_tag.truncate(4);
        assert!(open(&envelope, &key).is_err());
    }

    #[test]
    fn ivs_are_fresh_per_call() {
        let key = test_key();
        let a = seal(b"same", &key).unwrap();
        let b = seal(b"same", &key).unwrap();
        assert_ne!(a.iv, b.iv);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn master_key_parsing() {
        let key = MasterKey::generate();
        let parsed = MasterKey::from_base64(&key.to_base64()).unwrap();
        let envelope = seal(b"x", &key).unwrap();
        assert_eq!(open(&envelope, &parsed).unwrap(), b"x");

        assert!(matches!(
            MasterKey::from_bytes(&[0u8; 16]),
            Err(EnvelopeError::InvalidKeyLength(16))
        ));
        assert!(MasterKey::from_base64("not base64!").is_err());
        assert_eq!(format!("{key:?}"), "MasterKey(<redacted>)");
    }

    #[test]
    fn algorithm_identifier_is_stable() {
        let envelope = seal(b"x", &test_key()).unwrap();
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["algorithm"], "aes-256-gcm/v1");
        assert_eq!(
            "aes-256-gcm/v1".parse::<EnvelopeAlgorithm>().unwrap(),
            EnvelopeAlgorithm::Aes256GcmV1
        );
        assert!("rot13".parse::<EnvelopeAlgorithm>().is_err());
    }
}
