use thiserror::Error;

/// Failures are kept deliberately coarse: a wrong key and a tampered
/// ciphertext are indistinguishable to the caller.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("encryption failed")]
    Encryption,

    #[error("decryption failed: wrong key or tampered envelope")]
    Decryption,

    #[error("invalid master key length: expected 32 bytes, got {0}")]
    InvalidKeyLength(usize),

    #[error("master key is not valid base64: {0}")]
    InvalidKeyEncoding(String),

    #[error("unsupported envelope algorithm: {0}")]
    UnsupportedAlgorithm(String),
}
