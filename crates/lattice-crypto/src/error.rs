//! Error types for cryptographic operations.

use thiserror::Error;

/// Errors that can occur during cryptographic operations.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Key agreement produced a degenerate shared secret.
    #[error("key agreement failed: low-order or zero shared secret")]
    KeyAgreement,

    /// AEAD decryption failed authentication.
    #[error("authentication failed: ciphertext rejected")]
    Authentication,

    /// A public key could not be parsed or validated.
    #[error("invalid public key")]
    InvalidPublicKey,

    /// A signature failed verification.
    #[error("invalid signature")]
    InvalidSignature,

    /// A node address failed to parse or checksum.
    #[error("invalid node address: {0}")]
    InvalidAddress(String),

    /// Raw key material had the wrong length.
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength {
        /// Expected length in bytes.
        expected: usize,
        /// Actual length in bytes.
        actual: usize,
    },
}
