//! Wire-level error types.

use thiserror::Error;

/// Errors produced while assembling or checking wire structures.
#[derive(Debug, Error)]
pub enum WireError {
    /// A fixed-width field was given a slice of the wrong length.
    #[error("invalid field length: expected {expected}, got {actual}")]
    InvalidLength {
        /// Expected length in bytes.
        expected: usize,
        /// Actual length supplied.
        actual: usize,
    },

    /// The decrypted body segment does not match the lengths declared
    /// in the header. Fatal for the connection that produced it.
    #[error("body segment length mismatch: declared {declared}, got {actual}")]
    SegmentMismatch {
        /// Length implied by the header (body + sign block + raw data).
        declared: usize,
        /// Decrypted segment length.
        actual: usize,
    },

    /// The signing block did not verify against the message body.
    #[error("message signature verification failed: {0}")]
    BadSignature(#[from] lattice_crypto::CryptoError),

    /// The signing block names a different peer than the connection's
    /// authenticated identity.
    #[error("signer address {signer} does not match peer {peer}")]
    SignerMismatch {
        /// Address derived from the embedded public key.
        signer: String,
        /// Authenticated identity of the remote end.
        peer: String,
    },
}
