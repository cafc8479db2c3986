//! Error types for the transport layer.

use lattice_crypto::CryptoError;
use lattice_wire::WireError;
use thiserror::Error;

/// Errors produced by the transport layer.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The handshake did not complete within its deadline.
    #[error("handshake timed out")]
    HandshakeTimeout,

    /// The peer's ephemeral key signature did not verify.
    #[error("invalid handshake signature")]
    InvalidHandshakeSignature,

    /// The identity the peer presented after key agreement was malformed.
    #[error("invalid peer identity: {0}")]
    InvalidPeerIdentity(String),

    /// An inbound frame advertised a length above the configured cap.
    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge {
        /// Advertised frame length.
        len: usize,
        /// Configured maximum.
        max: usize,
    },

    /// The connection engine has shut down.
    #[error("connection closed")]
    ConnectionClosed,

    /// An outbound message has no signing material.
    #[error("message is missing signature info")]
    MissingSignatureInfo,

    /// The listener has been stopped.
    #[error("server closed")]
    ServerClosed,

    /// No routed connection with the given id.
    #[error("unknown connection: {0}")]
    UnknownConnection(u64),

    /// Wire codec failure on an inbound message.
    #[error(transparent)]
    Wire(#[from] WireError),

    /// Cryptographic failure (key agreement, frame authentication).
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// Underlying socket failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
