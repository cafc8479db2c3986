//! # Lattice Wire
//!
//! Wire-level message types for the Lattice peer transport.
//!
//! This crate provides:
//! - Fixed-width message header encoding and decoding
//! - 8-byte ASCII command codes
//! - The per-message signing block carried inside the encrypted body segment
//! - The `Message` unit exchanged between peers
//!
//! Every multi-byte integer on the wire is big-endian. Both ends of a
//! connection share this codec, so the choice only has to be consistent.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod command;
pub mod error;
pub mod header;
pub mod message;
pub mod sign;

pub use command::CommandCode;
pub use error::WireError;
pub use header::MessageHeader;
pub use message::Message;
pub use sign::MessageSign;

/// Fixed message header size in bytes.
pub const HEADER_SIZE: usize = 28;

/// Command code size in bytes.
pub const COMMAND_SIZE: usize = 8;

/// Fixed size of the signing block inside the body segment
/// (32-byte identity key + 64-byte signature).
pub const SIGN_BLOCK_SIZE: usize = 96;

/// Bodies longer than this are BLAKE3-hashed before signing, so large
/// payloads never pass through Ed25519 twice.
pub const SIGN_HASH_THRESHOLD: usize = 128;
