//! # Lattice Crypto
//!
//! Cryptographic primitives for the Lattice peer transport.
//!
//! This crate provides:
//! - Ed25519 node identities and bs58 node addresses
//! - Ephemeral key agreement (Edwards → Montgomery conversion + X25519)
//! - `ChaCha20-Poly1305` AEAD with per-direction counter nonces
//! - Session key material, zeroized on drop
//!
//! ## Cryptographic Suite
//!
//! | Function | Algorithm |
//! |----------|-----------|
//! | Identity / handshake signatures | Ed25519 |
//! | Key exchange | X25519 (converted from Ed25519 ephemerals) |
//! | AEAD | ChaCha20-Poly1305, 96-bit counter nonce |
//! | Address derivation | BLAKE3, truncated to 20 bytes, bs58 |

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod aead;
pub mod ecdh;
pub mod error;
pub mod identity;

pub use aead::{NonceCounter, SessionCipher};
pub use ecdh::{SessionKey, derive_shared_key};
pub use error::CryptoError;
pub use identity::{NodeAddress, NodeIdentity, verify_signature};

/// Ed25519 public key size.
pub const PUBLIC_KEY_SIZE: usize = 32;

/// Ed25519 signature size.
pub const SIGNATURE_SIZE: usize = 64;

/// Derived session key size.
pub const SESSION_KEY_SIZE: usize = 32;

/// AEAD authentication tag size.
pub const TAG_SIZE: usize = 16;

/// Address payload size (truncated BLAKE3 of the identity key).
pub const ADDRESS_PAYLOAD_SIZE: usize = 20;

/// Human-readable prefix on every node address.
pub const ADDRESS_PREFIX: &str = "lat";
