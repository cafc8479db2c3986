//! Authenticated encryption for established sessions.
//!
//! Each connection direction keeps its own monotonic counter. The AEAD
//! nonce is the 64-bit counter in big-endian, left-padded with four zero
//! bytes to fill the 96-bit `ChaCha20-Poly1305` nonce. Counters never
//! repeat within a session, so nonce reuse is impossible as long as both
//! directions use distinct counters.

use chacha20poly1305::aead::Aead;
use chacha20poly1305::{ChaCha20Poly1305, KeyInit, Nonce};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::ecdh::SessionKey;
use crate::error::CryptoError;

/// A per-direction nonce counter.
///
/// Shared between the task that encrypts and anything that inspects
/// progress, hence atomic.
#[derive(Debug, Default)]
pub struct NonceCounter(AtomicU64);

impl NonceCounter {
    /// A counter starting at zero.
    #[must_use]
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    /// Take the next nonce value.
    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }

    /// The current counter value without advancing it.
    #[must_use]
    pub fn current(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// A symmetric session cipher bound to one derived key.
pub struct SessionCipher {
    cipher: ChaCha20Poly1305,
}

impl SessionCipher {
    /// Build a cipher from a derived session key.
    #[must_use]
    pub fn new(key: &SessionKey) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(key.as_bytes().into()),
        }
    }

    /// Encrypt and authenticate a plaintext under the given counter.
    pub fn seal(&self, counter: u64, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let nonce = nonce_from_counter(counter);
        self.cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| CryptoError::Authentication)
    }

    /// Decrypt and verify a ciphertext under the given counter.
    pub fn open(&self, counter: u64, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let nonce = nonce_from_counter(counter);
        self.cipher
            .decrypt(Nonce::from_slice(&nonce), ciphertext)
            .map_err(|_| CryptoError::Authentication)
    }
}

impl std::fmt::Debug for SessionCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionCipher(..)")
    }
}

fn nonce_from_counter(counter: u64) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[4..].copy_from_slice(&counter.to_be_bytes());
    nonce
}
