//! Ephemeral key agreement.
//!
//! The handshake uses throwaway Ed25519 keypairs so the ephemeral public
//! key can be signed by the long-lived identity with the same primitive.
//! For the Diffie-Hellman step both sides convert to the Montgomery form:
//! the secret scalar via the key's clamped scalar bytes, the peer's public
//! key via the birational Edwards → Montgomery map. The raw X25519 output
//! is then run through a domain-separated BLAKE3 derivation to produce the
//! session key.

use ed25519_dalek::{SigningKey, VerifyingKey};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::SESSION_KEY_SIZE;
use crate::error::CryptoError;

/// Domain separation string for session key derivation.
const SESSION_KEY_CONTEXT: &str = "lattice v1 handshake session key";

/// A derived symmetric session key, zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SessionKey(pub(crate) [u8; SESSION_KEY_SIZE]);

impl SessionKey {
    /// Raw key bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; SESSION_KEY_SIZE] {
        &self.0
    }
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionKey(..)")
    }
}

/// Derive the shared session key from our ephemeral secret and the peer's
/// ephemeral public key.
///
/// Rejects exchanges that land on the identity of the Montgomery curve,
/// which happens when the peer supplies a low-order point.
pub fn derive_shared_key(
    our_ephemeral: &SigningKey,
    their_ephemeral: &VerifyingKey,
) -> Result<SessionKey, CryptoError> {
    let mut scalar = our_ephemeral.to_scalar_bytes();
    let their_montgomery = their_ephemeral.to_montgomery().to_bytes();

    let mut shared = x25519_dalek::x25519(scalar, their_montgomery);
    scalar.zeroize();

    if shared.iter().all(|&b| b == 0) {
        shared.zeroize();
        return Err(CryptoError::KeyAgreement);
    }

    let key = blake3::derive_key(SESSION_KEY_CONTEXT, &shared);
    shared.zeroize();
    Ok(SessionKey(key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_core::OsRng;

    #[test]
    fn both_sides_derive_the_same_key() {
        let a = SigningKey::generate(&mut OsRng);
        let b = SigningKey::generate(&mut OsRng);

        let k_ab = derive_shared_key(&a, &b.verifying_key()).unwrap();
        let k_ba = derive_shared_key(&b, &a.verifying_key()).unwrap();
        assert_eq!(k_ab.as_bytes(), k_ba.as_bytes());
    }

    #[test]
    fn different_peers_derive_different_keys() {
        let a = SigningKey::generate(&mut OsRng);
        let b = SigningKey::generate(&mut OsRng);
        let c = SigningKey::generate(&mut OsRng);

        let k_ab = derive_shared_key(&a, &b.verifying_key()).unwrap();
        let k_ac = derive_shared_key(&a, &c.verifying_key()).unwrap();
        assert_ne!(k_ab.as_bytes(), k_ac.as_bytes());
    }
}
