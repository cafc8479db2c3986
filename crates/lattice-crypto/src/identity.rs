//! Node identities and addresses.
//!
//! Every node holds a long-lived Ed25519 keypair. Its address is the
//! bs58-encoded, 20-byte truncated BLAKE3 hash of the public key, carrying
//! a fixed human-readable prefix. Addresses are what peers exchange and
//! what message signatures are checked against.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand_core::OsRng;
use std::fmt;
use zeroize::ZeroizeOnDrop;

use crate::error::CryptoError;
use crate::{ADDRESS_PAYLOAD_SIZE, ADDRESS_PREFIX, PUBLIC_KEY_SIZE, SIGNATURE_SIZE};

/// A long-lived Ed25519 node identity.
///
/// The secret half is zeroized when the identity is dropped.
#[derive(ZeroizeOnDrop)]
pub struct NodeIdentity {
    signing_key: SigningKey,
}

impl NodeIdentity {
    /// Generate a fresh identity from the system RNG.
    #[must_use]
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Reconstruct an identity from a 32-byte Ed25519 seed.
    pub fn from_seed(seed: &[u8]) -> Result<Self, CryptoError> {
        let bytes: [u8; 32] = seed.try_into().map_err(|_| CryptoError::InvalidKeyLength {
            expected: 32,
            actual: seed.len(),
        })?;
        Ok(Self {
            signing_key: SigningKey::from_bytes(&bytes),
        })
    }

    /// The Ed25519 verifying key for this identity.
    #[must_use]
    pub fn public_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// The public key as raw bytes.
    #[must_use]
    pub fn public_key_bytes(&self) -> [u8; PUBLIC_KEY_SIZE] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// The node address derived from this identity's public key.
    #[must_use]
    pub fn address(&self) -> NodeAddress {
        NodeAddress::from_public_key(&self.public_key())
    }

    /// Sign a message with the identity key.
    #[must_use]
    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_SIZE] {
        self.signing_key.sign(message).to_bytes()
    }

}

impl fmt::Debug for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeIdentity")
            .field("address", &self.address())
            .finish_non_exhaustive()
    }
}

/// Verify an Ed25519 signature against raw key bytes.
pub fn verify_signature(
    public_key: &[u8; PUBLIC_KEY_SIZE],
    message: &[u8],
    signature: &[u8; SIGNATURE_SIZE],
) -> Result<(), CryptoError> {
    let key = VerifyingKey::from_bytes(public_key).map_err(|_| CryptoError::InvalidPublicKey)?;
    let sig = Signature::from_bytes(signature);
    key.verify(message, &sig)
        .map_err(|_| CryptoError::InvalidSignature)
}

/// A node address: `"lat"` + bs58 of the truncated BLAKE3 hash of the
/// identity public key.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct NodeAddress(String);

impl NodeAddress {
    /// Derive the address for a verifying key.
    #[must_use]
    pub fn from_public_key(key: &VerifyingKey) -> Self {
        Self::from_public_key_bytes(&key.to_bytes())
    }

    /// Derive the address for raw public key bytes.
    #[must_use]
    pub fn from_public_key_bytes(key: &[u8; PUBLIC_KEY_SIZE]) -> Self {
        let hash = blake3::hash(key);
        let payload = &hash.as_bytes()[..ADDRESS_PAYLOAD_SIZE];
        Self(format!("{ADDRESS_PREFIX}{}", bs58::encode(payload).into_string()))
    }

    /// Parse and validate an address string.
    pub fn parse(s: &str) -> Result<Self, CryptoError> {
        let Some(encoded) = s.strip_prefix(ADDRESS_PREFIX) else {
            return Err(CryptoError::InvalidAddress(format!(
                "missing '{ADDRESS_PREFIX}' prefix"
            )));
        };
        let payload = bs58::decode(encoded)
            .into_vec()
            .map_err(|e| CryptoError::InvalidAddress(e.to_string()))?;
        if payload.len() != ADDRESS_PAYLOAD_SIZE {
            return Err(CryptoError::InvalidAddress(format!(
                "payload is {} bytes, expected {ADDRESS_PAYLOAD_SIZE}",
                payload.len()
            )));
        }
        Ok(Self(s.to_owned()))
    }

    /// The address as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this address matches the given public key.
    #[must_use]
    pub fn matches_key(&self, key: &[u8; PUBLIC_KEY_SIZE]) -> bool {
        *self == Self::from_public_key_bytes(key)
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeAddress({})", self.0)
    }
}

impl std::str::FromStr for NodeAddress {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_roundtrip() {
        let id = NodeIdentity::generate();
        let addr = id.address();
        assert!(addr.as_str().starts_with(ADDRESS_PREFIX));

        let parsed = NodeAddress::parse(addr.as_str()).unwrap();
        assert_eq!(parsed, addr);
        assert!(addr.matches_key(&id.public_key_bytes()));
    }

    #[test]
    fn address_rejects_bad_prefix() {
        assert!(NodeAddress::parse("xyzAbCdEf").is_err());
    }

    #[test]
    fn address_rejects_truncated_payload() {
        let short = format!("{ADDRESS_PREFIX}{}", bs58::encode([1u8; 5]).into_string());
        assert!(NodeAddress::parse(&short).is_err());
    }

    #[test]
    fn address_does_not_match_other_key() {
        let a = NodeIdentity::generate();
        let b = NodeIdentity::generate();
        assert!(!a.address().matches_key(&b.public_key_bytes()));
    }

    #[test]
    fn sign_and_verify() {
        let id = NodeIdentity::generate();
        let msg = b"lattice handshake";
        let sig = id.sign(msg);
        verify_signature(&id.public_key_bytes(), msg, &sig).unwrap();
    }

    #[test]
    fn verify_rejects_tampered_message() {
        let id = NodeIdentity::generate();
        let sig = id.sign(b"original");
        assert!(verify_signature(&id.public_key_bytes(), b"tampered", &sig).is_err());
    }

    #[test]
    fn seed_roundtrip() {
        let id = NodeIdentity::generate();
        let seed = id.signing_key.to_bytes();
        let restored = NodeIdentity::from_seed(&seed).unwrap();
        assert_eq!(id.address(), restored.address());
    }
}
