//! Message signature blocks.
//!
//! Every signed message carries a fixed 96-byte block after its body:
//! the signer's Ed25519 public key followed by the signature. Payloads
//! above the hash threshold are digested with BLAKE3 before signing so
//! the signing cost is bounded for large slices.

use lattice_crypto::{NodeAddress, NodeIdentity, PUBLIC_KEY_SIZE, SIGNATURE_SIZE, verify_signature};

use crate::error::WireError;
use crate::{SIGN_BLOCK_SIZE, SIGN_HASH_THRESHOLD};

/// The signature block attached to an outbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageSign {
    /// The signer's Ed25519 public key.
    pub public_key: [u8; PUBLIC_KEY_SIZE],
    /// Signature over the (possibly hashed) message body.
    pub signature: [u8; SIGNATURE_SIZE],
}

impl MessageSign {
    /// Sign a message body with the given identity.
    #[must_use]
    pub fn sign(identity: &NodeIdentity, body: &[u8]) -> Self {
        let signature = match digest(body) {
            Digest::Hashed(hash) => identity.sign(&hash),
            Digest::Raw => identity.sign(body),
        };
        Self {
            public_key: identity.public_key_bytes(),
            signature,
        }
    }

    /// Verify this block against a message body and the address the peer
    /// claimed during the handshake.
    ///
    /// Fails with [`WireError::SignerMismatch`] when the embedded key does
    /// not hash to the expected address, so a valid signature from the
    /// wrong identity is still rejected.
    pub fn verify(&self, body: &[u8], expected: &NodeAddress) -> Result<(), WireError> {
        if !expected.matches_key(&self.public_key) {
            return Err(WireError::SignerMismatch {
                signer: NodeAddress::from_public_key_bytes(&self.public_key).to_string(),
                peer: expected.to_string(),
            });
        }
        match digest(body) {
            Digest::Hashed(hash) => verify_signature(&self.public_key, &hash, &self.signature)?,
            Digest::Raw => verify_signature(&self.public_key, body, &self.signature)?,
        }
        Ok(())
    }

    /// Serialize to the fixed 96-byte wire form.
    #[must_use]
    pub fn encode(&self) -> [u8; SIGN_BLOCK_SIZE] {
        let mut out = [0u8; SIGN_BLOCK_SIZE];
        out[..PUBLIC_KEY_SIZE].copy_from_slice(&self.public_key);
        out[PUBLIC_KEY_SIZE..].copy_from_slice(&self.signature);
        out
    }

    /// Parse the fixed 96-byte wire form.
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        if bytes.len() != SIGN_BLOCK_SIZE {
            return Err(WireError::InvalidLength {
                expected: SIGN_BLOCK_SIZE,
                actual: bytes.len(),
            });
        }
        let mut public_key = [0u8; PUBLIC_KEY_SIZE];
        let mut signature = [0u8; SIGNATURE_SIZE];
        public_key.copy_from_slice(&bytes[..PUBLIC_KEY_SIZE]);
        signature.copy_from_slice(&bytes[PUBLIC_KEY_SIZE..]);
        Ok(Self {
            public_key,
            signature,
        })
    }
}

enum Digest {
    Hashed([u8; 32]),
    Raw,
}

fn digest(body: &[u8]) -> Digest {
    if body.len() > SIGN_HASH_THRESHOLD {
        Digest::Hashed(*blake3::hash(body).as_bytes())
    } else {
        Digest::Raw
    }
}
