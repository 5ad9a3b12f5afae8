//! Peer identity
//!
//! A [`PeerId`] is the blake3 digest of a peer's ed25519 public key. It is
//! the only valid target of a connect operation; addresses are hints for
//! reaching an identity, never a substitute for one.

use std::fmt;
use std::str::FromStr;

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};

use crate::error::IdentityError;

/// Length of a peer identifier in bytes
pub const PEER_ID_LEN: usize = 32;

/// Public-key-derived peer identifier
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerId([u8; PEER_ID_LEN]);

impl PeerId {
    /// Derive the identifier for an ed25519 public key
    pub fn from_public_key(key: &VerifyingKey) -> Self {
        Self(*blake3::hash(key.as_bytes()).as_bytes())
    }

    /// Wrap raw identifier bytes
    pub const fn from_bytes(bytes: [u8; PEER_ID_LEN]) -> Self {
        Self(bytes)
    }

    /// Parse an identifier from a byte slice of the right length
    pub fn try_from_slice(bytes: &[u8]) -> Result<Self, IdentityError> {
        let arr: [u8; PEER_ID_LEN] =
            bytes
                .try_into()
                .map_err(|_| IdentityError::InvalidKeyLength {
                    expected: PEER_ID_LEN,
                    actual: bytes.len(),
                })?;
        Ok(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; PEER_ID_LEN] {
        &self.0
    }

    /// Short display form for logging
    pub fn short_id(&self) -> String {
        hex::encode(&self.0[..5])
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.short_id())
    }
}

impl FromStr for PeerId {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|e| IdentityError::InvalidFormat(e.to_string()))?;
        Self::try_from_slice(&bytes)
    }
}

/// An ed25519 signing keypair and the identity derived from it
#[derive(Clone)]
pub struct Keypair {
    signing: SigningKey,
    peer_id: PeerId,
}

impl Keypair {
    /// Generate a fresh random keypair
    pub fn generate() -> Self {
        Self::from_seed(rand::random::<[u8; 32]>())
    }

    /// Deterministic keypair from a 32-byte seed
    pub fn from_seed(seed: [u8; 32]) -> Self {
        let signing = SigningKey::from_bytes(&seed);
        let peer_id = PeerId::from_public_key(&signing.verifying_key());
        Self { signing, peer_id }
    }

    pub fn public(&self) -> VerifyingKey {
        self.signing.verifying_key()
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.signing.sign(message).to_bytes().to_vec()
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keypair")
            .field("peer_id", &self.peer_id)
            .finish_non_exhaustive()
    }
}

/// Verify `signature` over `message` with the raw public key bytes.
///
/// Returns the identity the key belongs to on success.
pub fn verify_signature(
    public_key: &[u8],
    message: &[u8],
    signature: &[u8],
) -> Result<PeerId, IdentityError> {
    let key_bytes: [u8; 32] =
        public_key
            .try_into()
            .map_err(|_| IdentityError::InvalidKeyLength {
                expected: 32,
                actual: public_key.len(),
            })?;
    let key = VerifyingKey::from_bytes(&key_bytes).map_err(|_| IdentityError::InvalidPublicKey)?;
    let signature = Signature::from_slice(signature).map_err(|_| IdentityError::InvalidSignature)?;
    key.verify_strict(message, &signature)
        .map_err(|_| IdentityError::InvalidSignature)?;
    Ok(PeerId::from_public_key(&key))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_id_roundtrips_through_hex() {
        let kp = Keypair::generate();
        let id = kp.peer_id();
        let parsed: PeerId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
        assert_eq!(id.short_id().len(), 10);
    }

    #[test]
    fn test_seeded_keypair_is_deterministic() {
        let a = Keypair::from_seed([7; 32]);
        let b = Keypair::from_seed([7; 32]);
        assert_eq!(a.peer_id(), b.peer_id());
        assert_ne!(a.peer_id(), Keypair::from_seed([8; 32]).peer_id());
    }

    #[test]
    fn test_signature_verifies_to_signer() {
        let kp = Keypair::generate();
        let sig = kp.sign(b"hello");
        let who = verify_signature(kp.public().as_bytes(), b"hello", &sig).unwrap();
        assert_eq!(who, kp.peer_id());

        let err = verify_signature(kp.public().as_bytes(), b"tampered", &sig).unwrap_err();
        assert_eq!(err, IdentityError::InvalidSignature);
    }

    #[test]
    fn test_invalid_slice_length() {
        let err = PeerId::try_from_slice(&[0u8; 12]).unwrap_err();
        assert!(matches!(
            err,
            IdentityError::InvalidKeyLength {
                expected: 32,
                actual: 12
            }
        ));
    }
}
