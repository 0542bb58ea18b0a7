//! Event signing and verification
//!
//! Events are signed with Ed25519 over the 32-byte event id. The keypair
//! wrapper exists so callers never touch dalek types directly.

use crate::canonical::compute_event_id;
use crate::types::{Event, EventId, Pubkey, Sig, Tag};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid public key")]
    InvalidPublicKey,
    #[error("signature verification failed")]
    VerificationFailed,
}

/// Ed25519 keypair for publisher identity.
#[derive(Clone)]
pub struct KeyPair {
    signing_key: SigningKey,
}

impl KeyPair {
    /// Generate a new random keypair.
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Create from seed bytes (for deterministic testing).
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(seed),
        }
    }

    pub fn public_key(&self) -> Pubkey {
        Pubkey(self.signing_key.verifying_key().to_bytes())
    }

    /// Build a complete event: computes the canonical id and signs it.
    pub fn sign_event(&self, created_at: u64, kind: u16, tags: Vec<Tag>, content: Vec<u8>) -> Event {
        let pubkey = self.public_key();
        let event_id = compute_event_id(&pubkey, created_at, kind, &tags, &content);
        let sig = Sig(self.signing_key.sign(&event_id.0).to_bytes());
        Event {
            pubkey,
            created_at,
            kind,
            tags,
            content,
            event_id,
            sig,
        }
    }
}

/// Verify an event signature over its id.
pub fn verify_event_sig(pubkey: &Pubkey, event_id: &EventId, sig: &Sig) -> Result<(), CryptoError> {
    let verifying_key =
        VerifyingKey::from_bytes(&pubkey.0).map_err(|_| CryptoError::InvalidPublicKey)?;
    let signature = Signature::from_bytes(&sig.0);
    verifying_key
        .verify(&event_id.0, &signature)
        .map_err(|_| CryptoError::VerificationFailed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_verify_roundtrip() {
        let kp = KeyPair::from_seed(&[0x01; 32]);
        let event = kp.sign_event(1, 1, vec![], b"hello".to_vec());

        assert!(verify_event_sig(&event.pubkey, &event.event_id, &event.sig).is_ok());
    }

    #[test]
    fn tampered_id_fails_verification() {
        let kp = KeyPair::from_seed(&[0x02; 32]);
        let event = kp.sign_event(1, 1, vec![], b"hello".to_vec());

        let mut other = event.event_id;
        other.0[0] ^= 1;
        assert!(verify_event_sig(&event.pubkey, &other, &event.sig).is_err());
    }

    #[test]
    fn wrong_key_fails_verification() {
        let kp = KeyPair::from_seed(&[0x03; 32]);
        let other = KeyPair::from_seed(&[0x04; 32]);
        let event = kp.sign_event(1, 1, vec![], b"hello".to_vec());

        assert!(verify_event_sig(&other.public_key(), &event.event_id, &event.sig).is_err());
    }

    #[test]
    fn seeded_keys_are_deterministic() {
        let a = KeyPair::from_seed(&[9; 32]);
        let b = KeyPair::from_seed(&[9; 32]);
        assert_eq!(a.public_key(), b.public_key());
    }
}
