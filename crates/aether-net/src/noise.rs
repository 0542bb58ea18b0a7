//! Per-session transport encryption
//!
//! Keys come from X25519 ECDH followed by HKDF-SHA256 under a fixed
//! context label, expanded into one key per direction so counters can
//! never collide on a nonce. Each frame is sealed as
//! `u64be(counter) || AEAD(key, nonce, plaintext)` with the counter
//! little-endian in the first 8 bytes of the 12-byte nonce. Counters
//! are strictly sequential per direction; the transports underneath are
//! ordered, so any gap means replay or truncation.

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use sha2::Sha256;
use thiserror::Error;
use x25519_dalek::{EphemeralSecret, PublicKey as X25519Public};

/// Fixed HKDF context label for session key derivation.
pub const NOISE_CONTEXT: &[u8] = b"aether-noise-v1";

const TAG_LEN: usize = 16;

#[derive(Debug, Error)]
pub enum NoiseError {
    #[error("key derivation failed")]
    KeyDerivation,
    #[error("AEAD seal failed")]
    Seal,
    #[error("AEAD open failed")]
    Open,
    #[error("counter out of order: expected {expected}, got {got}")]
    Counter { expected: u64, got: u64 },
    #[error("noise payload truncated")]
    Truncated,
}

fn nonce_for(counter: u64) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[..8].copy_from_slice(&counter.to_le_bytes());
    nonce
}

fn expand_key(hkdf: &Hkdf<Sha256>, direction: &[u8]) -> Result<[u8; 32], NoiseError> {
    let mut info = NOISE_CONTEXT.to_vec();
    info.extend_from_slice(direction);
    let mut key = [0u8; 32];
    hkdf.expand(&info, &mut key)
        .map_err(|_| NoiseError::KeyDerivation)?;
    Ok(key)
}

/// Sealing half: owned by whichever task writes to the transport.
pub struct NoiseTx {
    cipher: ChaCha20Poly1305,
    counter: u64,
}

impl NoiseTx {
    /// Seal an inner frame. Returns `u64be(counter) || ciphertext`.
    pub fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, NoiseError> {
        let counter = self.counter;
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce_for(counter)), plaintext)
            .map_err(|_| NoiseError::Seal)?;
        self.counter += 1;

        let mut out = Vec::with_capacity(8 + ciphertext.len());
        out.extend_from_slice(&counter.to_be_bytes());
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }
}

/// Opening half: owned by the session processing inbound frames.
pub struct NoiseRx {
    cipher: ChaCha20Poly1305,
    counter: u64,
    failures: u32,
}

impl NoiseRx {
    /// Open a sealed payload, enforcing the sequential counter.
    pub fn open(&mut self, payload: &[u8]) -> Result<Vec<u8>, NoiseError> {
        if payload.len() < 8 + TAG_LEN {
            self.failures += 1;
            return Err(NoiseError::Truncated);
        }
        let mut counter_bytes = [0u8; 8];
        counter_bytes.copy_from_slice(&payload[..8]);
        let counter = u64::from_be_bytes(counter_bytes);
        if counter != self.counter {
            self.failures += 1;
            return Err(NoiseError::Counter {
                expected: self.counter,
                got: counter,
            });
        }

        match self
            .cipher
            .decrypt(Nonce::from_slice(&nonce_for(counter)), &payload[8..])
        {
            Ok(plaintext) => {
                self.counter += 1;
                Ok(plaintext)
            }
            Err(_) => {
                self.failures += 1;
                Err(NoiseError::Open)
            }
        }
    }

    /// Consecutive authentication failures on this direction.
    pub fn failures(&self) -> u32 {
        self.failures
    }
}

fn derive_pair(shared_secret: &[u8; 32], is_server: bool) -> Result<(NoiseTx, NoiseRx), NoiseError> {
    let hkdf = Hkdf::<Sha256>::new(None, shared_secret);
    let c2s = expand_key(&hkdf, b"c2s")?;
    let s2c = expand_key(&hkdf, b"s2c")?;
    let (tx_key, rx_key) = if is_server { (s2c, c2s) } else { (c2s, s2c) };

    let tx = NoiseTx {
        cipher: ChaCha20Poly1305::new_from_slice(&tx_key).map_err(|_| NoiseError::KeyDerivation)?,
        counter: 0,
    };
    let rx = NoiseRx {
        cipher: ChaCha20Poly1305::new_from_slice(&rx_key).map_err(|_| NoiseError::KeyDerivation)?,
        counter: 0,
        failures: 0,
    };
    Ok((tx, rx))
}

/// Server side of the upgrade: consumes the client's public key from
/// HELLO, returns the key halves plus the public key to echo in WELCOME.
pub fn server_accept(client_pubkey: &[u8; 32]) -> Result<(NoiseTx, NoiseRx, [u8; 32]), NoiseError> {
    let secret = EphemeralSecret::random_from_rng(OsRng);
    let our_public = X25519Public::from(&secret);
    let shared = secret.diffie_hellman(&X25519Public::from(*client_pubkey));
    let (tx, rx) = derive_pair(shared.as_bytes(), true)?;
    Ok((tx, rx, *our_public.as_bytes()))
}

/// Client side of the upgrade: the ephemeral key lives from HELLO until
/// the server's public key arrives in WELCOME.
pub struct ClientNoise {
    secret: EphemeralSecret,
    public: [u8; 32],
}

impl ClientNoise {
    pub fn new() -> Self {
        let secret = EphemeralSecret::random_from_rng(OsRng);
        let public = *X25519Public::from(&secret).as_bytes();
        Self { secret, public }
    }

    /// Public key to offer in HELLO.
    pub fn public_key(&self) -> [u8; 32] {
        self.public
    }

    /// Complete the exchange with the server key from WELCOME.
    pub fn finish(self, server_pubkey: &[u8; 32]) -> Result<(NoiseTx, NoiseRx), NoiseError> {
        let shared = self
            .secret
            .diffie_hellman(&X25519Public::from(*server_pubkey));
        derive_pair(shared.as_bytes(), false)
    }
}

impl Default for ClientNoise {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handshake() -> (NoiseTx, NoiseRx, NoiseTx, NoiseRx) {
        let client = ClientNoise::new();
        let (server_tx, server_rx, server_pub) = server_accept(&client.public_key()).unwrap();
        let (client_tx, client_rx) = client.finish(&server_pub).unwrap();
        (client_tx, client_rx, server_tx, server_rx)
    }

    #[test]
    fn both_directions_seal_and_open() {
        let (mut client_tx, mut client_rx, mut server_tx, mut server_rx) = handshake();

        let sealed = client_tx.seal(b"up").unwrap();
        assert_eq!(server_rx.open(&sealed).unwrap(), b"up");

        let sealed = server_tx.seal(b"down").unwrap();
        assert_eq!(client_rx.open(&sealed).unwrap(), b"down");
    }

    #[test]
    fn counters_advance_per_direction() {
        let (mut client_tx, _, _, mut server_rx) = handshake();

        for i in 0u64..5 {
            let sealed = client_tx.seal(format!("m{i}").as_bytes()).unwrap();
            assert_eq!(&sealed[..8], &i.to_be_bytes());
            server_rx.open(&sealed).unwrap();
        }
    }

    #[test]
    fn replayed_frames_are_rejected() {
        let (mut client_tx, _, _, mut server_rx) = handshake();

        let sealed = client_tx.seal(b"once").unwrap();
        server_rx.open(&sealed).unwrap();
        assert!(matches!(
            server_rx.open(&sealed),
            Err(NoiseError::Counter { expected: 1, got: 0 })
        ));
        assert_eq!(server_rx.failures(), 1);
    }

    #[test]
    fn tampered_frames_count_failures() {
        let (mut client_tx, _, _, mut server_rx) = handshake();

        let mut sealed = client_tx.seal(b"payload").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 1;
        assert!(matches!(server_rx.open(&sealed), Err(NoiseError::Open)));
        assert_eq!(server_rx.failures(), 1);

        // The counter did not advance; the untampered frame still opens.
        let sealed = {
            let mut fresh = sealed;
            fresh[last] ^= 1;
            fresh
        };
        assert_eq!(server_rx.open(&sealed).unwrap(), b"payload");
    }

    #[test]
    fn nonce_is_little_endian_counter() {
        assert_eq!(nonce_for(1)[..8], 1u64.to_le_bytes());
        assert_eq!(nonce_for(1)[8..], [0u8; 4]);
    }

    #[test]
    fn distinct_sessions_derive_distinct_keys() {
        let (mut a_tx, ..) = handshake();
        let (_, _, _, mut b_rx) = handshake();

        let sealed = a_tx.seal(b"cross").unwrap();
        assert!(b_rx.open(&sealed).is_err());
    }
}
