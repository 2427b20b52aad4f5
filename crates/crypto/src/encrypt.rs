//! Sealed envelopes between hops.
//!
//! An envelope can be opened only by the holder of the recipient hostkey's
//! secret. Layout: `[ephemeral pubkey (32) | nonce (12) | ciphertext]`.
//! A fresh ephemeral key per envelope keeps ciphertexts uncorrelated even
//! for identical plaintexts.

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use rand::rngs::OsRng;
use rand::RngCore;
use thiserror::Error;
use x25519_dalek::{PublicKey, StaticSecret};

use veil_core::Hostkey;

use crate::keys::{hash, Identity};

const EPHEMERAL_LEN: usize = 32;
const NONCE_LEN: usize = 12;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Encryption failed")]
    SealFailed,
    #[error("Decryption failed")]
    OpenFailed,
    #[error("Recipient hostkey is not a valid public key")]
    InvalidKey,
    #[error("Envelope too short")]
    TooShort,
}

/// Seal `plaintext` so that only the holder of `recipient` can open it.
pub fn seal(plaintext: &[u8], recipient: &Hostkey) -> Result<Vec<u8>, CryptoError> {
    let recipient_bytes: [u8; 32] = recipient
        .as_bytes()
        .try_into()
        .map_err(|_| CryptoError::InvalidKey)?;

    let ephemeral = StaticSecret::random_from_rng(OsRng);
    let ephemeral_public = PublicKey::from(&ephemeral);
    let shared = ephemeral.diffie_hellman(&PublicKey::from(recipient_bytes));
    let key = hash(shared.as_bytes());

    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let cipher = ChaCha20Poly1305::new_from_slice(&key).map_err(|_| CryptoError::InvalidKey)?;
    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| CryptoError::SealFailed)?;

    let mut out = Vec::with_capacity(EPHEMERAL_LEN + NONCE_LEN + ciphertext.len());
    out.extend_from_slice(ephemeral_public.as_bytes());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Open an envelope sealed for this identity's hostkey.
pub fn open(envelope: &[u8], identity: &Identity) -> Result<Vec<u8>, CryptoError> {
    if envelope.len() < EPHEMERAL_LEN + NONCE_LEN {
        return Err(CryptoError::TooShort);
    }

    let ephemeral: [u8; 32] = envelope[..EPHEMERAL_LEN].try_into().unwrap();
    let key = hash(&identity.diffie_hellman(&ephemeral));

    let nonce = Nonce::from_slice(&envelope[EPHEMERAL_LEN..EPHEMERAL_LEN + NONCE_LEN]);
    let ciphertext = &envelope[EPHEMERAL_LEN + NONCE_LEN..];

    let cipher = ChaCha20Poly1305::new_from_slice(&key).map_err(|_| CryptoError::InvalidKey)?;
    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| CryptoError::OpenFailed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open_roundtrip() {
        let recipient = Identity::generate();
        let plaintext = b"layer for the second hop";

        let envelope = seal(plaintext, &recipient.hostkey()).unwrap();
        let opened = open(&envelope, &recipient).unwrap();
        assert_eq!(opened, plaintext);
    }

    #[test]
    fn test_wrong_identity_cannot_open() {
        let recipient = Identity::generate();
        let eavesdropper = Identity::generate();

        let envelope = seal(b"secret", &recipient.hostkey()).unwrap();
        assert!(matches!(
            open(&envelope, &eavesdropper),
            Err(CryptoError::OpenFailed)
        ));
    }

    #[test]
    fn test_identical_plaintexts_differ_on_the_wire() {
        let recipient = Identity::generate();
        let a = seal(b"same", &recipient.hostkey()).unwrap();
        let b = seal(b"same", &recipient.hostkey()).unwrap();
        assert_ne!(a, b);
        assert_eq!(open(&a, &recipient).unwrap(), open(&b, &recipient).unwrap());
    }

    #[test]
    fn test_empty_plaintext() {
        let recipient = Identity::generate();
        let envelope = seal(b"", &recipient.hostkey()).unwrap();
        assert!(open(&envelope, &recipient).unwrap().is_empty());
        // Overhead is exactly ephemeral key + nonce + AEAD tag.
        assert_eq!(envelope.len(), 32 + 12 + 16);
    }

    #[test]
    fn test_rejects_bad_inputs() {
        let recipient = Identity::generate();

        let short = vec![0u8; 20];
        assert!(matches!(open(&short, &recipient), Err(CryptoError::TooShort)));

        let bad_key = Hostkey::new(vec![1, 2, 3]);
        assert!(matches!(seal(b"x", &bad_key), Err(CryptoError::InvalidKey)));
    }

    #[test]
    fn test_corrupted_envelope_fails() {
        let recipient = Identity::generate();
        let mut envelope = seal(b"payload", &recipient.hostkey()).unwrap();
        let last = envelope.len() - 1;
        envelope[last] ^= 0xFF;
        assert!(matches!(
            open(&envelope, &recipient),
            Err(CryptoError::OpenFailed)
        ));
    }
}
