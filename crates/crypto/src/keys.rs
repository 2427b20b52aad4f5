use std::path::Path;

use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use thiserror::Error;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

use veil_core::Hostkey;

#[derive(Error, Debug)]
pub enum KeyError {
    #[error("Hostkey file is not valid hex")]
    BadEncoding,

    #[error("Hostkey secret must be 32 bytes, got {0}")]
    InvalidLength(usize),

    #[error("Hostkey file error: {0}")]
    Io(#[from] std::io::Error),
}

/// The relay's long-term keypair.
///
/// The public half is the hostkey advertised on the wire; the secret half
/// opens envelopes sealed for it.
pub struct Identity {
    secret: StaticSecret,
    public: X25519PublicKey,
}

impl Clone for Identity {
    fn clone(&self) -> Self {
        let secret = StaticSecret::from(*self.secret.as_bytes());
        let public = X25519PublicKey::from(&secret);
        Self { secret, public }
    }
}

impl Identity {
    /// Generate a new random identity.
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = X25519PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Rebuild an identity from raw secret bytes.
    pub fn from_secret_bytes(secret: &[u8; 32]) -> Self {
        let secret = StaticSecret::from(*secret);
        let public = X25519PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Read the hex-encoded secret from the hostkey file.
    pub fn load(path: &Path) -> Result<Self, KeyError> {
        let raw = std::fs::read_to_string(path)?;
        let bytes = hex::decode(raw.trim()).map_err(|_| KeyError::BadEncoding)?;
        let secret: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| KeyError::InvalidLength(bytes.len()))?;
        Ok(Self::from_secret_bytes(&secret))
    }

    /// Write the hex-encoded secret to `path`.
    pub fn save(&self, path: &Path) -> Result<(), KeyError> {
        std::fs::write(path, hex::encode(self.secret.as_bytes()))?;
        Ok(())
    }

    /// The advertised hostkey.
    pub fn hostkey(&self) -> Hostkey {
        Hostkey::from(self.public.to_bytes())
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.public.to_bytes()
    }

    pub fn secret_key_bytes(&self) -> [u8; 32] {
        *self.secret.as_bytes()
    }

    /// Perform Diffie-Hellman key exchange.
    pub fn diffie_hellman(&self, their_public: &[u8; 32]) -> [u8; 32] {
        let their_public = X25519PublicKey::from(*their_public);
        let shared = self.secret.diffie_hellman(&their_public);
        *shared.as_bytes()
    }
}

/// Hash data using SHA-256.
pub fn hash(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Fingerprint of a hostkey: SHA-256 over its canonical bytes.
pub fn fingerprint(hostkey: &Hostkey) -> [u8; 32] {
    hash(hostkey.as_bytes())
}

/// The two leading fingerprint bytes carried as the envelope addressing tag.
pub fn fingerprint_tag(hostkey: &Hostkey) -> [u8; 2] {
    let digest = fingerprint(hostkey);
    [digest[0], digest[1]]
}
