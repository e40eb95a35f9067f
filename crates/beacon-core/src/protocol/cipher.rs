//! Optional symmetric encryption of whole serialized envelopes.
//!
//! The configured key is a shared passphrase.  It is stretched to a 256-bit
//! AES key with SHA-256, and every message is sealed with AES-256-GCM under a
//! fresh random 96-bit nonce:
//!
//! ```text
//! [nonce:12][ciphertext + 16-byte tag]
//! ```
//!
//! GCM authenticates the ciphertext, so a wrong key or a corrupted block is
//! reported as [`CipherError::Open`] instead of yielding garbage JSON.  This
//! keeps casual eavesdroppers out; it is not peer authentication, since every
//! node holding the key can speak for any other.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Length of the nonce prefix on every sealed message.
pub const NONCE_LEN: usize = 12;

/// Length of the GCM authentication tag.
pub const TAG_LEN: usize = 16;

/// Errors produced by [`Cipher`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CipherError {
    /// The sealed message is shorter than nonce + tag.
    #[error("sealed message too short: {0} bytes")]
    TooShort(usize),

    /// Encryption failed.
    #[error("encryption failed")]
    Seal,

    /// Authentication failed: wrong key or corrupted data.
    #[error("decryption failed (wrong key or corrupted data)")]
    Open,
}

/// AES-256-GCM sealer/opener keyed from a shared passphrase.
#[derive(Clone)]
pub struct Cipher {
    aead: Aes256Gcm,
}

impl std::fmt::Debug for Cipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Cipher(aes-256-gcm)")
    }
}

impl Cipher {
    /// Derives the AES key from `passphrase` with SHA-256.
    pub fn from_passphrase(passphrase: &str) -> Self {
        let digest = Sha256::digest(passphrase.as_bytes());
        let aead = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(digest.as_slice()));
        Self { aead }
    }

    /// Encrypts `plaintext`, returning `nonce || ciphertext`.
    ///
    /// # Errors
    ///
    /// Returns [`CipherError::Seal`] if the AEAD rejects the input.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, CipherError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .aead
            .encrypt(nonce, plaintext)
            .map_err(|_| CipherError::Seal)?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Decrypts a message produced by [`Cipher::seal`].
    ///
    /// # Errors
    ///
    /// Returns [`CipherError::TooShort`] for truncated input and
    /// [`CipherError::Open`] when authentication fails.
    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, CipherError> {
        if sealed.len() < NONCE_LEN + TAG_LEN {
            return Err(CipherError::TooShort(sealed.len()));
        }
        let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LEN);
        self.aead
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| CipherError::Open)
    }
}
