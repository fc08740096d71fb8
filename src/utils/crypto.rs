//! XChaCha20-Poly1305 authenticated encryption.
//!
//! Nonces are 24 random bytes, large enough that random generation per message
//! is safe without a counter.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use rand_core::{OsRng, RngCore};

use crate::error::{ProtocolError, Result};

/// Length of an XChaCha20 nonce.
pub const NONCE_SIZE: usize = 24;

/// Length of the Poly1305 tag appended to every ciphertext.
pub const TAG_SIZE: usize = 16;

pub struct Crypto {
    cipher: XChaCha20Poly1305,
}

impl Crypto {
    pub fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: XChaCha20Poly1305::new(Key::from_slice(key)),
        }
    }

    pub fn generate_nonce() -> [u8; NONCE_SIZE] {
        let mut nonce = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce);
        nonce
    }

    pub fn encrypt(&self, plaintext: &[u8], nonce: &[u8; NONCE_SIZE]) -> Result<Vec<u8>> {
        self.cipher
            .encrypt(XNonce::from_slice(nonce), plaintext)
            .map_err(|_| ProtocolError::EncryptionFailure)
    }

    pub fn decrypt(&self, ciphertext: &[u8], nonce: &[u8; NONCE_SIZE]) -> Result<Vec<u8>> {
        self.cipher
            .decrypt(XNonce::from_slice(nonce), ciphertext)
            .map_err(|_| ProtocolError::DecryptionFailure)
    }

    /// Encrypt under a fresh nonce and return `[nonce][ciphertext]`.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce = Self::generate_nonce();
        let ciphertext = self.encrypt(plaintext, &nonce)?;
        let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Inverse of [`Crypto::seal`].
    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>> {
        if sealed.len() < NONCE_SIZE + TAG_SIZE {
            return Err(ProtocolError::DecryptionFailure);
        }
        let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_SIZE);
        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(nonce_bytes);
        self.decrypt(ciphertext, &nonce)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn test_seal_open() {
        let crypto = Crypto::new(&[7u8; 32]);
        let sealed = crypto.seal(b"secret").unwrap();
        assert_eq!(sealed.len(), NONCE_SIZE + 6 + TAG_SIZE);
        assert_eq!(crypto.open(&sealed).unwrap(), b"secret");
    }

    #[test]
    fn test_wrong_key_fails() {
        let sealed = Crypto::new(&[1u8; 32]).seal(b"secret").unwrap();
        assert!(matches!(
            Crypto::new(&[2u8; 32]).open(&sealed),
            Err(ProtocolError::DecryptionFailure)
        ));
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let crypto = Crypto::new(&[3u8; 32]);
        let mut sealed = crypto.seal(b"secret").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0xFF;
        assert!(crypto.open(&sealed).is_err());
    }

    #[test]
    fn test_short_input_fails() {
        let crypto = Crypto::new(&[3u8; 32]);
        assert!(crypto.open(&[0u8; 10]).is_err());
    }
}
