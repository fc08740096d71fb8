//! Key agreement block using Elliptic Curve Diffie-Hellman (ECDH)
//!
//! Both sides of a connection run the same exchange, so neither has to wait
//! for the other to speak first:
//!
//! 1. Each side sends a [`HandshakeHello`]: an ephemeral x25519 public key, a
//!    random nonce and a millisecond timestamp.
//! 2. Each side checks the remote timestamp is fresh and answers with a
//!    [`HandshakeProof`]: the SHA-256 of the remote nonce.
//! 3. Each side checks the proof of its own nonce, then derives the session
//!    key from the shared secret and both nonces, dialer nonce first.
//!
//! The key is stored on the peer under [`KEY_SHARED_KEY`] as a [`SharedKey`].
//! Any protocol violation rejects the peer with `DisconnectPeer`.

use crate::core::payload::{Reader, Writer};
use crate::error::{constants, ProtocolError, Result};
use crate::network::peer::{Direction, Peer};
use crate::protocol::block::Block;
use crate::protocol::message::Message;
use crate::protocol::opcode::{register_message, OPCODE_NIL};
use crate::protocol::pipeline::Protocol;
use crate::utils::timeout::DEFAULT_TIMEOUT;
use async_trait::async_trait;
use rand_core::{OsRng, RngCore};
use sha2::{Digest, Sha256};
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use x25519_dalek::{EphemeralSecret, PublicKey, SharedSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use tracing::{debug, instrument};

/// Attribute key of the derived [`SharedKey`].
pub const KEY_SHARED_KEY: &str = "ecdh.shared_key";

/// Attribute key of the remote ephemeral public key, `[u8; 32]`.
pub const KEY_REMOTE_PUBLIC_KEY: &str = "ecdh.remote_public_key";

/// Default freshness window for handshake timestamps
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(30);

/// How far in the future a remote timestamp may be
const FUTURE_TOLERANCE_MS: u64 = 2000;

/// Session key agreed with one peer. Wiped from memory when dropped.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SharedKey([u8; 32]);

impl SharedKey {
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for SharedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SharedKey(..)")
    }
}

/// First handshake message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeHello {
    pub pub_key: [u8; 32],
    pub nonce: [u8; 16],
    pub timestamp: u64,
}

impl Message for HandshakeHello {
    fn write(&self) -> Vec<u8> {
        Writer::with_capacity(56)
            .write_raw(&self.pub_key)
            .write_raw(&self.nonce)
            .write_u64(self.timestamp)
            .into_bytes()
    }

    fn read(reader: &mut Reader<'_>) -> Result<Self> {
        Ok(Self {
            pub_key: reader.read_raw::<32>()?,
            nonce: reader.read_raw::<16>()?,
            timestamp: reader.read_u64()?,
        })
    }
}

/// Second handshake message, proving the remote nonce was received intact
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeProof {
    pub nonce_verification: [u8; 32],
}

impl Message for HandshakeProof {
    fn write(&self) -> Vec<u8> {
        Writer::with_capacity(32)
            .write_raw(&self.nonce_verification)
            .into_bytes()
    }

    fn read(reader: &mut Reader<'_>) -> Result<Self> {
        Ok(Self {
            nonce_verification: reader.read_raw::<32>()?,
        })
    }
}

/// Get the current timestamp in milliseconds
///
/// # Errors
/// Returns a `ProtocolError::Custom` if the system time is earlier than UNIX_EPOCH
fn current_timestamp() -> Result<u64> {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis() as u64)
        .map_err(|_| ProtocolError::Custom(constants::ERR_SYSTEM_TIME.into()))
}

/// Generate a cryptographically secure random nonce
fn generate_nonce() -> [u8; 16] {
    let mut nonce = [0u8; 16];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

/// Verify that a millisecond timestamp is at most `max_age` old and at most
/// two seconds in the future.
pub fn verify_timestamp(timestamp: u64, max_age: Duration) -> bool {
    let current = match current_timestamp() {
        Ok(time) => time,
        Err(_) => return false,
    };

    if timestamp > current + FUTURE_TOLERANCE_MS {
        return false;
    }

    current <= timestamp || current - timestamp <= max_age.as_millis() as u64
}

/// Compute hash of a nonce for verification
fn hash_nonce(nonce: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(nonce);
    hasher.finalize().into()
}

/// Derive a session key from a shared secret and nonces
fn derive_key_from_shared_secret(
    shared_secret: &SharedSecret,
    dialer_nonce: &[u8],
    listener_nonce: &[u8],
) -> SharedKey {
    let mut hasher = Sha256::new();

    hasher.update(shared_secret.as_bytes());

    // Fixed order so both sides hash the same input.
    hasher.update(b"dialer_nonce");
    hasher.update(dialer_nonce);
    hasher.update(b"listener_nonce");
    hasher.update(listener_nonce);

    SharedKey(hasher.finalize().into())
}

fn reject(peer: &Peer, reason: &str) -> ProtocolError {
    debug!(peer_id = peer.id(), reason, "Handshake rejected");
    ProtocolError::DisconnectPeer
}

/// X25519 key agreement block
#[derive(Debug, Clone)]
pub struct EcdhBlock {
    timeout: Duration,
    max_age: Duration,
}

impl EcdhBlock {
    pub fn new() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            max_age: DEFAULT_MAX_AGE,
        }
    }

    /// How long to wait for each remote handshake message
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Oldest remote timestamp accepted
    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age;
        self
    }

    async fn exchange(&self, peer: &Peer) -> Result<SharedKey> {
        let hellos = peer.receive_message::<HandshakeHello>()?;
        let proofs = peer.receive_message::<HandshakeProof>()?;

        let secret = EphemeralSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        let nonce = generate_nonce();

        peer.send_message(&HandshakeHello {
            pub_key: public.to_bytes(),
            nonce,
            timestamp: current_timestamp()?,
        })
        .await?;

        let remote: HandshakeHello = match hellos.recv_timeout(self.timeout).await {
            Ok(message) => crate::protocol::message::downcast(message)?,
            Err(ProtocolError::Timeout) => return Err(reject(peer, "timed out waiting for hello")),
            Err(e) => return Err(e),
        };
        if !verify_timestamp(remote.timestamp, self.max_age) {
            return Err(reject(peer, constants::ERR_INVALID_TIMESTAMP));
        }

        peer.send_message(&HandshakeProof {
            nonce_verification: hash_nonce(&remote.nonce),
        })
        .await?;

        let proof: HandshakeProof = match proofs.recv_timeout(self.timeout).await {
            Ok(message) => crate::protocol::message::downcast(message)?,
            Err(ProtocolError::Timeout) => return Err(reject(peer, "timed out waiting for proof")),
            Err(e) => return Err(e),
        };
        if proof.nonce_verification != hash_nonce(&nonce) {
            return Err(reject(peer, "nonce verification mismatch"));
        }

        let shared = secret.diffie_hellman(&PublicKey::from(remote.pub_key));
        if !shared.was_contributory() {
            return Err(reject(peer, "non-contributory public key"));
        }

        peer.set(KEY_REMOTE_PUBLIC_KEY, remote.pub_key);
        Ok(match peer.direction() {
            Direction::Outbound => derive_key_from_shared_secret(&shared, &nonce, &remote.nonce),
            Direction::Inbound => derive_key_from_shared_secret(&shared, &remote.nonce, &nonce),
        })
    }
}

impl Default for EcdhBlock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Block for EcdhBlock {
    fn name(&self) -> &str {
        "ecdh"
    }

    fn on_register(&self, _protocol: &Protocol) -> Result<()> {
        register_message::<HandshakeHello>(OPCODE_NIL)?;
        register_message::<HandshakeProof>(OPCODE_NIL)?;
        Ok(())
    }

    #[instrument(skip_all, fields(peer_id = peer.id()))]
    async fn on_begin(&self, _protocol: &Protocol, peer: &Peer) -> Result<()> {
        let key = self.exchange(peer).await?;
        peer.set(KEY_SHARED_KEY, key);
        debug!("Shared key established");
        Ok(())
    }

    async fn on_end(&self, _protocol: &Protocol, peer: &Peer) -> Result<()> {
        peer.delete(KEY_SHARED_KEY);
        peer.delete(KEY_REMOTE_PUBLIC_KEY);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn test_timestamp_window() {
        let now = current_timestamp().unwrap();
        assert!(verify_timestamp(now, DEFAULT_MAX_AGE));
        assert!(verify_timestamp(now - 1_000, DEFAULT_MAX_AGE));
        assert!(!verify_timestamp(now - 31_000, DEFAULT_MAX_AGE));
        assert!(!verify_timestamp(now + 10_000, DEFAULT_MAX_AGE));
    }

    #[test]
    fn test_hello_roundtrip_and_truncation() {
        let hello = HandshakeHello {
            pub_key: [5; 32],
            nonce: [9; 16],
            timestamp: 1234,
        };
        let bytes = hello.write();
        assert_eq!(bytes.len(), 56);
        assert_eq!(HandshakeHello::read(&mut Reader::new(&bytes)).unwrap(), hello);
        assert!(HandshakeHello::read(&mut Reader::new(&bytes[..40])).is_err());
    }

    #[test]
    fn test_both_sides_derive_the_same_key() {
        let a_secret = EphemeralSecret::random_from_rng(OsRng);
        let a_public = PublicKey::from(&a_secret);
        let b_secret = EphemeralSecret::random_from_rng(OsRng);
        let b_public = PublicKey::from(&b_secret);
        let (a_nonce, b_nonce) = (generate_nonce(), generate_nonce());

        let a_shared = a_secret.diffie_hellman(&b_public);
        let b_shared = b_secret.diffie_hellman(&a_public);
        let a_key = derive_key_from_shared_secret(&a_shared, &a_nonce, &b_nonce);
        let b_key = derive_key_from_shared_secret(&b_shared, &a_nonce, &b_nonce);
        assert_eq!(a_key.as_bytes(), b_key.as_bytes());

        let swapped = derive_key_from_shared_secret(&b_shared, &b_nonce, &a_nonce);
        assert_ne!(swapped.as_bytes(), a_key.as_bytes());
    }

    #[test]
    fn test_shared_key_debug_hides_bytes() {
        assert_eq!(format!("{:?}", SharedKey::new([1; 32])), "SharedKey(..)");
    }
}
