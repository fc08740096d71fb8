//! Authenticated encryption block.
//!
//! Runs after a key agreement block has stored a [`SharedKey`] under
//! [`KEY_SHARED_KEY`]. It installs an XChaCha20-Poly1305 [`FrameCipher`] on the
//! peer, so every later frame is sealed, then trades a sealed [`AeadAck`] with
//! the remote. Receiving the remote's ACK proves both sides hold the same key.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, instrument};

use crate::core::frame::FrameCipher;
use crate::core::payload::Reader;
use crate::error::{constants, ProtocolError, Result};
use crate::network::peer::Peer;
use crate::protocol::block::Block;
use crate::protocol::handshake::{SharedKey, KEY_SHARED_KEY};
use crate::protocol::message::Message;
use crate::protocol::opcode::{register_message, OPCODE_NIL};
use crate::protocol::pipeline::Protocol;
use crate::utils::crypto::Crypto;
use crate::utils::timeout::DEFAULT_TIMEOUT;

/// Attribute key of the authentication signal, a `watch::Sender<bool>`.
pub const KEY_AUTHENTICATED: &str = "aead.authenticated";

impl FrameCipher for Crypto {
    fn seal(&self, payload: &[u8]) -> Result<Vec<u8>> {
        Crypto::seal(self, payload)
    }

    fn open(&self, sealed: &[u8]) -> Result<Vec<u8>> {
        Crypto::open(self, sealed)
    }
}

/// Sent sealed by each side once its cipher is installed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AeadAck;

impl Message for AeadAck {
    fn write(&self) -> Vec<u8> {
        Vec::new()
    }

    fn read(_reader: &mut Reader<'_>) -> Result<Self> {
        Ok(AeadAck)
    }
}

fn authenticated_signal(peer: &Peer) -> Option<Arc<watch::Sender<bool>>> {
    peer.load_or_store(KEY_AUTHENTICATED, watch::Sender::new(false))
        .map(|(signal, _)| signal)
}

/// Whether the peer finished the ACK exchange.
pub fn is_authenticated(peer: &Peer) -> bool {
    peer.get::<watch::Sender<bool>>(KEY_AUTHENTICATED)
        .is_some_and(|signal| *signal.borrow())
}

/// Wait until the peer finished the ACK exchange.
///
/// # Errors
/// - `ConnectionClosed` if the peer disconnects first
/// - `ConfigError` if [`KEY_AUTHENTICATED`] holds something other than the signal
pub async fn wait_until_authenticated(peer: &Peer) -> Result<()> {
    let mut authenticated = authenticated_signal(peer)
        .ok_or_else(|| ProtocolError::ConfigError(constants::ERR_AUTH_ATTRIBUTE_TYPE.into()))?
        .subscribe();

    tokio::select! {
        done = authenticated.wait_for(|ok| *ok) => done
            .map(|_| ())
            .map_err(|_| ProtocolError::ConnectionClosed),
        _ = peer.disconnected() => Err(ProtocolError::ConnectionClosed),
    }
}

/// XChaCha20-Poly1305 encryption block
#[derive(Debug, Clone)]
pub struct AeadBlock {
    ack_timeout: Duration,
}

impl AeadBlock {
    pub fn new() -> Self {
        Self {
            ack_timeout: DEFAULT_TIMEOUT,
        }
    }

    /// How long to wait for the remote ACK
    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }
}

impl Default for AeadBlock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Block for AeadBlock {
    fn name(&self) -> &str {
        "aead"
    }

    fn on_register(&self, _protocol: &Protocol) -> Result<()> {
        register_message::<AeadAck>(OPCODE_NIL)?;
        Ok(())
    }

    #[instrument(skip_all, fields(peer_id = peer.id()))]
    async fn on_begin(&self, _protocol: &Protocol, peer: &Peer) -> Result<()> {
        let Some(key) = peer.get::<SharedKey>(KEY_SHARED_KEY) else {
            debug!(reason = constants::ERR_MISSING_SHARED_KEY, "Encryption rejected");
            return Err(ProtocolError::DisconnectPeer);
        };

        let acks = peer.receive_message::<AeadAck>()?;
        peer.install_cipher(Arc::new(Crypto::new(key.as_bytes())));
        peer.send_message(&AeadAck).await?;

        match acks.recv_timeout(self.ack_timeout).await {
            Ok(_) => {}
            Err(ProtocolError::Timeout) => {
                debug!(reason = "timed out waiting for ACK", "Encryption rejected");
                return Err(ProtocolError::DisconnectPeer);
            }
            Err(e) => return Err(e),
        }

        if let Some(signal) = authenticated_signal(peer) {
            signal.send_replace(true);
        }
        debug!("Peer authenticated");
        Ok(())
    }

    async fn on_end(&self, _protocol: &Protocol, peer: &Peer) -> Result<()> {
        peer.delete(KEY_SHARED_KEY);
        Ok(())
    }
}
