//! # Protocol Pipeline
//!
//! An ordered list of [`Block`]s, fixed once enforced on a node.
//!
//! For each peer the pipeline walks the state machine
//! `Pending → SettingUp(0) → … → SettingUp(n-1) → Live`. A failing block moves
//! the peer to `Disconnecting` instead; later blocks never start. Teardown ends
//! the blocks that did complete, last first.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use peer_protocol::protocol::handshake::EcdhBlock;
//! use peer_protocol::protocol::pipeline::Protocol;
//! use peer_protocol::protocol::secure::AeadBlock;
//!
//! # fn build(node: &peer_protocol::network::node::Node) -> peer_protocol::error::Result<()> {
//! Protocol::new()
//!     .register(Arc::new(EcdhBlock::new()))?
//!     .register(Arc::new(AeadBlock::new()))?
//!     .enforce(node)?;
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{ProtocolError, Result};
use crate::network::node::Node;
use crate::network::peer::{Peer, PeerState, SetupProgress};
use crate::protocol::block::Block;
use crate::utils::metrics::{global_metrics, Timer};

#[derive(Default)]
pub struct Protocol {
    blocks: Vec<Arc<dyn Block>>,
}

impl Protocol {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `block`, calling its [`Block::on_register`].
    ///
    /// # Errors
    /// `DuplicateBlock` if this exact block instance is already registered, or
    /// whatever `on_register` returns.
    pub fn register(mut self, block: Arc<dyn Block>) -> Result<Self> {
        let address = Arc::as_ptr(&block) as *const ();
        if self
            .blocks
            .iter()
            .any(|b| Arc::as_ptr(b) as *const () == address)
        {
            return Err(ProtocolError::DuplicateBlock(block.name().to_string()));
        }

        block.on_register(&self)?;
        debug!(block = block.name(), index = self.blocks.len(), "Registered block");
        self.blocks.push(block);
        Ok(self)
    }

    pub fn blocks(&self) -> &[Arc<dyn Block>] {
        &self.blocks
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Fix this pipeline as the one `node` runs for every peer.
    ///
    /// # Errors
    /// `ConfigError` if the node already has a protocol, including the empty
    /// one it falls back to once its first peer connects.
    pub fn enforce(self, node: &Node) -> Result<()> {
        node.enforce_protocol(Arc::new(self))
    }

    /// Run every block's setup stage against `peer`, in order.
    ///
    /// A stage still running when the peer disconnects is dropped and the
    /// call returns `ConnectionClosed`.
    ///
    /// On failure the peer is disconnected and the error returned. Routine
    /// rejections (`DisconnectPeer`) and closed connections are logged at
    /// debug, anything else at warn.
    pub async fn setup(self: &Arc<Self>, peer: &Peer) -> Result<()> {
        let _timer = Timer::start("pipeline_setup");
        let result = {
            let mut progress = peer.setup_progress().lock().await;
            progress.protocol = Some(self.clone());
            progress.completed = 0;
            self.run_blocks(peer, &mut progress).await
        };

        match result {
            Ok(()) => {
                if peer.set_state(PeerState::Live) {
                    global_metrics().setup_succeeded();
                    info!(peer_id = peer.id(), remote = %peer.remote_address(), "Peer is live");
                }
                Ok(())
            }
            Err(e) => {
                if e.is_disconnect() || e.is_closed() {
                    global_metrics().setup_rejected();
                    debug!(peer_id = peer.id(), error = %e, "Peer rejected during setup");
                } else {
                    global_metrics().setup_failed();
                    warn!(peer_id = peer.id(), error = %e, "Peer setup failed");
                }
                peer.disconnect();
                Err(e)
            }
        }
    }

    async fn run_blocks(&self, peer: &Peer, progress: &mut SetupProgress) -> Result<()> {
        for (index, block) in self.blocks.iter().enumerate() {
            if peer.is_disconnecting() || !peer.set_state(PeerState::SettingUp(index)) {
                return Err(ProtocolError::ConnectionClosed);
            }
            debug!(peer_id = peer.id(), block = block.name(), index, "Starting block");
            tokio::select! {
                biased;
                _ = peer.cancelled() => return Err(ProtocolError::ConnectionClosed),
                begun = block.on_begin(self, peer) => begun?,
            }
            progress.completed = index + 1;
        }
        if peer.is_disconnecting() {
            return Err(ProtocolError::ConnectionClosed);
        }
        Ok(())
    }

    /// End the first `completed` blocks, last first. Errors are logged only.
    pub(crate) async fn teardown(&self, peer: &Peer, completed: usize) {
        for block in self.blocks[..completed.min(self.blocks.len())].iter().rev() {
            if let Err(e) = block.on_end(self, peer).await {
                warn!(peer_id = peer.id(), block = block.name(), error = %e, "Block teardown failed");
            }
        }
    }
}

impl fmt::Debug for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.blocks.iter().map(|b| b.name()))
            .finish()
    }
}
