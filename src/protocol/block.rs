//! # Blocks
//!
//! A block is one unit of per-connection behavior in a [`Protocol`]: a key
//! exchange, an encryption layer, an identity check. Blocks are registered
//! once, then run against every peer of the node the protocol is enforced on.
//!
//! - [`Block::on_register`] runs once, at registration. Blocks register their
//!   message types here.
//! - [`Block::on_begin`] is the setup stage. Blocks run in registration order;
//!   the first error stops the pipeline and disconnects the peer. Return
//!   [`ProtocolError::DisconnectPeer`](crate::error::ProtocolError::DisconnectPeer)
//!   to reject a peer for an ordinary protocol reason.
//! - [`Block::on_end`] is the teardown stage. It runs, in reverse order, for
//!   every block whose `on_begin` succeeded on the peer being disconnected.
//!
//! A block is shared by every peer, so per-peer state belongs in the peer's
//! attribute store, not in the block.

use async_trait::async_trait;

use crate::error::Result;
use crate::network::peer::Peer;
use crate::protocol::pipeline::Protocol;

#[async_trait]
pub trait Block: Send + Sync + 'static {
    /// Name used in logs.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    fn on_register(&self, _protocol: &Protocol) -> Result<()> {
        Ok(())
    }

    async fn on_begin(&self, protocol: &Protocol, peer: &Peer) -> Result<()>;

    async fn on_end(&self, _protocol: &Protocol, _peer: &Peer) -> Result<()> {
        Ok(())
    }
}
