//! # peer-protocol
//!
//! A peer-to-peer node runtime: typed binary messages addressed by opcode,
//! delivered over per-connection concurrent peers, with a pipeline of
//! composable blocks that every connection passes through before it is trusted.
//!
//! ## Layers
//! - [`core`]: wire frames, the stream codec and the payload `Writer`/`Reader`
//! - [`protocol`]: messages, the opcode registry, blocks and the pipeline
//! - [`network`]: [`Node`] and [`Peer`]
//! - [`transport`]: TCP and in-memory transports
//! - [`config`], [`error`], [`utils`]: configuration, errors, logging and metrics
//!
//! ## Example
//! ```rust,no_run
//! use std::sync::Arc;
//! use peer_protocol::config::NetworkConfig;
//! use peer_protocol::protocol::handshake::EcdhBlock;
//! use peer_protocol::protocol::pipeline::Protocol;
//! use peer_protocol::protocol::secure::AeadBlock;
//! use peer_protocol::Node;
//!
//! # async fn run() -> peer_protocol::Result<()> {
//! let node = Node::new(NetworkConfig::default()).await?;
//! Protocol::new()
//!     .register(Arc::new(EcdhBlock::new()))?
//!     .register(Arc::new(AeadBlock::new()))?
//!     .enforce(&node)?;
//!
//! node.on_peer_disconnected(|_, peer| {
//!     tracing::info!(peer_id = peer.id(), "bye");
//!     Ok(())
//! });
//!
//! node.listen().await
//! # }
//! ```

#![cfg_attr(not(test), warn(clippy::unwrap_used, clippy::expect_used))]

pub mod config;
pub mod core;
pub mod error;
pub mod network;
pub mod protocol;
pub mod transport;
pub mod utils;

pub use crate::error::{ProtocolError, Result};
pub use crate::network::node::Node;
pub use crate::network::peer::{Direction, Peer, PeerState, Subscription};
pub use crate::protocol::block::Block;
pub use crate::protocol::message::Message;
pub use crate::protocol::opcode::{register_message, Opcode, OPCODE_NIL};
pub use crate::protocol::pipeline::Protocol;
