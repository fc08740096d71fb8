//! # Transport Layer
//!
//! Byte-stream transports a [`Node`](crate::network::node::Node) runs on.
//!
//! The runtime only needs two things from a transport: a listener that yields
//! accepted connections, and a way to dial an address. Everything above the raw
//! stream (framing, opcodes, encryption) is handled by the peer.
//!
//! ## Implementations
//! - [`tcp::TcpTransport`]: TCP sockets
//! - [`memory::MemoryTransport`]: in-process buffered pipes, for tests and simulations
//!
//! Both are interchangeable; [`from_config`] picks one from configuration.

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::config::{TransportConfig, TransportKind};
use crate::error::Result;

pub mod memory;
pub mod tcp;

/// A duplex byte stream.
pub trait Stream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Stream for T {}

/// An established connection and the address of its remote end.
pub struct Connection {
    pub stream: Box<dyn Stream>,
    pub remote_address: String,
}

impl Connection {
    pub fn new<S: Stream + 'static>(stream: S, remote_address: impl Into<String>) -> Self {
        Self {
            stream: Box::new(stream),
            remote_address: remote_address.into(),
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("remote_address", &self.remote_address)
            .finish_non_exhaustive()
    }
}

/// Source of inbound connections.
#[async_trait]
pub trait Listener: Send + Sync {
    /// Wait for the next inbound connection.
    async fn accept(&mut self) -> Result<Connection>;

    /// Address other nodes can dial to reach this listener.
    fn local_address(&self) -> String;
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Bind a listener at `address`.
    async fn listen(&self, address: &str) -> Result<Box<dyn Listener>>;

    /// Open an outbound connection to `address`.
    async fn dial(&self, address: &str) -> Result<Connection>;
}

/// Build the transport named by `config.kind`.
pub fn from_config(config: &TransportConfig) -> Arc<dyn Transport> {
    match config.kind {
        TransportKind::Tcp => Arc::new(tcp::TcpTransport::new(config.tcp_nodelay)),
        TransportKind::Memory => Arc::new(memory::MemoryTransport::new(config.memory_buffer_size)),
    }
}
