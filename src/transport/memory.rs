//! In-process transport over `tokio::io::duplex` pipes.
//!
//! Listeners bind a name in a process-wide table. Binding an empty name or
//! `"memory:0"` picks a fresh unique name, which keeps parallel tests apart.
//! Every dialed connection is given its own address of the form
//! `memory:dial-<n>` so that peers can be told apart on the listening side.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, instrument};

use crate::error::{ProtocolError, Result};
use crate::transport::{Connection, Listener, Transport};

/// Pending connections a listener buffers before `dial` has to wait.
const ACCEPT_BACKLOG: usize = 64;

static LISTENERS: Lazy<Mutex<HashMap<String, mpsc::Sender<Connection>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

fn unique_name(prefix: &str) -> String {
    format!("memory:{prefix}-{}", NEXT_ID.fetch_add(1, Ordering::Relaxed))
}

fn listeners() -> std::sync::MutexGuard<'static, HashMap<String, mpsc::Sender<Connection>>> {
    LISTENERS
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[derive(Debug, Clone, Copy)]
pub struct MemoryTransport {
    buffer_size: usize,
}

impl MemoryTransport {
    /// `buffer_size` bounds the bytes in flight in each direction; writers
    /// block once it is reached.
    pub fn new(buffer_size: usize) -> Self {
        Self {
            buffer_size: buffer_size.max(1),
        }
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new(64 * 1024)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    #[instrument(skip(self))]
    async fn listen(&self, address: &str) -> Result<Box<dyn Listener>> {
        let name = match address {
            "" | "memory:0" => unique_name("listener"),
            other => other.to_string(),
        };

        let (tx, rx) = mpsc::channel(ACCEPT_BACKLOG);
        {
            let mut table = listeners();
            if table.get(&name).is_some_and(|existing| !existing.is_closed()) {
                return Err(ProtocolError::TransportError(format!(
                    "Address '{name}' is already in use"
                )));
            }
            table.insert(name.clone(), tx);
        }

        debug!(address = %name, "Listening on memory transport");
        Ok(Box::new(MemoryListener { name, incoming: rx }))
    }

    #[instrument(skip(self))]
    async fn dial(&self, address: &str) -> Result<Connection> {
        let sender = listeners().get(address).cloned().ok_or_else(|| {
            ProtocolError::TransportError(format!("No listener at '{address}'"))
        })?;

        let (local, remote) = tokio::io::duplex(self.buffer_size);
        let dialer_address = unique_name("dial");

        sender
            .send(Connection::new(remote, dialer_address))
            .await
            .map_err(|_| ProtocolError::TransportError(format!("Listener at '{address}' is closed")))?;

        Ok(Connection::new(local, address))
    }
}

struct MemoryListener {
    name: String,
    incoming: mpsc::Receiver<Connection>,
}

#[async_trait]
impl Listener for MemoryListener {
    async fn accept(&mut self) -> Result<Connection> {
        self.incoming.recv().await.ok_or_else(|| {
            ProtocolError::TransportError(format!("Listener '{}' was unbound", self.name))
        })
    }

    fn local_address(&self) -> String {
        self.name.clone()
    }
}

impl Drop for MemoryListener {
    fn drop(&mut self) {
        listeners().remove(&self.name);
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_dial_reaches_listener() {
        let transport = MemoryTransport::default();
        let mut listener = transport.listen("").await.unwrap();
        let address = listener.local_address();

        let mut dialed = transport.dial(&address).await.unwrap();
        let mut accepted = listener.accept().await.unwrap();
        assert_eq!(dialed.remote_address, address);
        assert_ne!(accepted.remote_address, address);

        dialed.stream.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        accepted.stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[tokio::test]
    async fn test_unique_names() {
        let transport = MemoryTransport::default();
        let a = transport.listen("").await.unwrap();
        let b = transport.listen("memory:0").await.unwrap();
        assert_ne!(a.local_address(), b.local_address());
    }

    #[tokio::test]
    async fn test_address_in_use_and_released() {
        let transport = MemoryTransport::default();
        let first = transport.listen("memory:test-in-use").await.unwrap();
        assert!(transport.listen("memory:test-in-use").await.is_err());
        drop(first);
        assert!(transport.listen("memory:test-in-use").await.is_ok());
    }

    #[tokio::test]
    async fn test_dial_unknown_address() {
        let result = MemoryTransport::default().dial("memory:nobody").await;
        assert!(matches!(result, Err(ProtocolError::TransportError(_))));
    }
}
