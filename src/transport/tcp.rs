use async_trait::async_trait;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, instrument};

use crate::error::{ProtocolError, Result};
use crate::transport::{Connection, Listener, Transport};

/// TCP transport
#[derive(Debug, Clone, Copy)]
pub struct TcpTransport {
    nodelay: bool,
}

impl TcpTransport {
    pub fn new(nodelay: bool) -> Self {
        Self { nodelay }
    }

    fn prepare(&self, stream: &TcpStream) -> Result<()> {
        stream.set_nodelay(self.nodelay)?;
        Ok(())
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new(true)
    }
}

fn parse_address(address: &str) -> Result<SocketAddr> {
    address
        .parse()
        .map_err(|e| ProtocolError::TransportError(format!("Invalid address '{address}': {e}")))
}

#[async_trait]
impl Transport for TcpTransport {
    #[instrument(skip(self))]
    async fn listen(&self, address: &str) -> Result<Box<dyn Listener>> {
        let listener = TcpListener::bind(parse_address(address)?).await?;
        let local = listener.local_addr()?;
        info!(address = %local, "Listening on TCP");
        Ok(Box::new(TcpAcceptor {
            listener,
            local,
            transport: *self,
        }))
    }

    #[instrument(skip(self))]
    async fn dial(&self, address: &str) -> Result<Connection> {
        let stream = TcpStream::connect(parse_address(address)?).await?;
        self.prepare(&stream)?;
        let remote = stream.peer_addr()?;
        debug!(remote = %remote, "Dialed TCP connection");
        Ok(Connection::new(stream, remote.to_string()))
    }
}

struct TcpAcceptor {
    listener: TcpListener,
    local: SocketAddr,
    transport: TcpTransport,
}

#[async_trait]
impl Listener for TcpAcceptor {
    async fn accept(&mut self) -> Result<Connection> {
        let (stream, remote) = self.listener.accept().await?;
        self.transport.prepare(&stream)?;
        debug!(remote = %remote, "Accepted TCP connection");
        Ok(Connection::new(stream, remote.to_string()))
    }

    fn local_address(&self) -> String {
        self.local.to_string()
    }
}
