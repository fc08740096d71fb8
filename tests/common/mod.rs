//! Helpers shared by the integration tests

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use peer_protocol::config::{NetworkConfig, PeerConfig, TransportKind};
use peer_protocol::core::payload::{Reader, Writer};
use peer_protocol::error::Result;
use peer_protocol::network::peer::{Direction, Peer};
use peer_protocol::protocol::opcode::{register_message, OPCODE_NIL};
use peer_protocol::transport::memory::MemoryTransport;
use peer_protocol::transport::{Connection, Transport};
use peer_protocol::utils::logging::init_test_logging;
use peer_protocol::{Message, Node};
use std::time::Duration;
use tokio::task::JoinHandle;

pub const WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chat {
    pub seq: u32,
    pub text: String,
}

impl Chat {
    pub fn new(seq: u32, text: &str) -> Self {
        Self {
            seq,
            text: text.to_string(),
        }
    }
}

impl Message for Chat {
    fn write(&self) -> Vec<u8> {
        Writer::new()
            .write_u32(self.seq)
            .write_string(&self.text)
            .into_bytes()
    }

    fn read(reader: &mut Reader<'_>) -> Result<Self> {
        Ok(Self {
            seq: reader.read_u32()?,
            text: reader.read_string()?,
        })
    }
}

pub fn register_chat() {
    register_message::<Chat>(OPCODE_NIL).expect("Chat should register");
}

pub fn memory_config() -> NetworkConfig {
    NetworkConfig::default_with_overrides(|c| {
        c.transport.kind = TransportKind::Memory;
        c.node.address = "memory:0".to_string();
    })
}

pub async fn memory_node() -> Node {
    init_test_logging();
    Node::new(memory_config()).await.expect("node should bind")
}

pub async fn memory_node_with(mutator: impl FnOnce(&mut NetworkConfig)) -> Node {
    init_test_logging();
    let mut config = memory_config();
    mutator(&mut config);
    Node::new(config).await.expect("node should bind")
}

pub fn spawn_listener(node: &Node) -> JoinHandle<Result<()>> {
    let node = node.clone();
    tokio::spawn(async move { node.listen().await })
}

/// Wait until `node` has registered a peer and return it.
pub async fn first_peer(node: &Node) -> Peer {
    tokio::time::timeout(WAIT, async {
        loop {
            if let Some(peer) = node.peers().into_iter().next() {
                return peer;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("a peer should connect")
}

/// Raw connected pair on the memory transport.
pub async fn connection_pair(buffer_size: usize) -> (Connection, Connection) {
    let transport = MemoryTransport::new(buffer_size);
    let mut listener = transport.listen("").await.unwrap();
    let dialed = transport.dial(&listener.local_address()).await.unwrap();
    let accepted = listener.accept().await.unwrap();
    (dialed, accepted)
}

/// Two standalone peers wired to each other.
pub async fn peer_pair(dialer: PeerConfig, listener: PeerConfig) -> (Peer, Peer) {
    init_test_logging();
    let (dialed, accepted) = connection_pair(64 * 1024).await;
    (
        Peer::new(dialed, Direction::Outbound, dialer),
        Peer::new(accepted, Direction::Inbound, listener),
    )
}

/// Wait until `node` holds exactly `count` peers.
pub async fn wait_for_peer_count(node: &Node, count: usize) {
    tokio::time::timeout(WAIT, async {
        while node.peer_count() != count {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("peer count should settle");
}
