//! # Node
//!
//! Owns a listener, the registry of live peers and the lifecycle callbacks.
//!
//! ## Lifecycle of a connection
//! 1. The transport accepts or dials a connection and the node wraps it in a
//!    [`Peer`], registering it.
//! 2. `on_peer_init` callbacks run, then `on_peer_connected` (inbound) or
//!    `on_peer_dialed` (outbound).
//! 3. The enforced [`Protocol`] runs every block's setup stage in order.
//! 4. On disconnect, teardown ends the blocks, `on_peer_disconnected` callbacks
//!    run and the peer leaves the registry.
//!
//! A failing callback or block only ever disconnects its own peer.
//!
//! ## Example
//! ```rust,no_run
//! use peer_protocol::config::NetworkConfig;
//! use peer_protocol::network::node::Node;
//! use peer_protocol::protocol::pipeline::Protocol;
//!
//! # async fn run() -> peer_protocol::error::Result<()> {
//! let node = Node::new(NetworkConfig::default()).await?;
//! Protocol::new().enforce(&node)?;
//!
//! let listener = node.clone();
//! tokio::spawn(async move { listener.listen().await });
//!
//! let peer = node.dial("127.0.0.1:9000").await?;
//! println!("connected to {}", peer.remote_address());
//! node.kill().await;
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError, RwLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::NetworkConfig;
use crate::error::{constants, ProtocolError, Result};
use crate::network::peer::{Direction, Peer};
use crate::protocol::pipeline::Protocol;
use crate::transport::{self, Connection, Listener, Transport};
use crate::utils::metrics::global_metrics;
use crate::utils::timeout::with_timeout_error;

/// Pause after a failed accept before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Handler run at a lifecycle point. An error counts as a setup failure.
pub type PeerCallback = Arc<dyn Fn(&Node, &Peer) -> Result<()> + Send + Sync>;

#[derive(Default)]
struct Callbacks {
    init: RwLock<Vec<PeerCallback>>,
    dialed: RwLock<Vec<PeerCallback>>,
    connected: RwLock<Vec<PeerCallback>>,
    disconnected: RwLock<Vec<PeerCallback>>,
}

pub(crate) struct NodeInner {
    config: NetworkConfig,
    transport: Arc<dyn Transport>,
    listener: Mutex<Option<Box<dyn Listener>>>,
    external_address: String,
    peers: RwLock<HashMap<u64, Peer>>,
    protocol: OnceLock<Arc<Protocol>>,
    callbacks: Callbacks,
    kill: CancellationToken,
    killed: AtomicBool,
}

/// A running node. Cheap to clone; clones share the same node.
#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

impl Node {
    /// Bind a node on the transport named by `config.transport`.
    pub async fn new(config: NetworkConfig) -> Result<Self> {
        let transport = transport::from_config(&config.transport);
        Self::with_transport(config, transport).await
    }

    /// Bind a node at `config.node.address` on `transport`.
    #[instrument(skip(config, transport), fields(address = %config.node.address))]
    pub async fn with_transport(config: NetworkConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        config.validate_strict()?;

        let listener = transport.listen(&config.node.address).await?;
        let external_address = listener.local_address();
        info!(address = %external_address, "Node bound");

        Ok(Self {
            inner: Arc::new(NodeInner {
                config,
                transport,
                listener: Mutex::new(Some(listener)),
                external_address,
                peers: RwLock::new(HashMap::new()),
                protocol: OnceLock::new(),
                callbacks: Callbacks::default(),
                kill: CancellationToken::new(),
                killed: AtomicBool::new(false),
            }),
        })
    }

    pub(crate) fn from_inner(inner: Arc<NodeInner>) -> Self {
        Self { inner }
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.inner.config
    }

    /// Address other nodes dial to reach this one.
    pub fn external_address(&self) -> &str {
        &self.inner.external_address
    }

    /// The enforced protocol. A node with none enforced runs an empty pipeline,
    /// and the first peer fixes that choice.
    pub fn protocol(&self) -> Arc<Protocol> {
        self.inner
            .protocol
            .get_or_init(|| Arc::new(Protocol::new()))
            .clone()
    }

    pub(crate) fn enforce_protocol(&self, protocol: Arc<Protocol>) -> Result<()> {
        let blocks = protocol.len();
        self.inner
            .protocol
            .set(protocol)
            .map_err(|_| ProtocolError::ConfigError(constants::ERR_PROTOCOL_ENFORCED.into()))?;
        info!(blocks, "Protocol enforced");
        Ok(())
    }

    pub fn is_killed(&self) -> bool {
        self.inner.killed.load(Ordering::SeqCst)
    }

    // ---- callbacks ----

    fn push(hooks: &RwLock<Vec<PeerCallback>>, hook: PeerCallback) {
        hooks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(hook);
    }

    /// Run after a peer is created, for both directions.
    pub fn on_peer_init<F>(&self, f: F)
    where
        F: Fn(&Node, &Peer) -> Result<()> + Send + Sync + 'static,
    {
        Self::push(&self.inner.callbacks.init, Arc::new(f));
    }

    /// Run for outbound peers after `on_peer_init`.
    pub fn on_peer_dialed<F>(&self, f: F)
    where
        F: Fn(&Node, &Peer) -> Result<()> + Send + Sync + 'static,
    {
        Self::push(&self.inner.callbacks.dialed, Arc::new(f));
    }

    /// Run for inbound peers after `on_peer_init`.
    pub fn on_peer_connected<F>(&self, f: F)
    where
        F: Fn(&Node, &Peer) -> Result<()> + Send + Sync + 'static,
    {
        Self::push(&self.inner.callbacks.connected, Arc::new(f));
    }

    /// Run once per peer after its blocks were torn down.
    pub fn on_peer_disconnected<F>(&self, f: F)
    where
        F: Fn(&Node, &Peer) -> Result<()> + Send + Sync + 'static,
    {
        Self::push(&self.inner.callbacks.disconnected, Arc::new(f));
    }

    /// Run `hooks` in registration order, stopping at the first error.
    fn run_callbacks(&self, hooks: &RwLock<Vec<PeerCallback>>, peer: &Peer) -> Result<()> {
        // Cloned out so a handler may register further handlers.
        let hooks: Vec<PeerCallback> = hooks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        hooks.iter().try_for_each(|hook| hook(self, peer))
    }

    // ---- registry ----

    fn register_peer(&self, connection: Connection, direction: Direction) -> Result<Peer> {
        let max_peers = self.inner.config.node.max_peers;
        let mut peers = self
            .inner
            .peers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if max_peers > 0 && peers.len() >= max_peers {
            return Err(ProtocolError::TransportError(constants::ERR_PEER_LIMIT.into()));
        }

        let peer = Peer::spawn(
            connection,
            direction,
            self.inner.config.peer.clone(),
            Arc::downgrade(&self.inner),
        );
        peers.insert(peer.id(), peer.clone());
        global_metrics().peer_registered();
        Ok(peer)
    }

    /// Called once per peer by its teardown.
    pub(crate) fn release_peer(&self, peer: &Peer) {
        if let Err(e) = self.run_callbacks(&self.inner.callbacks.disconnected, peer) {
            warn!(peer_id = peer.id(), error = %e, "Disconnect callback failed");
        }

        let removed = self
            .inner
            .peers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&peer.id());
        if removed.is_some() {
            global_metrics().peer_removed();
        }
    }

    pub fn peer(&self, id: u64) -> Option<Peer> {
        self.inner
            .peers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    /// First registered peer whose remote address is `address`.
    pub fn peer_by_address(&self, address: &str) -> Option<Peer> {
        self.inner
            .peers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .find(|p| p.remote_address() == address)
            .cloned()
    }

    pub fn peers(&self) -> Vec<Peer> {
        self.inner
            .peers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn peer_count(&self) -> usize {
        self.inner
            .peers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    // ---- connections ----

    /// Accept connections until [`Node::kill`] is called.
    ///
    /// Each connection is set up on its own task; a failure there disconnects
    /// that peer and never stops the loop.
    ///
    /// # Errors
    /// Fails immediately if the listener is already running or the node was
    /// killed.
    #[instrument(skip(self), fields(address = %self.external_address()))]
    pub async fn listen(&self) -> Result<()> {
        let mut listener = self
            .inner
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| ProtocolError::Custom(constants::ERR_LISTENER_TAKEN.into()))?;

        info!("Listening for peers");
        loop {
            let accepted = tokio::select! {
                biased;
                _ = self.inner.kill.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok(connection) => {
                    global_metrics().connection_accepted();
                    let node = self.clone();
                    tokio::spawn(async move { node.handle_inbound(connection).await });
                }
                Err(e) => {
                    warn!(error = %e, "Failed to accept connection");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }

        info!("Listener stopped");
        Ok(())
    }

    async fn handle_inbound(self, connection: Connection) {
        let remote = connection.remote_address.clone();
        let peer = match self.register_peer(connection, Direction::Inbound) {
            Ok(peer) => peer,
            Err(e) => {
                warn!(remote = %remote, error = %e, "Rejected inbound connection");
                return;
            }
        };
        if self.is_killed() {
            peer.disconnect();
            return;
        }

        let callbacks = self
            .run_callbacks(&self.inner.callbacks.init, &peer)
            .and_then(|()| self.run_callbacks(&self.inner.callbacks.connected, &peer));
        if let Err(e) = callbacks {
            log_rejection(&peer, &e, "Inbound peer rejected by callback");
            peer.disconnect();
            return;
        }

        // Errors are logged by the pipeline, which also disconnects the peer.
        let _ = self.protocol().setup(&peer).await;
    }

    /// Connect to `address` and run the pipeline.
    ///
    /// Returns the peer only once it is live. On failure the peer has already
    /// been fully disconnected and the causing error is returned; a block's
    /// routine rejection satisfies [`ProtocolError::is_disconnect`].
    #[instrument(skip(self))]
    pub async fn dial(&self, address: &str) -> Result<Peer> {
        if self.is_killed() {
            return Err(ProtocolError::Custom(constants::ERR_NODE_KILLED.into()));
        }

        let connection = with_timeout_error(
            self.inner.transport.dial(address),
            self.inner.config.node.dial_timeout,
        )
        .await?;
        global_metrics().connection_dialed();

        let peer = self.register_peer(connection, Direction::Outbound)?;
        debug!(peer_id = peer.id(), "Dialed peer");
        // A concurrent kill may have taken its peer snapshot before we registered.
        if self.is_killed() {
            peer.disconnect();
            peer.disconnected().await;
            return Err(ProtocolError::Custom(constants::ERR_NODE_KILLED.into()));
        }

        let result = match self
            .run_callbacks(&self.inner.callbacks.init, &peer)
            .and_then(|()| self.run_callbacks(&self.inner.callbacks.dialed, &peer))
        {
            Ok(()) => self.protocol().setup(&peer).await,
            Err(e) => {
                log_rejection(&peer, &e, "Outbound peer rejected by callback");
                Err(e)
            }
        };

        match result {
            Ok(()) => Ok(peer),
            Err(e) => {
                peer.disconnect();
                peer.disconnected().await;
                Err(e)
            }
        }
    }

    /// Stop listening and disconnect every peer, waiting for their teardown.
    /// Calling it again does nothing.
    pub async fn kill(&self) {
        if self.inner.killed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(address = %self.external_address(), "Killing node");

        self.inner.kill.cancel();
        drop(
            self.inner
                .listener
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take(),
        );

        let peers = self.peers();
        for peer in &peers {
            peer.disconnect();
        }
        futures::future::join_all(peers.iter().map(Peer::disconnected)).await;
        global_metrics().log_metrics();
    }
}

fn log_rejection(peer: &Peer, error: &ProtocolError, message: &str) {
    if error.is_disconnect() {
        debug!(peer_id = peer.id(), error = %error, "{message}");
    } else {
        warn!(peer_id = peer.id(), error = %error, "{message}");
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("external_address", &self.inner.external_address)
            .field("peers", &self.peer_count())
            .field("killed", &self.is_killed())
            .finish()
    }
}
