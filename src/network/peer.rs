//! # Peer
//!
//! One live connection and the tasks that service it.
//!
//! Every peer runs two background tasks:
//! - a **read loop** that decodes frames and pushes each message into the
//!   mailbox of its opcode, and
//! - a **send worker** that drains the bounded queue fed by
//!   [`Peer::send_message_async`].
//!
//! [`Peer::disconnect`] is the single cancellation primitive. It wakes every
//! pending receive and send on the peer with `ConnectionClosed`, then runs
//! teardown once: the write half is shut down, blocks whose setup completed are
//! ended in reverse order, disconnect callbacks fire, and the owning node drops
//! the peer from its registry.
//!
//! ## Attributes
//! Blocks keep per-connection state in a string-keyed attribute store. Values
//! are shared as `Arc<T>` and read back with their concrete type.
//!
//! ```rust,no_run
//! # async fn demo(peer: peer_protocol::network::peer::Peer) {
//! peer.set("nickname", String::from("alice"));
//! let name = peer.get::<String>("nickname");
//! assert_eq!(name.as_deref().map(String::as_str), Some("alice"));
//! # }
//! ```

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::Duration;
use tokio::io::{ReadHalf, WriteHalf};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::PeerConfig;
use crate::core::codec::FrameCodec;
use crate::core::frame::{split_opcode, Frame, FrameCipher, FLAG_SEALED};
use crate::error::{constants, ProtocolError, Result};
use crate::network::node::{Node, NodeInner};
use crate::protocol::message::{downcast, Message};
use crate::protocol::opcode::{decode_message, require_opcode, Opcode};
use crate::protocol::pipeline::Protocol;
use crate::transport::{Connection, Stream};
use crate::utils::metrics::global_metrics;
use crate::utils::timeout::{with_timeout_error, SHUTDOWN_TIMEOUT};

type Writer = FramedWrite<WriteHalf<Box<dyn Stream>>, FrameCodec>;
type Reader = FramedRead<ReadHalf<Box<dyn Stream>>, FrameCodec>;
type Attribute = Arc<dyn Any + Send + Sync>;
type Cipher = Option<Arc<dyn FrameCipher>>;

static NEXT_PEER_ID: AtomicU64 = AtomicU64::new(1);

/// Which side opened the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Accepted by our listener
    Inbound,
    /// Dialed by us
    Outbound,
}

/// Where a peer is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// Connected, pipeline not started
    Pending,
    /// Running the setup stage of the block at this index
    SettingUp(usize),
    /// Every block succeeded
    Live,
    /// Cancelled, teardown in progress
    Disconnecting,
    /// Teardown finished
    Disconnected,
}

impl PeerState {
    fn is_closing(self) -> bool {
        matches!(self, PeerState::Disconnecting | PeerState::Disconnected)
    }
}

/// Blocks of the running pipeline that completed setup on this peer.
#[derive(Default)]
pub(crate) struct SetupProgress {
    pub(crate) protocol: Option<Arc<Protocol>>,
    pub(crate) completed: usize,
}

struct Mailbox {
    tx: mpsc::Sender<Box<dyn Message>>,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Box<dyn Message>>>>,
}

struct PeerInner {
    id: u64,
    remote_address: String,
    direction: Direction,
    config: PeerConfig,
    writer: tokio::sync::Mutex<Writer>,
    send_queue: mpsc::Sender<Frame>,
    mailboxes: Mutex<HashMap<Opcode, Mailbox>>,
    attributes: RwLock<HashMap<String, Attribute>>,
    cipher: watch::Sender<Cipher>,
    state: watch::Sender<PeerState>,
    setup: tokio::sync::Mutex<SetupProgress>,
    cancel: CancellationToken,
    disconnecting: AtomicBool,
    node: Weak<NodeInner>,
}

/// Handle to one connection. Cheap to clone; all clones share the same state.
#[derive(Clone)]
pub struct Peer {
    inner: Arc<PeerInner>,
}

impl Peer {
    /// Wrap `connection` in a peer that belongs to no node and start its tasks.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(connection: Connection, direction: Direction, config: PeerConfig) -> Self {
        Self::spawn(connection, direction, config, Weak::new())
    }

    pub(crate) fn spawn(
        connection: Connection,
        direction: Direction,
        config: PeerConfig,
        node: Weak<NodeInner>,
    ) -> Self {
        let codec = FrameCodec::new(config.max_frame_size);
        let (read_half, write_half) = tokio::io::split(connection.stream);
        let (queue_tx, queue_rx) = mpsc::channel(config.send_queue_capacity.max(1));

        let peer = Self {
            inner: Arc::new(PeerInner {
                id: NEXT_PEER_ID.fetch_add(1, Ordering::Relaxed),
                remote_address: connection.remote_address,
                direction,
                writer: tokio::sync::Mutex::new(FramedWrite::new(write_half, codec)),
                send_queue: queue_tx,
                mailboxes: Mutex::new(HashMap::new()),
                attributes: RwLock::new(HashMap::new()),
                cipher: watch::Sender::new(None),
                state: watch::Sender::new(PeerState::Pending),
                setup: tokio::sync::Mutex::new(SetupProgress::default()),
                cancel: CancellationToken::new(),
                disconnecting: AtomicBool::new(false),
                node,
                config,
            }),
        };

        debug!(
            peer_id = peer.id(),
            remote = %peer.remote_address(),
            direction = ?direction,
            "Peer created"
        );

        tokio::spawn(peer.clone().read_loop(FramedRead::new(read_half, codec)));
        tokio::spawn(peer.clone().send_worker(queue_rx));
        peer
    }

    /// Process-unique identifier.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn remote_address(&self) -> &str {
        &self.inner.remote_address
    }

    pub fn direction(&self) -> Direction {
        self.inner.direction
    }

    pub fn config(&self) -> &PeerConfig {
        &self.inner.config
    }

    pub fn state(&self) -> PeerState {
        *self.inner.state.borrow()
    }

    /// Receiver that observes every state change.
    pub fn watch_state(&self) -> watch::Receiver<PeerState> {
        self.inner.state.subscribe()
    }

    pub fn is_live(&self) -> bool {
        self.state() == PeerState::Live
    }

    /// True once [`Peer::disconnect`] has been called.
    pub fn is_disconnecting(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// The node this peer was created by, if it is still running.
    pub fn node(&self) -> Option<Node> {
        self.inner.node.upgrade().map(Node::from_inner)
    }

    /// Move to `next` unless teardown has begun. Only `Disconnected` may follow
    /// `Disconnecting`.
    pub(crate) fn set_state(&self, next: PeerState) -> bool {
        self.inner.state.send_if_modified(|current| {
            let allowed = match *current {
                PeerState::Disconnected => false,
                PeerState::Disconnecting => next == PeerState::Disconnected,
                _ => *current != next,
            };
            if allowed {
                *current = next;
            }
            allowed
        })
    }

    pub(crate) fn setup_progress(&self) -> &tokio::sync::Mutex<SetupProgress> {
        &self.inner.setup
    }

    /// Resolves once [`Peer::disconnect`] has been called.
    pub(crate) async fn cancelled(&self) {
        self.inner.cancel.cancelled().await;
    }

    // ---- attributes ----

    /// Store `value` under `key`, replacing any previous value.
    pub fn set<T: Any + Send + Sync>(&self, key: impl Into<String>, value: T) {
        self.attributes_mut().insert(key.into(), Arc::new(value));
    }

    /// Value under `key`, if present and of type `T`.
    pub fn get<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        let value = self.attributes().get(key).cloned()?;
        value.downcast::<T>().ok()
    }

    pub fn has(&self, key: &str) -> bool {
        self.attributes().contains_key(key)
    }

    /// Remove `key`. Returns whether it was present.
    pub fn delete(&self, key: &str) -> bool {
        self.attributes_mut().remove(key).is_some()
    }

    /// Return the value already under `key`, or store `value` and return it.
    ///
    /// The flag is `true` when an existing value was loaded. Returns `None` if
    /// the existing value is not a `T`.
    pub fn load_or_store<T: Any + Send + Sync>(
        &self,
        key: impl Into<String>,
        value: T,
    ) -> Option<(Arc<T>, bool)> {
        let mut attributes = self.attributes_mut();
        match attributes.entry(key.into()) {
            std::collections::hash_map::Entry::Occupied(entry) => {
                entry.get().clone().downcast::<T>().ok().map(|v| (v, true))
            }
            std::collections::hash_map::Entry::Vacant(entry) => {
                let stored = Arc::new(value);
                entry.insert(stored.clone());
                Some((stored, false))
            }
        }
    }

    fn attributes(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Attribute>> {
        self.inner
            .attributes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn attributes_mut(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Attribute>> {
        self.inner
            .attributes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    // ---- cipher ----

    /// Seal every later outbound frame with `cipher` and require inbound frames
    /// to be sealed.
    pub fn install_cipher(&self, cipher: Arc<dyn FrameCipher>) {
        self.inner.cipher.send_replace(Some(cipher));
        debug!(peer_id = self.id(), "Frame cipher installed");
    }

    pub fn has_cipher(&self) -> bool {
        self.inner.cipher.borrow().is_some()
    }

    // ---- receiving ----

    fn mailbox(&self, opcode: Opcode) -> (mpsc::Sender<Box<dyn Message>>, Subscription) {
        let mut mailboxes = self
            .inner
            .mailboxes
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let mailbox = mailboxes.entry(opcode).or_insert_with(|| {
            let (tx, rx) = mpsc::channel(self.inner.config.receive_buffer_capacity.max(1));
            Mailbox {
                tx,
                rx: Arc::new(tokio::sync::Mutex::new(rx)),
            }
        });
        (
            mailbox.tx.clone(),
            Subscription {
                opcode,
                rx: mailbox.rx.clone(),
                cancel: self.inner.cancel.clone(),
            },
        )
    }

    /// Subscription to every inbound message carrying `opcode`.
    ///
    /// All subscriptions for one opcode share a single mailbox, so each
    /// message goes to exactly one of them. Messages that arrive before the
    /// first call are buffered.
    pub fn receive(&self, opcode: Opcode) -> Subscription {
        self.mailbox(opcode).1
    }

    /// Subscription for the opcode `M` is registered under.
    pub fn receive_message<M: Message>(&self) -> Result<Subscription> {
        Ok(self.receive(require_opcode::<M>()?))
    }

    async fn read_loop(self, mut reader: Reader) {
        let mut cipher = self.inner.cipher.subscribe();
        let mut dropped_in_a_row = 0u32;

        loop {
            let next = tokio::select! {
                biased;
                _ = self.inner.cancel.cancelled() => break,
                next = reader.next() => next,
            };

            let frame = match next {
                Some(Ok(frame)) => frame,
                Some(Err(e)) if e.is_closed() => {
                    debug!(peer_id = self.id(), error = %e, "Connection closed by remote");
                    break;
                }
                Some(Err(e)) => {
                    global_metrics().decode_error();
                    warn!(peer_id = self.id(), error = %e, "Failed to read frame");
                    break;
                }
                None => {
                    debug!(peer_id = self.id(), "Connection closed by remote");
                    break;
                }
            };

            let wire_len = frame.wire_len() as u64;
            let message = match self.open_frame(frame, &mut cipher).await {
                Ok((opcode, body)) => decode_message(opcode, &body).map(|m| (opcode, m)),
                Err(e) => Err(e),
            };
            let (opcode, message) = match message {
                Ok(decoded) => decoded,
                Err(e) => {
                    global_metrics().decode_error();
                    warn!(peer_id = self.id(), error = %e, "Failed to decode frame");
                    break;
                }
            };
            global_metrics().message_received(wire_len);
            trace!(peer_id = self.id(), opcode, "Frame received");

            if self.deliver(opcode, message).await {
                dropped_in_a_row = 0;
                continue;
            }
            if self.is_disconnecting() {
                break;
            }

            dropped_in_a_row += 1;
            global_metrics().frame_dropped();
            warn!(
                peer_id = self.id(),
                opcode,
                dropped_in_a_row,
                "Dropped inbound message, nobody received it in time"
            );
            let limit = self.inner.config.max_dropped_frames;
            if limit > 0 && dropped_in_a_row >= limit {
                warn!(peer_id = self.id(), limit, "Too many dropped messages, disconnecting");
                break;
            }
        }

        self.disconnect();
    }

    /// Strip the cipher envelope, if any, and split off the opcode.
    async fn open_frame(
        &self,
        frame: Frame,
        cipher: &mut watch::Receiver<Cipher>,
    ) -> Result<(Opcode, Bytes)> {
        let installed = cipher.borrow().clone();
        let payload = match (frame.is_sealed(), installed) {
            (false, None) => frame.payload,
            (false, Some(_)) => {
                return Err(ProtocolError::Decode(constants::ERR_PLAIN_AFTER_CIPHER.into()));
            }
            (true, Some(c)) => Bytes::from(c.open(&frame.payload)?),
            (true, None) => {
                // The remote may seal its first frame before our own pipeline
                // has installed the matching cipher.
                let waited = tokio::time::timeout(
                    self.inner.config.receive_message_timeout,
                    cipher.wait_for(Option::is_some),
                )
                .await;
                let c = match waited {
                    Ok(Ok(current)) => current.as_ref().cloned(),
                    _ => None,
                }
                .ok_or_else(|| ProtocolError::Decode(constants::ERR_SEALED_WITHOUT_CIPHER.into()))?;
                Bytes::from(c.open(&frame.payload)?)
            }
        };
        split_opcode(payload)
    }

    /// Push into the opcode's mailbox, waiting at most the receive timeout.
    /// Returns false if the message was dropped.
    async fn deliver(&self, opcode: Opcode, message: Box<dyn Message>) -> bool {
        let (tx, _) = self.mailbox(opcode);
        tokio::select! {
            biased;
            _ = self.inner.cancel.cancelled() => false,
            sent = tokio::time::timeout(self.inner.config.receive_message_timeout, tx.send(message)) => {
                matches!(sent, Ok(Ok(())))
            }
        }
    }

    // ---- sending ----

    fn encode<M: Message>(&self, message: &M) -> Result<Frame> {
        let opcode = require_opcode::<M>()?;
        let mut frame = Frame::plain(opcode, &message.write());

        let installed = self.inner.cipher.borrow().clone();
        if let Some(cipher) = installed {
            frame = Frame {
                flags: frame.flags | FLAG_SEALED,
                payload: Bytes::from(cipher.seal(&frame.payload)?),
            };
        }

        if frame.wire_len() > self.inner.config.max_frame_size {
            return Err(ProtocolError::OversizedFrame(frame.wire_len()));
        }
        Ok(frame)
    }

    async fn write_frame(&self, frame: Frame) -> Result<()> {
        let wire_len = frame.wire_len() as u64;
        let write = async {
            let mut writer = self.inner.writer.lock().await;
            writer.send(frame).await
        };
        tokio::select! {
            biased;
            _ = self.inner.cancel.cancelled() => Err(ProtocolError::ConnectionClosed),
            written = write => {
                written?;
                global_metrics().message_sent(wire_len);
                Ok(())
            }
        }
    }

    /// Encode and write `message`, waiting for the write to finish.
    ///
    /// # Errors
    /// - `Timeout` if the write does not finish within the send timeout
    /// - `ConnectionClosed` if the peer disconnects first
    /// - `UnregisteredMessage` if `M` has no opcode
    pub async fn send_message<M: Message>(&self, message: &M) -> Result<()> {
        if self.is_disconnecting() {
            return Err(ProtocolError::ConnectionClosed);
        }
        let frame = self.encode(message)?;
        let result =
            with_timeout_error(self.write_frame(frame), self.inner.config.send_message_timeout)
                .await;
        if let Err(ProtocolError::Io(e)) = &result {
            warn!(peer_id = self.id(), error = %e, "Write failed, disconnecting");
            self.disconnect();
        }
        result
    }

    /// Queue `message` for the send worker.
    ///
    /// # Errors
    /// - `SendBusy` if the queue stays full for the busy timeout
    /// - `ConnectionClosed` if the peer disconnects first
    pub async fn send_message_async<M: Message>(&self, message: &M) -> Result<()> {
        if self.is_disconnecting() {
            return Err(ProtocolError::ConnectionClosed);
        }
        let frame = self.encode(message)?;
        let busy_timeout = self.inner.config.send_worker_busy_timeout;

        tokio::select! {
            biased;
            _ = self.inner.cancel.cancelled() => Err(ProtocolError::ConnectionClosed),
            queued = tokio::time::timeout(busy_timeout, self.inner.send_queue.send(frame)) => match queued {
                Ok(Ok(())) => Ok(()),
                Ok(Err(_)) => Err(ProtocolError::ConnectionClosed),
                Err(_) => {
                    global_metrics().send_queue_busy();
                    debug!(peer_id = self.id(), ?busy_timeout, "Send queue full");
                    Err(ProtocolError::SendBusy)
                }
            },
        }
    }

    async fn send_worker(self, mut queue: mpsc::Receiver<Frame>) {
        loop {
            let frame = tokio::select! {
                biased;
                _ = self.inner.cancel.cancelled() => break,
                frame = queue.recv() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
            };

            match self.write_frame(frame).await {
                Ok(()) => {}
                Err(ProtocolError::ConnectionClosed) => break,
                Err(e) => {
                    warn!(peer_id = self.id(), error = %e, "Queued write failed, disconnecting");
                    self.disconnect();
                    break;
                }
            }
        }
    }

    // ---- lifecycle ----

    /// Close the peer. Safe to call any number of times from anywhere.
    ///
    /// Returns immediately; teardown continues in the background. Await
    /// [`Peer::disconnected`] to wait for it.
    pub fn disconnect(&self) {
        if self.inner.disconnecting.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.cancel.cancel();
        self.set_state(PeerState::Disconnecting);
        debug!(peer_id = self.id(), remote = %self.remote_address(), "Disconnecting peer");

        match Handle::try_current() {
            Ok(handle) => {
                handle.spawn(self.clone().teardown());
            }
            Err(_) => {
                warn!(peer_id = self.id(), "No runtime available, skipping teardown");
                self.inner.state.send_replace(PeerState::Disconnected);
            }
        }
    }

    async fn teardown(self) {
        let shutdown = async {
            let mut writer = self.inner.writer.lock().await;
            writer.close().await
        };
        if let Err(e) = with_timeout_error(shutdown, SHUTDOWN_TIMEOUT).await {
            debug!(peer_id = self.id(), error = %e, "Write half did not shut down cleanly");
        }

        // A running setup stage is dropped on cancellation, releasing the lock.
        let progress = std::mem::take(&mut *self.inner.setup.lock().await);

        if let Some(protocol) = progress.protocol {
            protocol.teardown(&self, progress.completed).await;
        }

        if let Some(node) = self.node() {
            node.release_peer(&self);
        }

        self.inner.state.send_replace(PeerState::Disconnected);
        info!(peer_id = self.id(), remote = %self.remote_address(), "Peer disconnected");
    }

    /// Wait until teardown has finished.
    pub async fn disconnected(&self) {
        let mut state = self.inner.state.subscribe();
        let _ = state.wait_for(|s| *s == PeerState::Disconnected).await;
    }

    /// Wait until the pipeline has finished, returning whether the peer is live.
    pub async fn wait_until_ready(&self) -> bool {
        let mut state = self.inner.state.subscribe();
        let live = state
            .wait_for(|s| *s == PeerState::Live || s.is_closing())
            .await
            .map(|s| *s == PeerState::Live)
            .unwrap_or(false);
        live
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.inner.id)
            .field("remote_address", &self.inner.remote_address)
            .field("direction", &self.inner.direction)
            .field("state", &self.state())
            .finish()
    }
}

/// Receiving end of one opcode's mailbox. Clones share the mailbox.
#[derive(Clone)]
pub struct Subscription {
    opcode: Opcode,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Box<dyn Message>>>>,
    cancel: CancellationToken,
}

impl Subscription {
    pub fn opcode(&self) -> Opcode {
        self.opcode
    }

    /// Next message, in arrival order.
    ///
    /// Buffered messages are still returned after the peer disconnects; once
    /// the mailbox is empty this returns `ConnectionClosed`.
    pub async fn recv(&self) -> Result<Box<dyn Message>> {
        let mut rx = tokio::select! {
            biased;
            rx = self.rx.lock() => rx,
            _ = self.cancel.cancelled() => return Err(ProtocolError::ConnectionClosed),
        };

        if let Ok(message) = rx.try_recv() {
            return Ok(message);
        }

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(ProtocolError::ConnectionClosed),
            message = rx.recv() => message.ok_or(ProtocolError::ConnectionClosed),
        }
    }

    /// [`Subscription::recv`] bounded by `timeout`.
    pub async fn recv_timeout(&self, timeout: Duration) -> Result<Box<dyn Message>> {
        with_timeout_error(self.recv(), timeout).await
    }

    /// Next message as `M`. A message of another type is `UnexpectedMessage`.
    pub async fn recv_as<M: Message>(&self) -> Result<M> {
        downcast(self.recv().await?)
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("opcode", &self.opcode)
            .finish_non_exhaustive()
    }
}
