//! Cluster Membership
//!
//! Node identity, the shared-secret handshake, heartbeat failure detection
//! and gossip-driven full-mesh convergence.
//!
//! ## Link lifecycle
//!
//! 1. The connecting side sends `Hello` with its id, incarnation, protocol
//!    version and the digest of the cluster secret.
//! 2. The accepting side validates it and answers `Welcome` (or `Reject`).
//! 3. Both sides register the link and publish [`ClusterEvent::NodeUp`].
//! 4. Heartbeats flow in both directions; silence for `miss_threshold`
//!    intervals, EOF, or a `Goodbye` ends the link with
//!    [`ClusterEvent::NodeDown`].
//!
//! When two links exist between the same pair of nodes, the one initiated by
//! the smaller [`NodeId`] is kept on both sides.

mod link;
pub mod node;

pub use node::{NodeId, NodeInfo, NodeStatus};

use crate::events::{EventBus, Subscription};
use crate::protocol::{Frame, SharedSecret, WireFormat};
use crate::transports::tcp::{self, FrameReader, FrameWriter, TcpConfig};
use crate::{Result, TransportError};
use link::{LastSeen, LinkContext};
use node_config::NodeConfig;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, info, warn};

/// Reject reason sent when a link loses duplicate resolution
const DUPLICATE_LINK: &str = "duplicate link";

/// How long a graceful stop waits for goodbyes to flush
const GOODBYE_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Membership configuration
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    pub node_name: String,
    pub host: String,
    pub port: u16,
    pub seeds: Vec<String>,
    pub heartbeat_interval: Duration,
    pub heartbeat_miss_threshold: u32,
    pub secret: String,
    pub gossip_interval: Duration,
    pub tcp: TcpConfig,
}

impl From<&NodeConfig> for ClusterConfig {
    fn from(config: &NodeConfig) -> Self {
        Self {
            node_name: config.node_name.clone(),
            host: config.host.clone(),
            port: config.port,
            seeds: config.seeds.clone(),
            heartbeat_interval: config.heartbeat_interval(),
            heartbeat_miss_threshold: config.heartbeat_miss_threshold,
            secret: config.cluster_secret.clone(),
            gossip_interval: config.gossip_interval(),
            tcp: TcpConfig {
                connect_timeout: config.connect_timeout(),
                max_frame_size: config.max_frame_size,
            },
        }
    }
}

/// Why a peer is no longer connected
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownReason {
    HeartbeatTimeout,
    ConnectionClosed,
    Goodbye(String),
    LocalShutdown,
}

impl fmt::Display for DownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DownReason::HeartbeatTimeout => f.write_str("heartbeat_timeout"),
            DownReason::ConnectionClosed => f.write_str("connection_closed"),
            DownReason::Goodbye(reason) => write!(f, "goodbye: {}", reason),
            DownReason::LocalShutdown => f.write_str("local_shutdown"),
        }
    }
}

/// Membership changes observed by this node
#[derive(Debug, Clone)]
pub enum ClusterEvent {
    NodeUp(NodeInfo),
    NodeDown { node: NodeId, reason: DownReason },
    HandshakeFailed { address: String, reason: String },
}

/// Data frame received from a peer
#[derive(Debug, Clone)]
pub struct InboundFrame {
    pub from: NodeId,
    pub payload: Vec<u8>,
}

struct LinkEntry {
    link_id: u64,
    initiator: NodeId,
    incarnation: u64,
    tx: mpsc::UnboundedSender<Frame>,
    reader: Option<AbortHandle>,
    writer: Option<JoinHandle<()>>,
}

impl LinkEntry {
    fn abort(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        if let Some(writer) = self.writer.take() {
            writer.abort();
        }
    }
}

#[derive(Default)]
struct ClusterState {
    links: HashMap<NodeId, LinkEntry>,
    nodes: HashMap<NodeId, NodeInfo>,
    /// Addresses with an outbound handshake in flight
    connecting: HashSet<String>,
}

impl ClusterState {
    fn linked_to_address(&self, address: &str) -> bool {
        self.links.keys().any(|node| node.address() == address)
    }
}

pub(crate) struct ClusterInner {
    id: NodeId,
    incarnation: u64,
    local_addr: SocketAddr,
    config: ClusterConfig,
    secret: SharedSecret,
    epoch: Instant,
    state: Mutex<ClusterState>,
    events: EventBus<ClusterEvent>,
    inbound_tx: mpsc::UnboundedSender<InboundFrame>,
    inbound_rx: Mutex<Option<mpsc::UnboundedReceiver<InboundFrame>>>,
    listener: Mutex<Option<TcpListener>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    stopped: AtomicBool,
    next_link_id: AtomicU64,
}

/// Handle to this node's cluster membership
#[derive(Clone)]
pub struct Cluster {
    inner: Arc<ClusterInner>,
}

impl Cluster {
    /// Bind, start background loops and dial the seeds
    pub async fn start(config: ClusterConfig) -> Result<Self> {
        let cluster = Self::bind(config).await?;
        cluster.join();
        Ok(cluster)
    }

    /// Bind the listener without accepting or dialing anyone yet.
    ///
    /// Lets the caller subscribe to events before the first peer can appear;
    /// [`Cluster::join`] starts the rest.
    pub async fn bind(config: ClusterConfig) -> Result<Self> {
        if config.heartbeat_interval.is_zero() || config.heartbeat_miss_threshold == 0 {
            return Err(TransportError::configuration(
                "heartbeat interval and miss threshold must be non-zero",
                Some("heartbeat_interval"),
            ));
        }

        let listener = tcp::bind(&config.host, config.port).await?;
        let local_addr = listener.local_addr()?;
        let id = NodeId::new(&config.node_name, &config.host, local_addr.port());
        let incarnation = rand::random::<u64>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(ClusterInner {
            id,
            incarnation,
            local_addr,
            secret: SharedSecret::new(&config.secret),
            config,
            epoch: Instant::now(),
            state: Mutex::new(ClusterState::default()),
            events: EventBus::new(),
            inbound_tx,
            inbound_rx: Mutex::new(Some(inbound_rx)),
            listener: Mutex::new(Some(listener)),
            tasks: Mutex::new(Vec::new()),
            stopped: AtomicBool::new(false),
            next_link_id: AtomicU64::new(1),
        });

        Ok(Self { inner })
    }

    /// Start accepting peers, gossiping and dialing seeds. Idempotent.
    pub fn join(&self) {
        let inner = &self.inner;
        if inner.stopped.load(Ordering::SeqCst) {
            return;
        }
        let Some(listener) = inner.listener.lock().take() else {
            return;
        };

        let accept = tokio::spawn(accept_loop(Arc::downgrade(inner), listener));
        let gossip = tokio::spawn(gossip_loop(
            Arc::downgrade(inner),
            inner.config.gossip_interval,
        ));
        inner.tasks.lock().extend([accept, gossip]);

        info!(
            node = %inner.id,
            incarnation = inner.incarnation,
            seeds = inner.config.seeds.len(),
            "Cluster membership started"
        );

        inner.dial_seeds();
    }

    pub fn id(&self) -> &NodeId {
        &self.inner.id
    }

    pub fn incarnation(&self) -> u64 {
        self.inner.incarnation
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    pub fn is_running(&self) -> bool {
        !self.inner.stopped.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> Subscription<ClusterEvent> {
        self.inner.events.subscribe()
    }

    /// Receiver of data frames from all peers; only the first caller gets it
    pub fn take_inbound(&self) -> Option<mpsc::UnboundedReceiver<InboundFrame>> {
        self.inner.inbound_rx.lock().take()
    }

    /// Connect to `address` (`host:port` or `name@host:port`) and handshake
    pub async fn connect(&self, address: &str) -> Result<NodeId> {
        self.inner.connect_to(address).await
    }

    /// Queue `payload` for delivery to `node`
    pub fn send(&self, node: &NodeId, payload: Vec<u8>) -> Result<()> {
        let state = self.inner.state.lock();
        let link = state
            .links
            .get(node)
            .ok_or_else(|| TransportError::not_connected(node))?;
        link.tx
            .send(Frame::Data(payload))
            .map_err(|_| TransportError::not_connected(node))
    }

    /// Queue `payload` for every connected peer, returning how many links took it
    pub fn broadcast(&self, payload: Vec<u8>) -> usize {
        let state = self.inner.state.lock();
        state
            .links
            .values()
            .filter(|link| link.tx.send(Frame::Data(payload.clone())).is_ok())
            .count()
    }

    pub fn connected_nodes(&self) -> Vec<NodeId> {
        let mut nodes: Vec<NodeId> = self.inner.state.lock().links.keys().cloned().collect();
        nodes.sort();
        nodes
    }

    /// Every peer this node has seen, including ones that are down
    pub fn nodes(&self) -> Vec<NodeInfo> {
        let mut nodes: Vec<NodeInfo> = self.inner.state.lock().nodes.values().cloned().collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        nodes
    }

    pub fn node_info(&self, node: &NodeId) -> Option<NodeInfo> {
        self.inner.state.lock().nodes.get(node).cloned()
    }

    pub fn is_connected(&self, node: &NodeId) -> bool {
        self.inner.state.lock().links.contains_key(node)
    }

    /// Leave the cluster: send goodbyes, close links and stop background loops
    pub async fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(node = %self.inner.id, "Stopping cluster membership");
        self.inner.listener.lock().take();

        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }

        let links: Vec<(NodeId, LinkEntry)> = {
            let mut state = self.inner.state.lock();
            state.connecting.clear();
            let links: Vec<_> = state.links.drain().collect();
            for (node, link) in &links {
                let _ = link.tx.send(Frame::Goodbye {
                    reason: "shutdown".to_string(),
                });
                if let Some(info) = state.nodes.get_mut(node) {
                    info.transition(NodeStatus::Stopped);
                }
                self.inner.events.publish(ClusterEvent::NodeDown {
                    node: node.clone(),
                    reason: DownReason::LocalShutdown,
                });
            }
            links
        };

        for (node, mut link) in links {
            if let Some(reader) = link.reader.take() {
                reader.abort();
            }
            let LinkEntry { tx, writer, .. } = link;
            drop(tx);
            if let Some(writer) = writer {
                if tokio::time::timeout(GOODBYE_FLUSH_TIMEOUT, writer).await.is_err() {
                    debug!(node = %node, "Goodbye flush timed out");
                }
            }
        }
    }

    /// Drop every link without goodbyes, as if the process died
    pub fn kill(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
        warn!(node = %self.inner.id, "Killing cluster membership");
        self.inner.listener.lock().take();

        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }
        let mut state = self.inner.state.lock();
        state.connecting.clear();
        for (_, mut link) in state.links.drain() {
            link.abort();
        }
    }
}

/// Removes an address from the in-flight set when the handshake ends
struct ConnectingGuard {
    inner: Arc<ClusterInner>,
    address: String,
}

impl Drop for ConnectingGuard {
    fn drop(&mut self) {
        self.inner.state.lock().connecting.remove(&self.address);
    }
}

/// Strip an optional `name@` prefix from a seed or peer address
fn dial_address(address: &str) -> &str {
    address.split_once('@').map(|(_, addr)| addr).unwrap_or(address)
}

impl ClusterInner {
    fn handshake_failed(&self, address: &str, reason: &str) {
        warn!(node = %self.id, %address, %reason, "Handshake failed");
        self.events.publish(ClusterEvent::HandshakeFailed {
            address: address.to_string(),
            reason: reason.to_string(),
        });
    }

    async fn connect_to(self: &Arc<Self>, address: &str) -> Result<NodeId> {
        let address = dial_address(address).to_string();
        if self.stopped.load(Ordering::SeqCst) {
            return Err(TransportError::system("cluster membership stopped"));
        }
        if address == self.id.address() {
            return Err(TransportError::configuration(
                "refusing to connect to self",
                Some("seeds"),
            ));
        }

        let _guard = {
            let mut state = self.state.lock();
            if let Some(node) = state.links.keys().find(|n| n.address() == address) {
                return Ok(node.clone());
            }
            if !state.connecting.insert(address.clone()) {
                return Err(TransportError::connection(
                    format!("connection to {} already in progress", address),
                    None,
                ));
            }
            ConnectingGuard {
                inner: self.clone(),
                address: address.clone(),
            }
        };

        let stream = tcp::connect(&address, &self.config.tcp).await?;
        let (mut reader, mut writer) = tcp::split(stream, &self.config.tcp)?;

        let hello = Frame::Hello {
            node: self.id.clone(),
            incarnation: self.incarnation,
            protocol_version: WireFormat::VERSION,
            secret_digest: self.secret.digest(),
        };
        writer.send_frame(&hello.to_bytes()?).await?;

        let reply = self.read_handshake_frame(&mut reader).await?;
        let (node, incarnation) = match reply {
            Frame::Welcome {
                node,
                incarnation,
                secret_digest,
            } => {
                if !self.secret.verify(&secret_digest) {
                    self.handshake_failed(&address, "secret mismatch");
                    return Err(TransportError::handshake("secret mismatch", Some(node.as_str())));
                }
                (node, incarnation)
            }
            Frame::Reject { reason } if reason == DUPLICATE_LINK => {
                debug!(node = %self.id, %address, "Peer kept the other link");
                return Err(TransportError::handshake(reason, Some(&address)));
            }
            Frame::Reject { reason } => {
                self.handshake_failed(&address, &reason);
                return Err(TransportError::handshake(reason, Some(&address)));
            }
            other => {
                let reason = format!("unexpected {} frame during handshake", other.kind());
                self.handshake_failed(&address, &reason);
                return Err(TransportError::handshake(reason, Some(&address)));
            }
        };

        if node == self.id {
            return Err(TransportError::handshake("connected to self", Some(&address)));
        }

        match self.admit(&node, incarnation, &self.id, false) {
            Some((link_id, rx)) => {
                self.spawn_link(node.clone(), link_id, reader, writer, rx, None);
                Ok(node)
            }
            None => {
                debug!(node = %self.id, peer = %node, "Dropping outbound duplicate link");
                writer.close().await;
                Ok(node)
            }
        }
    }

    async fn read_handshake_frame(&self, reader: &mut FrameReader) -> Result<Frame> {
        let timeout = self.config.tcp.connect_timeout;
        let bytes = tokio::time::timeout(timeout, reader.read_frame())
            .await
            .map_err(|_| TransportError::timeout("handshake", timeout.as_millis() as u64))??
            .ok_or_else(|| TransportError::connection("closed during handshake", Some(reader.peer_addr())))?;
        Frame::from_bytes(&bytes)
    }

    async fn accept(self: Arc<Self>, stream: TcpStream) {
        let (mut reader, mut writer) = match tcp::split(stream, &self.config.tcp) {
            Ok(halves) => halves,
            Err(e) => {
                debug!(error = %e, "Failed to prepare accepted connection");
                return;
            }
        };
        let peer_addr = reader.peer_addr().to_string();

        let hello = match self.read_handshake_frame(&mut reader).await {
            Ok(frame) => frame,
            Err(e) => {
                self.handshake_failed(&peer_addr, &e.to_string());
                return;
            }
        };

        let kind = hello.kind();
        let Frame::Hello {
            node,
            incarnation,
            protocol_version,
            secret_digest,
        } = hello
        else {
            let reason = format!("expected hello, got {}", kind);
            self.reject(&mut writer, &peer_addr, &reason).await;
            return;
        };

        if protocol_version != WireFormat::VERSION {
            let reason = format!(
                "protocol version mismatch: {} != {}",
                protocol_version,
                WireFormat::VERSION
            );
            self.reject(&mut writer, node.as_str(), &reason).await;
            return;
        }
        if !self.secret.verify(&secret_digest) {
            self.reject(&mut writer, node.as_str(), "secret mismatch").await;
            return;
        }
        if node == self.id {
            self.reject(&mut writer, node.as_str(), "self connection").await;
            return;
        }

        match self.admit(&node, incarnation, &node, true) {
            Some((link_id, rx)) => {
                let welcome = Frame::Welcome {
                    node: self.id.clone(),
                    incarnation: self.incarnation,
                    secret_digest: self.secret.digest(),
                };
                self.spawn_link(node, link_id, reader, writer, rx, Some(welcome));
            }
            None => {
                debug!(node = %self.id, peer = %node, "Rejecting inbound duplicate link");
                if let Ok(bytes) = (Frame::Reject {
                    reason: DUPLICATE_LINK.to_string(),
                })
                .to_bytes()
                {
                    let _ = writer.send_frame(&bytes).await;
                }
                writer.close().await;
            }
        }
    }

    async fn reject(&self, writer: &mut FrameWriter, peer: &str, reason: &str) {
        self.handshake_failed(peer, reason);
        let frame = Frame::Reject {
            reason: reason.to_string(),
        };
        if let Ok(bytes) = frame.to_bytes() {
            let _ = writer.send_frame(&bytes).await;
        }
    }

    /// Decide whether a freshly handshaken link becomes the link to `node`.
    ///
    /// On admission the link entry is installed and `NodeUp` is published
    /// under the state lock, so events are ordered the same way as state.
    fn admit(
        &self,
        node: &NodeId,
        incarnation: u64,
        initiator: &NodeId,
        inbound: bool,
    ) -> Option<(u64, mpsc::UnboundedReceiver<Frame>)> {
        if self.stopped.load(Ordering::SeqCst) {
            return None;
        }

        let mut state = self.state.lock();

        if inbound && state.connecting.contains(node.address()) && self.id < *node {
            // Our own outbound attempt wins
            return None;
        }

        let mut replaced_incarnation = false;
        if let Some(existing) = state.links.get(node) {
            if existing.incarnation == incarnation {
                if existing.initiator <= *initiator {
                    return None;
                }
                debug!(node = %self.id, peer = %node, "Replacing duplicate link");
            } else {
                replaced_incarnation = true;
            }
            if let Some(mut old) = state.links.remove(node) {
                old.abort();
            }
        }

        if replaced_incarnation {
            if let Some(info) = state.nodes.get_mut(node) {
                info.transition(NodeStatus::Crashed);
            }
            info!(node = %self.id, peer = %node, "Peer restarted with a new incarnation");
            self.events.publish(ClusterEvent::NodeDown {
                node: node.clone(),
                reason: DownReason::ConnectionClosed,
            });
        }

        let link_id = self.next_link_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        state.links.insert(
            node.clone(),
            LinkEntry {
                link_id,
                initiator: initiator.clone(),
                incarnation,
                tx,
                reader: None,
                writer: None,
            },
        );

        let is_new = match state.nodes.get(node) {
            Some(info) => info.incarnation != incarnation || info.status.is_terminal(),
            None => true,
        };
        if is_new {
            let mut info = NodeInfo::new(node.clone(), incarnation);
            info.transition(NodeStatus::Running);
            state.nodes.insert(node.clone(), info.clone());
            info!(node = %self.id, peer = %node, "Node up");
            self.events.publish(ClusterEvent::NodeUp(info));
        }

        Some((link_id, rx))
    }

    fn spawn_link(
        self: &Arc<Self>,
        node: NodeId,
        link_id: u64,
        reader: FrameReader,
        writer: FrameWriter,
        rx: mpsc::UnboundedReceiver<Frame>,
        greeting: Option<Frame>,
    ) {
        let ctx = Arc::new(LinkContext {
            inner: Arc::downgrade(self),
            node: node.clone(),
            link_id,
            last_seen: Arc::new(LastSeen::new(self.epoch)),
        });

        let writer_task = tokio::spawn(link::run_writer(
            ctx.clone(),
            writer,
            rx,
            greeting,
            self.config.heartbeat_interval,
        ));
        let reader_task = tokio::spawn(link::run_reader(
            ctx,
            reader,
            self.inbound_tx.clone(),
            self.config.heartbeat_interval,
            self.config.heartbeat_miss_threshold,
        ));

        let mut state = self.state.lock();
        match state.links.get_mut(&node) {
            Some(entry) if entry.link_id == link_id => {
                entry.reader = Some(reader_task.abort_handle());
                entry.writer = Some(writer_task);
            }
            _ => {
                // Lost before we could attach
                reader_task.abort();
                writer_task.abort();
            }
        }
    }

    /// Tear down the link to `node` if `link_id` is still the current one
    pub(crate) fn link_lost(&self, node: &NodeId, link_id: u64, reason: DownReason) {
        let mut state = self.state.lock();
        match state.links.get(node) {
            Some(entry) if entry.link_id == link_id => {}
            _ => return,
        }
        if let Some(mut entry) = state.links.remove(node) {
            if let Some(reader) = entry.reader.take() {
                reader.abort();
            }
            // A writer stuck on a stalled peer never observes the queue closing
            if !matches!(reason, DownReason::Goodbye(_) | DownReason::LocalShutdown) {
                if let Some(writer) = entry.writer.take() {
                    writer.abort();
                }
            }
        }

        let status = match reason {
            DownReason::Goodbye(_) | DownReason::LocalShutdown => NodeStatus::Stopped,
            DownReason::HeartbeatTimeout | DownReason::ConnectionClosed => NodeStatus::Crashed,
        };
        if let Some(info) = state.nodes.get_mut(node) {
            info.transition(status);
        }

        warn!(node = %self.id, peer = %node, %reason, "Node down");
        self.events.publish(ClusterEvent::NodeDown {
            node: node.clone(),
            reason,
        });
    }

    pub(crate) fn on_gossip(self: &Arc<Self>, from: &NodeId, peers: Vec<NodeId>) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        let unknown: Vec<NodeId> = {
            let state = self.state.lock();
            peers
                .into_iter()
                .filter(|peer| {
                    *peer != self.id
                        && !state.links.contains_key(peer)
                        && !state.connecting.contains(peer.address())
                })
                .collect()
        };
        for peer in unknown {
            debug!(node = %self.id, %peer, via = %from, "Learned peer through gossip");
            self.spawn_connect(peer.address().to_string());
        }
    }

    fn dial_seeds(self: &Arc<Self>) {
        let pending: Vec<String> = {
            let state = self.state.lock();
            self.config
                .seeds
                .iter()
                .map(|seed| dial_address(seed).to_string())
                .filter(|address| {
                    address != self.id.address()
                        && !state.linked_to_address(address)
                        && !state.connecting.contains(address)
                })
                .collect()
        };
        for address in pending {
            self.spawn_connect(address);
        }
    }

    fn spawn_connect(self: &Arc<Self>, address: String) {
        let inner = self.clone();
        tokio::spawn(async move {
            if let Err(e) = inner.connect_to(&address).await {
                debug!(node = %inner.id, %address, error = %e, "Connection attempt failed");
            }
        });
    }

    fn gossip(self: &Arc<Self>) {
        let state = self.state.lock();
        let peers: Vec<NodeId> = state.links.keys().cloned().collect();
        for link in state.links.values() {
            let _ = link.tx.send(Frame::Gossip {
                peers: peers.clone(),
            });
        }
    }
}

async fn accept_loop(inner: std::sync::Weak<ClusterInner>, listener: TcpListener) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "Accept failed");
                tokio::time::sleep(Duration::from_millis(50)).await;
                continue;
            }
        };
        let Some(inner) = inner.upgrade() else { return };
        if inner.stopped.load(Ordering::SeqCst) {
            return;
        }
        debug!(node = %inner.id, %peer, "Accepted connection");
        tokio::spawn(inner.accept(stream));
    }
}

async fn gossip_loop(inner: std::sync::Weak<ClusterInner>, interval: Duration) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(inner) = inner.upgrade() else { return };
        if inner.stopped.load(Ordering::SeqCst) {
            return;
        }
        inner.gossip();
        // Unreachable seeds are retried on every tick
        inner.dial_seeds();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dial_address_strips_name() {
        assert_eq!(dial_address("b@127.0.0.1:4000"), "127.0.0.1:4000");
        assert_eq!(dial_address("127.0.0.1:4000"), "127.0.0.1:4000");
    }

    #[test]
    fn test_down_reason_display() {
        assert_eq!(DownReason::HeartbeatTimeout.to_string(), "heartbeat_timeout");
        assert_eq!(DownReason::ConnectionClosed.to_string(), "connection_closed");
        assert_eq!(
            DownReason::Goodbye("shutdown".into()).to_string(),
            "goodbye: shutdown"
        );
    }

    #[test]
    fn test_config_from_node_config() {
        let node = NodeConfig::new("a")
            .with_heartbeat(100, 4)
            .with_seeds(["127.0.0.1:1"]);
        let config = ClusterConfig::from(&node);
        assert_eq!(config.heartbeat_interval, Duration::from_millis(100));
        assert_eq!(config.heartbeat_miss_threshold, 4);
        assert_eq!(config.seeds, vec!["127.0.0.1:1".to_string()]);
        assert_eq!(config.port, 0);
    }
}
