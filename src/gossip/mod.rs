//! Gossip synchronization layer
//!
//! Wraps a [`Runtime`] with peer-to-peer anti-entropy. Each node owns
//! its own connection table and timer tasks; there is no process-wide
//! state. Two independent loops run while the node is up: the sync
//! loop exchanges content-hash summaries and pushes divergent contact
//! content, and the peer-exchange loop advertises known peer addresses
//! so a rejoining node re-discovers the mesh transitively.
//!
//! A peer failure is never fatal: the connection is dropped, logged,
//! and redialed on the next sync tick. Nodes cut off from every peer
//! keep serving local writes indefinitely.

pub mod protocol;

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::MutexGuard;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{timeout, MissedTickBehavior};
use uuid::Uuid;

use crate::runtime::{Runtime, RuntimeError};
use protocol::{GossipMessage, HashEntry};

/// Cap on a single network operation (connect, send). A peer that
/// cannot answer inside this window fails retryable instead of
/// wedging a loop.
pub const RPC_TIMEOUT: Duration = Duration::from_secs(30);

/// Error types for gossip operations
#[derive(Error, Debug)]
pub enum GossipError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Timed out talking to {0}")]
    Timeout(String),

    #[error("Node is not running")]
    NotRunning,

    #[error("Runtime error: {0}")]
    Runtime(#[from] RuntimeError),
}

/// Node lifecycle. `start` and `stop` are both idempotent.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Lifecycle {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// Configuration for a gossip node
#[derive(Clone, Debug)]
pub struct GossipConfig {
    /// Node identity announced in the handshake
    pub id: String,
    /// Interface to bind the listener on
    pub bind_addr: String,
    /// Listening port; 0 picks an ephemeral port
    pub port: u16,
    /// Seed peer addresses; the live set grows via peer exchange
    pub peers: Vec<String>,
    /// Anti-entropy period
    pub sync_interval: Duration,
    /// Peer-list advertisement period
    pub peer_exchange_interval: Duration,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            bind_addr: "127.0.0.1".to_string(),
            port: 0,
            peers: Vec::new(),
            sync_interval: Duration::from_millis(1000),
            peer_exchange_interval: Duration::from_millis(2000),
        }
    }
}

#[derive(Clone)]
struct PeerConnection {
    writer: Arc<Mutex<OwnedWriteHalf>>,
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A gossip node: one runtime plus its anti-entropy machinery.
pub struct GossipNode {
    config: GossipConfig,
    runtime: Arc<Runtime>,
    lifecycle: StdMutex<Lifecycle>,
    listen_addr: StdMutex<Option<String>>,
    /// Live connections keyed by the peer's advertised listen address.
    connections: RwLock<HashMap<String, PeerConnection>>,
    /// Every peer address ever seen; redial targets for the sync loop.
    known_peers: RwLock<HashSet<String>>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl GossipNode {
    /// Create a node around a runtime.
    ///
    /// Returns `Arc<Self>` because the listener and loop tasks spawned
    /// by `start` hold references.
    pub fn new(config: GossipConfig, runtime: Arc<Runtime>) -> Arc<Self> {
        let known_peers = config.peers.iter().cloned().collect();
        Arc::new(Self {
            config,
            runtime,
            lifecycle: StdMutex::new(Lifecycle::Stopped),
            listen_addr: StdMutex::new(None),
            connections: RwLock::new(HashMap::new()),
            known_peers: RwLock::new(known_peers),
            tasks: StdMutex::new(Vec::new()),
        })
    }

    pub fn node_id(&self) -> &str {
        &self.config.id
    }

    pub fn lifecycle(&self) -> Lifecycle {
        *lock(&self.lifecycle)
    }

    /// The address peers can dial, once the node is running.
    pub fn listen_addr(&self) -> Option<String> {
        lock(&self.listen_addr).clone()
    }

    /// Open the listening endpoint, dial seed peers, and begin the two
    /// periodic loops. Calling `start` on a node that is not stopped is
    /// a no-op.
    pub async fn start(self: &Arc<Self>) -> Result<(), GossipError> {
        {
            let mut lifecycle = lock(&self.lifecycle);
            if *lifecycle != Lifecycle::Stopped {
                return Ok(());
            }
            *lifecycle = Lifecycle::Starting;
        }

        let listener =
            TcpListener::bind((self.config.bind_addr.as_str(), self.config.port)).await?;
        let advertised = format!("{}:{}", self.config.bind_addr, listener.local_addr()?.port());
        *lock(&self.listen_addr) = Some(advertised.clone());
        log::info!("[{}] listening on {}", self.config.id, advertised);

        let node = Arc::clone(self);
        let accept_task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((socket, peer_addr)) => {
                        log::debug!("[{}] inbound connection from {}", node.config.id, peer_addr);
                        node.spawn_socket(socket, None).await;
                    }
                    Err(e) => {
                        log::warn!("[{}] accept failed: {}", node.config.id, e);
                        break;
                    }
                }
            }
        });

        let node = Arc::clone(self);
        let sync_task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(node.config.sync_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                node.sync_round().await;
            }
        });

        let node = Arc::clone(self);
        let exchange_task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(node.config.peer_exchange_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                node.peer_exchange_round().await;
            }
        });

        // Dial seeds in the background; unreachable seeds are retried
        // by the sync loop.
        let node = Arc::clone(self);
        let seed_task = tokio::spawn(async move {
            for peer in node.config.peers.clone() {
                node.connect_to_peer(peer).await;
            }
        });

        lock(&self.tasks).extend([accept_task, sync_task, exchange_task, seed_task]);
        *lock(&self.lifecycle) = Lifecycle::Running;
        Ok(())
    }

    /// Cancel the loops and close every peer connection. Merges already
    /// committed to storage are not rolled back. Calling `stop` on a
    /// stopped node is a no-op.
    pub async fn stop(&self) {
        {
            let mut lifecycle = lock(&self.lifecycle);
            match *lifecycle {
                Lifecycle::Running | Lifecycle::Starting => *lifecycle = Lifecycle::Stopping,
                Lifecycle::Stopped | Lifecycle::Stopping => return,
            }
        }

        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
        self.connections.write().await.clear();
        *lock(&self.listen_addr) = None;
        *lock(&self.lifecycle) = Lifecycle::Stopped;
        log::info!("[{}] stopped", self.config.id);
    }

    /// Run one sync-loop body immediately, for callers that need
    /// deterministic timing instead of waiting on the interval.
    pub async fn trigger_sync(self: &Arc<Self>) -> Result<(), GossipError> {
        if self.lifecycle() != Lifecycle::Running {
            return Err(GossipError::NotRunning);
        }
        self.sync_round().await;
        Ok(())
    }

    /// Run one peer-exchange body immediately, for callers that need
    /// deterministic timing instead of waiting on the interval.
    pub async fn trigger_peer_exchange(self: &Arc<Self>) -> Result<(), GossipError> {
        if self.lifecycle() != Lifecycle::Running {
            return Err(GossipError::NotRunning);
        }
        self.peer_exchange_round().await;
        Ok(())
    }

    /// Local content hash for a contact; `None` when unknown here.
    pub async fn get_content_hash(&self, contact_id: &str) -> Option<String> {
        self.runtime.content_hash_of(contact_id).await
    }

    /// One anti-entropy step: redial missing peers, then send the local
    /// hash summary to every live connection.
    async fn sync_round(self: &Arc<Self>) {
        let own_addr = self.listen_addr();
        let redial: Vec<String> = {
            let known = self.known_peers.read().await;
            let connected = self.connections.read().await;
            known
                .iter()
                .filter(|addr| Some(*addr) != own_addr.as_ref() && !connected.contains_key(*addr))
                .cloned()
                .collect()
        };
        for addr in redial {
            self.connect_to_peer(addr).await;
        }

        let entries: Vec<HashEntry> = self
            .runtime
            .sync_records()
            .await
            .into_iter()
            .map(|record| HashEntry {
                contact_id: record.contact_id,
                hash: record.hash,
            })
            .collect();
        self.broadcast(&GossipMessage::HashSummary { entries }).await;
    }

    /// Advertise every known peer address (plus our own) so the mesh
    /// heals transitively after partitions.
    async fn peer_exchange_round(&self) {
        let mut peers: Vec<String> = self.known_peers.read().await.iter().cloned().collect();
        if let Some(own) = self.listen_addr() {
            if !peers.contains(&own) {
                peers.push(own);
            }
        }
        peers.sort();
        self.broadcast(&GossipMessage::PeerList { peers }).await;
    }

    /// Dial a peer and register the connection. Failures are logged and
    /// left for the next sync tick.
    async fn connect_to_peer(self: &Arc<Self>, addr: String) {
        if Some(&addr) == self.listen_addr().as_ref() {
            return;
        }
        if self.connections.read().await.contains_key(&addr) {
            return;
        }
        self.known_peers.write().await.insert(addr.clone());

        match timeout(RPC_TIMEOUT, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => {
                log::debug!("[{}] connected to peer {}", self.config.id, addr);
                self.spawn_socket(stream, Some(addr)).await;
            }
            Ok(Err(e)) => {
                log::warn!("[{}] failed to connect to {}: {}", self.config.id, addr, e);
            }
            Err(_) => {
                log::warn!("[{}] connect to {} timed out", self.config.id, addr);
            }
        }
    }

    /// Register a socket and start its read loop. `peer_addr` is the
    /// peer's listen address when we dialed it, `None` for inbound
    /// sockets until their `hello` arrives.
    async fn spawn_socket(self: &Arc<Self>, socket: TcpStream, peer_addr: Option<String>) {
        let (read_half, write_half) = socket.into_split();
        let writer = Arc::new(Mutex::new(write_half));

        if let Some(addr) = &peer_addr {
            self.register_connection(addr.clone(), writer.clone()).await;
            self.send_hello(&writer).await;
        }

        let reader_task = tokio::spawn(self.read_loop_task(read_half, writer, peer_addr));
        let mut tasks = lock(&self.tasks);
        tasks.retain(|task| !task.is_finished());
        tasks.push(reader_task);
    }

    /// Boxed entry point for the reader task. The call chain
    /// `read_loop` -> `handle_message` -> `connect_to_peer` ->
    /// `spawn_socket` recurses back into `read_loop`, so the future has
    /// to be type-erased here for its `Send` bound to be checkable.
    fn read_loop_task(
        self: &Arc<Self>,
        read_half: OwnedReadHalf,
        writer: Arc<Mutex<OwnedWriteHalf>>,
        peer_addr: Option<String>,
    ) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        let node = Arc::clone(self);
        Box::pin(async move {
            node.read_loop(read_half, writer, peer_addr).await;
        })
    }

    async fn read_loop(
        self: &Arc<Self>,
        read_half: OwnedReadHalf,
        writer: Arc<Mutex<OwnedWriteHalf>>,
        mut peer_addr: Option<String>,
    ) {
        let mut lines = BufReader::new(read_half).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<GossipMessage>(&line) {
                Ok(message) => {
                    self.handle_message(message, &writer, &mut peer_addr).await;
                }
                Err(e) => {
                    log::warn!("[{}] unparseable gossip message: {}", self.config.id, e);
                }
            }
        }

        if let Some(addr) = peer_addr {
            log::debug!("[{}] peer {} disconnected", self.config.id, addr);
            self.drop_connection(&addr).await;
        }
    }

    async fn handle_message(
        self: &Arc<Self>,
        message: GossipMessage,
        writer: &Arc<Mutex<OwnedWriteHalf>>,
        peer_addr: &mut Option<String>,
    ) {
        match message {
            GossipMessage::Hello {
                node_id,
                listen_addr,
            } => {
                if Some(&listen_addr) == self.listen_addr().as_ref() {
                    return;
                }
                log::debug!(
                    "[{}] hello from {} at {}",
                    self.config.id,
                    node_id,
                    listen_addr
                );
                let inbound = peer_addr.is_none();
                self.register_connection(listen_addr.clone(), writer.clone())
                    .await;
                if inbound {
                    *peer_addr = Some(listen_addr);
                    self.send_hello(writer).await;
                }
            }
            GossipMessage::HashSummary { entries } => {
                self.handle_summary(entries, writer).await;
            }
            GossipMessage::Content {
                contact_id,
                group_id,
                blend_mode,
                content,
            } => {
                if let Err(e) = self
                    .runtime
                    .apply_remote_content(&contact_id, &group_id, blend_mode, content)
                    .await
                {
                    log::warn!(
                        "[{}] failed to apply remote content for {}: {}",
                        self.config.id,
                        contact_id,
                        e
                    );
                }
            }
            GossipMessage::PeerList { peers } => {
                let own_addr = self.listen_addr();
                for peer in peers {
                    if Some(&peer) == own_addr.as_ref() {
                        continue;
                    }
                    let newly_known = self.known_peers.write().await.insert(peer.clone());
                    if newly_known {
                        log::debug!("[{}] learned peer {}", self.config.id, peer);
                        // Dial off the read loop; a slow connect must
                        // not block this peer's inbound messages.
                        let node = Arc::clone(self);
                        tokio::spawn(async move {
                            node.connect_to_peer(peer).await;
                        });
                    }
                }
            }
        }
    }

    /// Answer a peer's hash summary: push content for every local
    /// contact the summary lacks or disagrees with. The peer merges
    /// what we send; the reverse direction happens when our own summary
    /// reaches them.
    async fn handle_summary(&self, entries: Vec<HashEntry>, writer: &Arc<Mutex<OwnedWriteHalf>>) {
        let remote: HashMap<String, String> = entries
            .into_iter()
            .map(|entry| (entry.contact_id, entry.hash))
            .collect();

        for record in self.runtime.sync_records().await {
            let in_agreement = remote
                .get(&record.contact_id)
                .is_some_and(|hash| *hash == record.hash);
            if in_agreement {
                continue;
            }
            let push = GossipMessage::Content {
                contact_id: record.contact_id.clone(),
                group_id: record.group_id,
                blend_mode: record.blend_mode,
                content: record.content,
            };
            if let Err(e) = send_message(writer, &push).await {
                log::warn!(
                    "[{}] failed to push {}: {}",
                    self.config.id,
                    record.contact_id,
                    e
                );
                return;
            }
        }
    }

    /// Send a message to every live connection, dropping the ones that
    /// fail; they get redialed on the next sync tick.
    async fn broadcast(&self, message: &GossipMessage) {
        let targets: Vec<(String, PeerConnection)> = {
            let connections = self.connections.read().await;
            connections
                .iter()
                .map(|(addr, conn)| (addr.clone(), conn.clone()))
                .collect()
        };

        for (addr, conn) in targets {
            if let Err(e) = send_message(&conn.writer, message).await {
                log::warn!("[{}] send to {} failed: {}", self.config.id, addr, e);
                self.drop_connection(&addr).await;
            }
        }
    }

    async fn register_connection(&self, addr: String, writer: Arc<Mutex<OwnedWriteHalf>>) {
        self.known_peers.write().await.insert(addr.clone());
        self.connections
            .write()
            .await
            .insert(addr, PeerConnection { writer });
    }

    async fn drop_connection(&self, addr: &str) {
        self.connections.write().await.remove(addr);
    }

    async fn send_hello(&self, writer: &Arc<Mutex<OwnedWriteHalf>>) {
        let Some(listen_addr) = self.listen_addr() else {
            return;
        };
        let hello = GossipMessage::Hello {
            node_id: self.config.id.clone(),
            listen_addr,
        };
        if let Err(e) = send_message(writer, &hello).await {
            log::warn!("[{}] handshake send failed: {}", self.config.id, e);
        }
    }
}

async fn send_message(
    writer: &Arc<Mutex<OwnedWriteHalf>>,
    message: &GossipMessage,
) -> Result<(), GossipError> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    let mut guard = writer.lock().await;
    timeout(RPC_TIMEOUT, guard.write_all(line.as_bytes()))
        .await
        .map_err(|_| GossipError::Timeout("peer write".to_string()))??;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::RuntimeConfig;
    use crate::storage::MemoryStorage;

    async fn make_node(config: GossipConfig) -> Arc<GossipNode> {
        let runtime = Runtime::new(RuntimeConfig::default(), Arc::new(MemoryStorage::new()))
            .await
            .unwrap();
        GossipNode::new(config, Arc::new(runtime))
    }

    #[tokio::test]
    async fn test_start_and_stop_are_idempotent() {
        let node = make_node(GossipConfig::default()).await;
        assert_eq!(node.lifecycle(), Lifecycle::Stopped);

        node.start().await.unwrap();
        assert_eq!(node.lifecycle(), Lifecycle::Running);
        let addr = node.listen_addr().unwrap();

        // Second start is a no-op and keeps the same endpoint.
        node.start().await.unwrap();
        assert_eq!(node.listen_addr(), Some(addr));

        node.stop().await;
        assert_eq!(node.lifecycle(), Lifecycle::Stopped);
        node.stop().await;
        assert_eq!(node.lifecycle(), Lifecycle::Stopped);
    }

    #[tokio::test]
    async fn test_trigger_sync_requires_running_node() {
        let node = make_node(GossipConfig::default()).await;
        assert!(matches!(
            node.trigger_sync().await,
            Err(GossipError::NotRunning)
        ));
    }

    #[tokio::test]
    async fn test_content_hash_unknown_contact_is_none() {
        let node = make_node(GossipConfig::default()).await;
        assert_eq!(node.get_content_hash("nowhere").await, None);
    }

    #[tokio::test]
    async fn test_peer_learned_over_wire_is_dialed() {
        let hub = make_node(GossipConfig::default()).await;
        hub.start().await.unwrap();
        let seed = vec![hub.listen_addr().unwrap()];
        let left = make_node(GossipConfig {
            peers: seed.clone(),
            ..GossipConfig::default()
        })
        .await;
        left.start().await.unwrap();
        let right = make_node(GossipConfig {
            peers: seed,
            ..GossipConfig::default()
        })
        .await;
        right.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        // The hub advertises each spoke to the other; both ends dial
        // the address they learned from inside their read loops.
        hub.trigger_peer_exchange().await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let right_addr = right.listen_addr().unwrap();
        let left_addr = left.listen_addr().unwrap();
        assert!(left.connections.read().await.contains_key(&right_addr));
        assert!(right.connections.read().await.contains_key(&left_addr));

        for node in [&hub, &left, &right] {
            node.stop().await;
        }
    }

    #[tokio::test]
    async fn test_finished_reader_tasks_are_reaped() {
        let node = make_node(GossipConfig::default()).await;
        node.start().await.unwrap();
        let addr = node.listen_addr().unwrap();

        // Churn: each connection's reader task ends when the socket
        // drops, and the next accept prunes the finished handles.
        for _ in 0..10 {
            let stream = TcpStream::connect(&addr).await.unwrap();
            drop(stream);
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        assert!(lock(&node.tasks).len() < 10);
        node.stop().await;
    }

    #[tokio::test]
    async fn test_unreachable_seed_does_not_fail_start() {
        let config = GossipConfig {
            peers: vec!["127.0.0.1:1".to_string()],
            ..GossipConfig::default()
        };
        let node = make_node(config).await;
        node.start().await.unwrap();
        node.trigger_sync().await.unwrap();
        assert_eq!(node.lifecycle(), Lifecycle::Running);
        node.stop().await;
    }
}
