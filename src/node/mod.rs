//! Node assembly
//!
//! Wires the chain engine, peer connections, IBD controller, miner, and
//! housekeeping into one tokio task set. Per-peer I/O runs on a reader and a
//! writer task; the reader also dispatches, so one peer's messages are
//! handled in arrival order. A single watch channel cancels every loop.

mod handler;

pub use handler::handle_message;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::RngCore;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Mutex, MutexGuard};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::chain::{Chain, SendOutcome};
use crate::consensus::Network;
use crate::constants::PROTOCOL_VERSION;
use crate::crypto::KeyPair;
use crate::mining::{Miner, MiningOutcome};
use crate::p2p::{
    encode_frame, FrameReader, IbdController, IbdPhase, MempoolPayload, Message, Peer,
    VersionPayload, OUTBOUND_QUEUE,
};
use crate::storage::StoreError;
use crate::validation::PendingTransaction;

/// Milliseconds since the Unix epoch
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// How long dispatch waits for the chain lock before dropping a request
const CHAIN_LOCK_TIMEOUT: Duration = Duration::from_secs(3);

/// Reader poll interval while the socket is idle
const READ_POLL: Duration = Duration::from_millis(100);

/// Housekeeping warm-up and cadence
const HOUSEKEEPING_WARMUP: Duration = Duration::from_secs(10);
const HOUSEKEEPING_PERIOD: Duration = Duration::from_secs(30);

/// Disconnect peers silent for longer than this
const PEER_TIMEOUT_MS: u64 = 600_000;

/// Ping peers this often
const PING_PERIOD_MS: u64 = 120_000;

/// Node configuration
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub data_dir: PathBuf,
    pub listen: Option<SocketAddr>,
    pub seeds: Vec<SocketAddr>,
    pub network: Network,
}

/// A running node
pub struct Node {
    config: NodeConfig,
    /// Random instance id advertised in Version; detects self-loops
    pub nonce: String,
    chain: Arc<Mutex<Chain>>,
    peers: StdMutex<HashMap<u64, Arc<Peer>>>,
    ibd: StdMutex<IbdController>,
    next_peer_id: AtomicU64,
    shutdown: watch::Sender<bool>,
}

impl Node {
    /// Open the chain stores and prepare a node
    pub fn new(config: NodeConfig) -> Result<Arc<Self>, StoreError> {
        let chain = Chain::open(&config.data_dir, config.network)?;
        let mut nonce_bytes = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
        let (shutdown, _) = watch::channel(false);
        Ok(Arc::new(Node {
            config,
            nonce: hex::encode(nonce_bytes),
            chain: Arc::new(Mutex::new(chain)),
            peers: StdMutex::new(HashMap::new()),
            ibd: StdMutex::new(IbdController::new()),
            next_peer_id: AtomicU64::new(1),
            shutdown,
        }))
    }

    /// The shared chain handle
    pub fn chain(&self) -> &Arc<Mutex<Chain>> {
        &self.chain
    }

    /// The parameter set this node runs on
    pub fn network(&self) -> Network {
        self.config.network
    }

    /// Acquire the chain lock within the dispatch timeout, or drop the work
    pub async fn lock_chain(&self) -> Option<MutexGuard<'_, Chain>> {
        match timeout(CHAIN_LOCK_TIMEOUT, self.chain.lock()).await {
            Ok(guard) => Some(guard),
            Err(_) => {
                warn!("chain lock busy for {CHAIN_LOCK_TIMEOUT:?}; dropping request");
                None
            }
        }
    }

    /// Run a closure against the IBD controller
    pub fn with_ibd<R>(&self, f: impl FnOnce(&mut IbdController) -> R) -> R {
        let mut ibd = self
            .ibd
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut ibd)
    }

    /// Look up a connected peer
    pub fn peer(&self, id: u64) -> Option<Arc<Peer>> {
        self.peers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&id)
            .cloned()
    }

    fn peers_snapshot(&self) -> Vec<Arc<Peer>> {
        self.peers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .values()
            .cloned()
            .collect()
    }

    /// Send to every handshaken peer except `except`
    pub fn broadcast(&self, message: Message, except: Option<u64>) {
        for peer in self.peers_snapshot() {
            if Some(peer.id) == except {
                continue;
            }
            let ready = {
                let state = peer.state();
                state.has_handshake && !state.should_disconnect
            };
            if ready {
                peer.send(message.clone());
            }
        }
    }

    /// Our Version payload at the current tip
    pub async fn version_payload(&self) -> VersionPayload {
        let height = self.chain.lock().await.height();
        VersionPayload {
            ver: PROTOCOL_VERSION,
            height,
            nonce: self.nonce.clone(),
        }
    }

    /// Start the listener, seed connections, and housekeeping
    pub async fn start(self: Arc<Self>) -> std::io::Result<()> {
        if let Some(listen) = self.config.listen {
            let listener = TcpListener::bind(listen).await?;
            info!(%listen, "listening for peers");
            tokio::spawn(Arc::clone(&self).accept_loop(listener));
        }

        if !self.config.seeds.is_empty() {
            self.with_ibd(|ibd| ibd.begin_preparing());
            for seed in self.config.seeds.clone() {
                match TcpStream::connect(seed).await {
                    Ok(stream) => {
                        let peer = Node::spawn_peer(&self, stream, seed, false);
                        self.with_ibd(|ibd| ibd.register_peer(peer.id));
                        peer.send(Message::Version(self.version_payload().await));
                    }
                    Err(err) => warn!(%seed, %err, "seed connection failed"),
                }
            }
            if self.peers_snapshot().is_empty() {
                warn!("no seed peers reachable; IBD failed");
                self.with_ibd(|ibd| ibd.fail());
            }
        }

        tokio::spawn(Arc::clone(&self).housekeeping_loop());
        Ok(())
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        debug!(%addr, "peer connected");
                        Node::spawn_peer(&self, stream, addr, true);
                    }
                    Err(err) => {
                        warn!(%err, "accept failed");
                        tokio::time::sleep(READ_POLL).await;
                    }
                },
            }
        }
    }

    /// Register a connection and start its reader and writer tasks
    fn spawn_peer(
        node: &Arc<Node>,
        stream: TcpStream,
        addr: SocketAddr,
        remote_initiated: bool,
    ) -> Arc<Peer> {
        let id = node.next_peer_id.fetch_add(1, Ordering::Relaxed);
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);
        let peer = Arc::new(Peer::new(id, addr, remote_initiated, outbound_tx, now_ms()));

        node.peers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(id, Arc::clone(&peer));

        let (read_half, write_half) = stream.into_split();

        let writer_peer = Arc::clone(&peer);
        let writer_shutdown = node.shutdown.subscribe();
        tokio::spawn(async move {
            writer_loop(writer_peer, write_half, outbound_rx, writer_shutdown).await;
        });

        tokio::spawn(Arc::clone(node).reader_task(Arc::clone(&peer), read_half));
        peer
    }

    async fn reader_task(
        self: Arc<Self>,
        peer: Arc<Peer>,
        mut read_half: tokio::net::tcp::OwnedReadHalf,
    ) {
        let mut shutdown = self.shutdown.subscribe();
        let mut reader = FrameReader::new();
        let mut buf = [0u8; 4096];

        'outer: loop {
            if *shutdown.borrow() || peer.should_disconnect() {
                break;
            }
            let read = tokio::select! {
                _ = shutdown.changed() => break,
                read = timeout(READ_POLL, read_half.read(&mut buf)) => read,
            };
            let n = match read {
                Err(_) => continue, // idle poll
                Ok(Ok(0)) => break, // closed
                Ok(Ok(n)) => n,
                Ok(Err(err)) => {
                    debug!(peer = peer.id, %err, "read failed");
                    break;
                }
            };
            let frames = match reader.push(&buf[..n]) {
                Ok(frames) => frames,
                Err(err) => {
                    warn!(peer = peer.id, %err, "oversize frame");
                    peer.mark_disconnect();
                    break;
                }
            };
            for frame in frames {
                handle_message(&self, &peer, &frame).await;
                if peer.should_disconnect() {
                    break 'outer;
                }
            }
        }

        Node::remove_peer(&self, &peer);
    }

    /// Drop a peer from the registry and the IBD round
    fn remove_peer(node: &Arc<Node>, peer: &Arc<Peer>) {
        debug!(peer = peer.id, addr = %peer.addr, "peer removed");
        peer.mark_disconnect();
        node.peers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&peer.id);

        let resume = node.with_ibd(|ibd| {
            ibd.drop_peer(peer.id);
            match ibd.phase() {
                // losing the selected peer moves IBD to the next candidate
                IbdPhase::Running if ibd.current_peer() == Some(peer.id) => {
                    ibd.advance_peer();
                    true
                }
                // losing a slow seed can complete the Preparing round
                IbdPhase::Preparing if ibd.all_responded() => {
                    ibd.start_running();
                    true
                }
                // losing every seed ends the bootstrap
                IbdPhase::Preparing if ibd.peer_count() == 0 => {
                    ibd.fail();
                    false
                }
                _ => false,
            }
        });
        if resume {
            let node = Arc::clone(node);
            tokio::spawn(async move { handler::ibd_progress(&node).await });
        }
    }

    async fn housekeeping_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        tokio::select! {
            _ = shutdown.changed() => return,
            _ = tokio::time::sleep(HOUSEKEEPING_WARMUP) => {}
        }
        loop {
            let now = now_ms();
            for peer in self.peers_snapshot() {
                let (silent_for, needs_ping) = {
                    let mut state = peer.state();
                    let silent = now.saturating_sub(state.last_message_in);
                    let needs_ping = state.has_handshake
                        && now.saturating_sub(state.last_ping) > PING_PERIOD_MS;
                    if needs_ping {
                        state.last_ping = now;
                    }
                    (silent, needs_ping)
                };
                if silent_for > PEER_TIMEOUT_MS {
                    info!(peer = peer.id, silent_for, "closing silent peer");
                    peer.mark_disconnect();
                } else if needs_ping {
                    peer.send(Message::Ping);
                }
            }
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(HOUSEKEEPING_PERIOD) => {}
            }
        }
    }

    /// Background mining loop; broadcasts every block it lands
    pub async fn run_miner(self: Arc<Self>, miner_address: String) {
        let mut shutdown = self.shutdown.subscribe();
        let mut miner = Miner::new(miner_address);
        info!("miner started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            match miner.attempt(&self.chain, now_ms()).await {
                MiningOutcome::Mined(block) => {
                    info!(height = block.height, hash = %block.hash, "mined block");
                    self.broadcast(
                        Message::LatestBlock(crate::p2p::LatestBlockPayload { block }),
                        None,
                    );
                }
                MiningOutcome::NotTimeYet { remaining_ms } => {
                    let wait = Duration::from_millis(remaining_ms.min(5_000));
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
                MiningOutcome::Busy => tokio::time::sleep(Duration::from_millis(200)).await,
                MiningOutcome::Continue => tokio::task::yield_now().await,
                MiningOutcome::Exhausted => {
                    warn!("nonce space exhausted; waiting for chain movement");
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                    }
                }
            }
        }
    }

    /// Build and queue a local spend, then announce it to every peer
    ///
    /// The announcement carries `rel = true` even though nothing relayed it;
    /// existing networks expect authored and relayed transactions to be
    /// indistinguishable on the wire.
    pub async fn send_transaction(
        &self,
        from: &str,
        to: &str,
        amount: i64,
        key: &KeyPair,
    ) -> Result<SendOutcome, StoreError> {
        let now = now_ms();
        let outcome = {
            let mut chain = self.chain.lock().await;
            chain.send(from, to, amount, key, now)?
        };
        if let SendOutcome::Sent(tx) = &outcome {
            info!(id = %tx.id, "queued local transaction");
            self.broadcast(
                Message::Mempool(MempoolPayload {
                    rel: true,
                    txs: vec![PendingTransaction::new(tx.clone(), now)],
                }),
                None,
            );
        }
        Ok(outcome)
    }

    /// Cancel every loop and flush both stores
    pub async fn shutdown(&self) {
        info!("shutting down");
        let _ = self.shutdown.send(true);
        let mut chain = self.chain.lock().await;
        if let Err(err) = chain.flush() {
            warn!(%err, "final flush failed");
        }
    }
}

async fn writer_loop(
    peer: Arc<Peer>,
    mut write_half: tokio::net::tcp::OwnedWriteHalf,
    mut outbound: mpsc::Receiver<Message>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let message = tokio::select! {
            _ = shutdown.changed() => break,
            message = outbound.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };
        let line = match message.encode() {
            Ok(line) => line,
            Err(err) => {
                warn!(peer = peer.id, %err, "message encoding failed");
                continue;
            }
        };
        if let Err(err) = write_half.write_all(&encode_frame(&line)).await {
            debug!(peer = peer.id, %err, "write failed");
            peer.mark_disconnect();
            break;
        }
    }
}
