//! Per-peer connection state
//!
//! Each connection owns a reader task (which also runs the dispatcher, so a
//! peer's messages are handled in arrival order) and a writer task draining
//! a bounded outbound queue. The bookkeeping behind the mutex is shared only
//! with the housekeeping task and is never held across an await point.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Mutex, MutexGuard};

use tokio::sync::mpsc;
use tracing::warn;

use crate::consensus::Block;

use super::Message;

/// Outbound queue depth per peer
pub const OUTBOUND_QUEUE: usize = 64;

/// Mutable per-peer bookkeeping
#[derive(Debug)]
pub struct PeerState {
    /// Peer's advertised protocol version; 0 until its Version arrives
    pub version: u32,
    /// True once VersionAck has been exchanged
    pub has_handshake: bool,
    /// Highest height this peer has announced
    pub last_height: u64,
    /// When the last message arrived (ms)
    pub last_message_in: u64,
    /// When we last pinged (ms)
    pub last_ping: u64,
    /// Blocks buffered during a multi-range fetch, keyed by height
    pub stored_blocks: BTreeMap<u64, Block>,
    /// Set when the connection must be torn down
    pub should_disconnect: bool,
}

impl PeerState {
    fn new(now_ms: u64) -> Self {
        PeerState {
            version: 0,
            has_handshake: false,
            last_height: 0,
            last_message_in: now_ms,
            last_ping: now_ms,
            stored_blocks: BTreeMap::new(),
            should_disconnect: false,
        }
    }
}

/// Handle to one connected peer
pub struct Peer {
    pub id: u64,
    pub addr: SocketAddr,
    /// True when the remote end opened the TCP stream (we accepted)
    pub remote_initiated: bool,
    outbound: mpsc::Sender<Message>,
    state: Mutex<PeerState>,
}

impl Peer {
    pub fn new(
        id: u64,
        addr: SocketAddr,
        remote_initiated: bool,
        outbound: mpsc::Sender<Message>,
        now_ms: u64,
    ) -> Self {
        Peer {
            id,
            addr,
            remote_initiated,
            outbound,
            state: Mutex::new(PeerState::new(now_ms)),
        }
    }

    /// Lock the bookkeeping; scopes must stay synchronous
    pub fn state(&self) -> MutexGuard<'_, PeerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Enqueue a message; safe from any task
    pub fn send(&self, message: Message) {
        if let Err(err) = self.outbound.try_send(message) {
            warn!(peer = self.id, %err, "outbound queue rejected message; disconnecting");
            self.state().should_disconnect = true;
        }
    }

    /// Flag the connection for teardown
    pub fn mark_disconnect(&self) {
        self.state().should_disconnect = true;
    }

    pub fn should_disconnect(&self) -> bool {
        self.state().should_disconnect
    }

    /// Buffer blocks delivered ahead of a fork walk-back, keyed by height
    pub fn store_blocks(&self, blocks: &[Block]) {
        let mut state = self.state();
        for block in blocks {
            state.stored_blocks.insert(block.height, block.clone());
        }
    }

    /// Drop all buffered blocks
    pub fn clear_stored(&self) {
        self.state().stored_blocks.clear();
    }

    /// Union of buffered and newly delivered blocks, de-duplicated by height
    /// (newest delivery wins) and sorted ascending
    pub fn stored_and_new(&self, new: Vec<Block>) -> Vec<Block> {
        let mut merged = self.state().stored_blocks.clone();
        for block in new {
            merged.insert(block.height, block);
        }
        merged.into_values().collect()
    }
}
