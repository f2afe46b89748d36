//! Initial block download controller
//!
//! Tracks the IBD phase machine: None → Preparing → Running → {Succeeded,
//! Failed}. In Preparing every registered peer is asked for its latest
//! block; once all still-connected peers answered, they are ranked by
//! (announced height descending, round-trip ascending) and drained one at a
//! time through planned GetBlocks ranges.

use std::collections::{HashMap, VecDeque};

use crate::consensus::Block;
use crate::constants::MAX_GET_BLOCKS;

/// IBD phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IbdPhase {
    /// Not bootstrapping (no seed peers were given)
    None,
    /// Waiting for every seed peer's latest block
    Preparing,
    /// Pulling ranges from the selected peer
    Running,
    Succeeded,
    Failed,
}

/// A seed peer's announced tip
#[derive(Debug, Clone)]
pub struct IbdResponse {
    pub block: Block,
    pub round_trip_ms: u64,
}

#[derive(Debug, Default)]
struct IbdPeerStatus {
    requested_at: u64,
    response: Option<IbdResponse>,
}

/// Multi-peer IBD coordination
pub struct IbdController {
    phase: IbdPhase,
    statuses: HashMap<u64, IbdPeerStatus>,
    order: Vec<u64>,
    cursor: usize,
    ranges: VecDeque<(u64, u64)>,
}

impl IbdController {
    pub fn new() -> Self {
        IbdController {
            phase: IbdPhase::None,
            statuses: HashMap::new(),
            order: Vec::new(),
            cursor: 0,
            ranges: VecDeque::new(),
        }
    }

    pub fn phase(&self) -> IbdPhase {
        self.phase
    }

    /// True while the download is still in progress
    pub fn is_active(&self) -> bool {
        matches!(self.phase, IbdPhase::Preparing | IbdPhase::Running)
    }

    /// Enter Preparing; seed peers are registered as they connect
    pub fn begin_preparing(&mut self) {
        self.phase = IbdPhase::Preparing;
        self.statuses.clear();
        self.order.clear();
        self.cursor = 0;
        self.ranges.clear();
    }

    /// Track a seed peer that will be asked for its latest block
    pub fn register_peer(&mut self, peer_id: u64) {
        self.statuses.insert(peer_id, IbdPeerStatus::default());
    }

    /// Record when the GetLatestBlock request left for this peer
    pub fn mark_requested(&mut self, peer_id: u64, now_ms: u64) {
        if let Some(status) = self.statuses.get_mut(&peer_id) {
            status.requested_at = now_ms;
        }
    }

    /// Forget a disconnected peer
    pub fn drop_peer(&mut self, peer_id: u64) {
        self.statuses.remove(&peer_id);
    }

    /// True when this peer is registered for the Preparing round
    pub fn is_registered(&self, peer_id: u64) -> bool {
        self.statuses.contains_key(&peer_id)
    }

    /// How many peers are still tracked
    pub fn peer_count(&self) -> usize {
        self.statuses.len()
    }

    /// Record a peer's announced tip; true when every registered peer has
    /// now responded
    pub fn record_response(&mut self, peer_id: u64, block: Block, now_ms: u64) -> bool {
        if let Some(status) = self.statuses.get_mut(&peer_id) {
            let round_trip_ms = now_ms.saturating_sub(status.requested_at);
            status.response = Some(IbdResponse {
                block,
                round_trip_ms,
            });
        }
        self.all_responded()
    }

    /// True when every registered, still-tracked peer has responded
    pub fn all_responded(&self) -> bool {
        !self.statuses.is_empty() && self.statuses.values().all(|s| s.response.is_some())
    }

    /// Rank peers and enter Running; returns the first peer to drain
    pub fn start_running(&mut self) -> Option<u64> {
        let mut ranked: Vec<(u64, u64, u64)> = self
            .statuses
            .iter()
            .filter_map(|(id, status)| {
                status
                    .response
                    .as_ref()
                    .map(|r| (*id, r.block.height, r.round_trip_ms))
            })
            .collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.2.cmp(&b.2)));

        self.order = ranked.into_iter().map(|(id, _, _)| id).collect();
        self.cursor = 0;
        self.ranges.clear();
        self.phase = IbdPhase::Running;
        self.current_peer()
    }

    /// The peer currently being drained
    pub fn current_peer(&self) -> Option<u64> {
        self.order.get(self.cursor).copied()
    }

    /// This peer's announced tip from the Preparing round
    pub fn response_of(&self, peer_id: u64) -> Option<&IbdResponse> {
        self.statuses.get(&peer_id).and_then(|s| s.response.as_ref())
    }

    /// Give up on the current peer; Failed when none remain
    pub fn advance_peer(&mut self) -> Option<u64> {
        self.cursor += 1;
        self.ranges.clear();
        match self.current_peer() {
            Some(peer) => Some(peer),
            None => {
                self.phase = IbdPhase::Failed;
                None
            }
        }
    }

    /// Plan GetBlocks ranges covering (local, target]
    pub fn plan_ranges(&mut self, local_height: u64, target_height: u64) {
        self.ranges.clear();
        let mut start = local_height + 1;
        while start <= target_height {
            self.ranges.push_back((start, MAX_GET_BLOCKS));
            start += MAX_GET_BLOCKS;
        }
    }

    /// Take the next planned range
    pub fn pop_range(&mut self) -> Option<(u64, u64)> {
        self.ranges.pop_front()
    }

    pub fn succeed(&mut self) {
        self.phase = IbdPhase::Succeeded;
    }

    pub fn fail(&mut self) {
        self.phase = IbdPhase::Failed;
    }
}

impl Default for IbdController {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::genesis_block;

    fn tip(height: u64) -> Block {
        let mut block = genesis_block();
        block.height = height;
        block
    }

    #[test]
    fn test_phase_walk() {
        let mut ibd = IbdController::new();
        assert_eq!(ibd.phase(), IbdPhase::None);
        assert!(!ibd.is_active());

        ibd.begin_preparing();
        ibd.register_peer(1);
        ibd.register_peer(2);
        assert!(ibd.is_active());

        ibd.mark_requested(1, 100);
        ibd.mark_requested(2, 100);
        assert!(!ibd.record_response(1, tip(10), 150));
        assert!(ibd.record_response(2, tip(20), 180));

        ibd.start_running();
        assert_eq!(ibd.phase(), IbdPhase::Running);

        ibd.succeed();
        assert!(!ibd.is_active());
    }

    #[test]
    fn test_ranking_height_then_round_trip() {
        let mut ibd = IbdController::new();
        ibd.begin_preparing();
        for id in 1..=3 {
            ibd.register_peer(id);
            ibd.mark_requested(id, 0);
        }
        ibd.record_response(1, tip(30), 90); // tallest, slow
        ibd.record_response(2, tip(30), 40); // tallest, fast
        ibd.record_response(3, tip(50), 500); // taller still

        assert_eq!(ibd.start_running(), Some(3));
        assert_eq!(ibd.advance_peer(), Some(2));
        assert_eq!(ibd.advance_peer(), Some(1));
        assert_eq!(ibd.advance_peer(), None);
        assert_eq!(ibd.phase(), IbdPhase::Failed);
    }

    #[test]
    fn test_dropped_peer_completes_round() {
        let mut ibd = IbdController::new();
        ibd.begin_preparing();
        ibd.register_peer(1);
        ibd.register_peer(2);
        ibd.mark_requested(1, 0);
        ibd.mark_requested(2, 0);
        ibd.record_response(1, tip(5), 10);
        assert!(!ibd.all_responded());

        ibd.drop_peer(2);
        assert!(ibd.all_responded());
    }

    #[test]
    fn test_range_planning() {
        let mut ibd = IbdController::new();
        ibd.plan_ranges(0, 100);
        let mut ranges = Vec::new();
        while let Some(range) = ibd.pop_range() {
            ranges.push(range);
        }
        // ceil(100 / 32) rounds of MAX_GET_BLOCKS each
        assert_eq!(
            ranges,
            vec![(1, 32), (33, 32), (65, 32), (97, 32)]
        );

        ibd.plan_ranges(10, 10);
        assert!(ibd.pop_range().is_none());
    }
}
