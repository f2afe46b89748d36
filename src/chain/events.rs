//! Chain event sink
//!
//! The engine publishes inventory changes on a bounded broadcast channel;
//! consumers poll their receivers. A lagging consumer loses oldest events
//! rather than ever blocking the engine.

use tokio::sync::broadcast;

use crate::consensus::Block;
use crate::validation::PendingTransaction;

/// Capacity of the event channel
const EVENT_CAPACITY: usize = 64;

/// Inventory changes announced by the chain engine
#[derive(Debug, Clone)]
pub enum ChainEvent {
    /// A single block was accepted at the tip
    LatestBlock(Block),
    /// A run of blocks was accepted (extension or replacement)
    Blocks(Vec<Block>),
    /// Transactions entered the mempool
    Mempool(Vec<PendingTransaction>),
}

/// Bounded fan-out for chain events
pub struct EventSink {
    sender: broadcast::Sender<ChainEvent>,
}

impl EventSink {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CAPACITY);
        EventSink { sender }
    }

    /// A new receiver; only events emitted after this call are seen
    pub fn subscribe(&self) -> broadcast::Receiver<ChainEvent> {
        self.sender.subscribe()
    }

    /// Publish an event; having no subscribers is not an error
    pub fn emit(&self, event: ChainEvent) {
        let _ = self.sender.send(event);
    }
}

impl Default for EventSink {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::genesis_block;

    #[test]
    fn test_subscribers_see_events() {
        let sink = EventSink::new();
        let mut rx = sink.subscribe();
        sink.emit(ChainEvent::LatestBlock(genesis_block()));
        match rx.try_recv().unwrap() {
            ChainEvent::LatestBlock(block) => assert_eq!(block.height, 0),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_emit_without_subscribers_is_fine() {
        let sink = EventSink::new();
        sink.emit(ChainEvent::Blocks(vec![]));
    }
}
