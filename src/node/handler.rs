//! Message dispatcher
//!
//! Runs on each peer's reader task. Every inbound line is decoded and
//! checksum-checked, gated through the handshake state machine, then handled
//! per message type. Chain work happens under the chain lock with a bounded
//! acquisition; network sends never happen while the lock is held.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::chain::{BlockDelivery, MempoolAdmission};
use crate::constants::{MAX_GET_BLOCKS, PROTOCOL_VERSION};
use crate::p2p::{
    BlocksPayload, DecodeError, GetBlocksPayload, IbdPhase, LatestBlockPayload, MempoolPayload,
    Message, Peer, VersionPayload,
};

use super::{now_ms, Node};

/// Decode and react to one framed line from a peer
pub async fn handle_message(node: &Arc<Node>, peer: &Arc<Peer>, line: &str) {
    let message = match Message::decode(line) {
        Ok(message) => message,
        Err(DecodeError::Checksum) => {
            debug!(peer = peer.id, "checksum mismatch; dropping message");
            return;
        }
        Err(err) => {
            warn!(peer = peer.id, %err, "undecodable message; disconnecting");
            peer.mark_disconnect();
            return;
        }
    };

    peer.state().last_message_in = now_ms();

    // handshake gate: Version first, then nothing but VersionAck until done
    match &message {
        Message::Version(payload) => {
            handle_version(node, peer, payload.clone()).await;
            return;
        }
        _ => {
            let state = peer.state();
            if state.version == 0 {
                drop(state);
                warn!(peer = peer.id, "message before Version; disconnecting");
                peer.mark_disconnect();
                return;
            }
            if !state.has_handshake && !matches!(message, Message::VersionAck) {
                drop(state);
                warn!(peer = peer.id, "message before handshake; disconnecting");
                peer.mark_disconnect();
                return;
            }
        }
    }

    match message {
        Message::Version(_) => unreachable!("handled above"),
        Message::VersionAck => handle_version_ack(node, peer).await,
        Message::GetLatestBlock => handle_get_latest_block(node, peer).await,
        Message::GetBlocks(payload) => handle_get_blocks(node, peer, payload).await,
        Message::LatestBlock(payload) => handle_latest_block(node, peer, payload).await,
        Message::Blocks(payload) => handle_blocks(node, peer, payload).await,
        Message::GetMempool => handle_get_mempool(node, peer).await,
        Message::Mempool(payload) => handle_mempool(node, peer, payload).await,
        Message::Ping => peer.send(Message::Pong),
        Message::Pong => {} // liveness already refreshed above
    }
}

async fn handle_version(node: &Arc<Node>, peer: &Arc<Peer>, payload: VersionPayload) {
    {
        let state = peer.state();
        if state.version != 0 {
            drop(state);
            warn!(peer = peer.id, "duplicate Version; disconnecting");
            peer.mark_disconnect();
            return;
        }
    }
    if payload.nonce == node.nonce {
        info!(peer = peer.id, "connected to ourselves; disconnecting");
        peer.mark_disconnect();
        return;
    }
    if payload.ver < PROTOCOL_VERSION {
        info!(peer = peer.id, version = payload.ver, "peer too old; disconnecting");
        peer.mark_disconnect();
        return;
    }

    {
        let mut state = peer.state();
        state.version = payload.ver;
        state.last_height = payload.height;
    }

    if peer.remote_initiated {
        peer.send(Message::Version(node.version_payload().await));
    } else {
        peer.send(Message::VersionAck);
    }
}

async fn handle_version_ack(node: &Arc<Node>, peer: &Arc<Peer>) {
    let first = {
        let mut state = peer.state();
        if state.has_handshake {
            false
        } else {
            state.has_handshake = true;
            true
        }
    };
    if !first {
        return;
    }

    peer.send(Message::VersionAck);
    debug!(peer = peer.id, addr = %peer.addr, "handshake complete");

    // the dialing side seeds IBD with the peer's tip
    if !peer.remote_initiated {
        node.with_ibd(|ibd| {
            if ibd.phase() == IbdPhase::Preparing && ibd.is_registered(peer.id) {
                ibd.mark_requested(peer.id, now_ms());
            }
        });
        peer.send(Message::GetLatestBlock);
    }
}

async fn handle_get_latest_block(node: &Arc<Node>, peer: &Arc<Peer>) {
    if node.with_ibd(|ibd| ibd.is_active()) {
        return;
    }
    let Some(chain) = node.lock_chain().await else {
        return;
    };
    let block = chain.latest_block();
    drop(chain);
    peer.send(Message::LatestBlock(LatestBlockPayload { block }));
}

async fn handle_get_blocks(node: &Arc<Node>, peer: &Arc<Peer>, payload: GetBlocksPayload) {
    if node.with_ibd(|ibd| ibd.is_active()) {
        return;
    }
    if payload.max_count == 0 || payload.max_count > MAX_GET_BLOCKS {
        debug!(peer = peer.id, max = payload.max_count, "ignoring bad GetBlocks");
        return;
    }
    let Some(mut chain) = node.lock_chain().await else {
        return;
    };
    let blocks = match chain.blocks_range(payload.start_index, payload.max_count) {
        Ok(blocks) => blocks,
        Err(err) => {
            warn!(%err, "failed to read block range");
            return;
        }
    };
    drop(chain);
    peer.send(Message::Blocks(BlocksPayload { blocks }));
}

async fn handle_latest_block(node: &Arc<Node>, peer: &Arc<Peer>, payload: LatestBlockPayload) {
    let block = payload.block;

    if !block.sane(node.network()) {
        warn!(peer = peer.id, "insane LatestBlock; disconnecting");
        peer.mark_disconnect();
        return;
    }

    {
        let mut state = peer.state();
        state.last_height = state.last_height.max(block.height);
    }

    // during Preparing this is the answer to our GetLatestBlock probe
    let preparing_done = node.with_ibd(|ibd| {
        if ibd.phase() == IbdPhase::Preparing && ibd.is_registered(peer.id) {
            Some(ibd.record_response(peer.id, block.clone(), now_ms()))
        } else {
            None
        }
    });
    match preparing_done {
        Some(true) => {
            node.with_ibd(|ibd| ibd.start_running());
            ibd_progress(node).await;
            return;
        }
        Some(false) => return,
        None => {}
    }

    let delivery = peer.stored_and_new(vec![block.clone()]);
    let peer_height = peer.state().last_height;
    let Some(mut chain) = node.lock_chain().await else {
        return;
    };
    let result = match chain.add_blocks_from_peer(&delivery, peer_height, now_ms()) {
        Ok(result) => result,
        Err(err) => {
            warn!(%err, "chain store failure on LatestBlock");
            return;
        }
    };
    let latest = chain.latest_block();
    drop(chain);

    match result {
        BlockDelivery::AddedSingle
        | BlockDelivery::AddedMultiple
        | BlockDelivery::ReplacedMultiple => {
            peer.clear_stored();
            node.broadcast(
                Message::LatestBlock(LatestBlockPayload { block: latest }),
                Some(peer.id),
            );
        }
        BlockDelivery::NothingChanged | BlockDelivery::Empty => {}
        BlockDelivery::NeedMore { start } | BlockDelivery::NeedMoreShouldStore { start } => {
            peer.store_blocks(&[block]);
            peer.send(Message::GetBlocks(GetBlocksPayload {
                start_index: start,
                max_count: MAX_GET_BLOCKS,
            }));
        }
        BlockDelivery::RejectedInvalidSingle | BlockDelivery::RejectedInvalidMultiple => {
            warn!(peer = peer.id, "invalid LatestBlock; disconnecting");
            peer.mark_disconnect();
        }
        BlockDelivery::RejectedShorterChain => {}
    }
}

async fn handle_blocks(node: &Arc<Node>, peer: &Arc<Peer>, payload: BlocksPayload) {
    let ibd_running = node.with_ibd(|ibd| ibd.phase() == IbdPhase::Running);
    if ibd_running {
        // only the selected peer feeds us during IBD
        let selected = node.with_ibd(|ibd| ibd.current_peer()) == Some(peer.id);
        if !selected {
            debug!(peer = peer.id, "ignoring Blocks from unselected peer");
            return;
        }
    }

    let delivery = peer.stored_and_new(payload.blocks.clone());
    let peer_height = peer.state().last_height;
    let Some(mut chain) = node.lock_chain().await else {
        return;
    };
    let result = match chain.add_blocks_from_peer(&delivery, peer_height, now_ms()) {
        Ok(result) => result,
        Err(err) => {
            warn!(%err, "chain store failure on Blocks");
            return;
        }
    };
    drop(chain);

    match result {
        BlockDelivery::AddedSingle
        | BlockDelivery::AddedMultiple
        | BlockDelivery::ReplacedMultiple
        | BlockDelivery::NothingChanged => {
            peer.clear_stored();
            if ibd_running {
                ibd_next_range(node, peer).await;
            }
        }
        BlockDelivery::Empty => {}
        BlockDelivery::NeedMore { start } => {
            peer.send(Message::GetBlocks(GetBlocksPayload {
                start_index: start,
                max_count: MAX_GET_BLOCKS,
            }));
        }
        BlockDelivery::NeedMoreShouldStore { start } => {
            peer.store_blocks(&payload.blocks);
            peer.send(Message::GetBlocks(GetBlocksPayload {
                start_index: start,
                max_count: MAX_GET_BLOCKS,
            }));
        }
        BlockDelivery::RejectedInvalidSingle | BlockDelivery::RejectedInvalidMultiple => {
            warn!(peer = peer.id, "invalid Blocks; disconnecting");
            peer.mark_disconnect();
            if ibd_running {
                node.with_ibd(|ibd| ibd.advance_peer());
                ibd_progress(node).await;
            }
        }
        BlockDelivery::RejectedShorterChain => {
            if ibd_running {
                node.with_ibd(|ibd| ibd.advance_peer());
                ibd_progress(node).await;
            }
        }
    }
}

async fn handle_get_mempool(node: &Arc<Node>, peer: &Arc<Peer>) {
    if node.with_ibd(|ibd| ibd.is_active()) {
        return;
    }
    let Some(chain) = node.lock_chain().await else {
        return;
    };
    let txs = chain.pending_snapshot();
    drop(chain);
    peer.send(Message::Mempool(MempoolPayload { rel: false, txs }));
}

async fn handle_mempool(node: &Arc<Node>, peer: &Arc<Peer>, payload: MempoolPayload) {
    if node.with_ibd(|ibd| ibd.is_active()) {
        return;
    }
    let Some(mut chain) = node.lock_chain().await else {
        return;
    };
    let admission = match chain.add_pending(&payload.txs) {
        Ok(admission) => admission,
        Err(err) => {
            warn!(%err, "chain store failure on Mempool");
            return;
        }
    };
    drop(chain);

    match admission {
        MempoolAdmission::Added => {
            node.broadcast(
                Message::Mempool(MempoolPayload {
                    rel: true,
                    txs: payload.txs,
                }),
                Some(peer.id),
            );
        }
        MempoolAdmission::HardRejected => {
            warn!(peer = peer.id, "hard-rejected mempool batch; disconnecting");
            peer.mark_disconnect();
        }
        MempoolAdmission::SoftRejected | MempoolAdmission::Empty => {}
    }
}

/// Drive the Running phase: walk ranked peers until one can serve us
pub async fn ibd_progress(node: &Arc<Node>) {
    loop {
        let Some(peer_id) = node.with_ibd(|ibd| {
            if ibd.phase() == IbdPhase::Running {
                ibd.current_peer()
            } else {
                None
            }
        }) else {
            if node.with_ibd(|ibd| ibd.phase()) == IbdPhase::Failed {
                warn!("IBD failed: no usable peers");
            }
            return;
        };

        let Some(peer) = node.peer(peer_id) else {
            node.with_ibd(|ibd| ibd.advance_peer());
            continue;
        };
        let Some(announced) = node.with_ibd(|ibd| ibd.response_of(peer_id).cloned()) else {
            node.with_ibd(|ibd| ibd.advance_peer());
            continue;
        };

        let Some(mut chain) = node.lock_chain().await else {
            return;
        };
        let local_height = chain.height();

        // already at or past this peer's tip: we are synced
        if announced.block.height <= local_height {
            let latest = chain.latest_block();
            drop(chain);
            node.with_ibd(|ibd| ibd.succeed());
            info!(height = local_height, "IBD complete: already at tip");
            node.broadcast(Message::LatestBlock(LatestBlockPayload { block: latest }), None);
            return;
        }

        // one block ahead: treat the announced block as a direct extension
        if announced.block.height == local_height + 1 {
            let delivery = peer.stored_and_new(vec![announced.block.clone()]);
            let result = chain.add_blocks_from_peer(&delivery, announced.block.height, now_ms());
            let latest = chain.latest_block();
            drop(chain);
            match result {
                Ok(
                    BlockDelivery::AddedSingle
                    | BlockDelivery::AddedMultiple
                    | BlockDelivery::ReplacedMultiple
                    | BlockDelivery::NothingChanged,
                ) => {
                    peer.clear_stored();
                    node.with_ibd(|ibd| ibd.succeed());
                    info!(height = latest.height, "IBD complete");
                    node.broadcast(
                        Message::LatestBlock(LatestBlockPayload { block: latest }),
                        None,
                    );
                    peer.send(Message::GetMempool);
                    return;
                }
                Ok(
                    BlockDelivery::NeedMore { start }
                    | BlockDelivery::NeedMoreShouldStore { start },
                ) => {
                    peer.store_blocks(&[announced.block.clone()]);
                    peer.send(Message::GetBlocks(GetBlocksPayload {
                        start_index: start,
                        max_count: MAX_GET_BLOCKS,
                    }));
                    return;
                }
                Ok(_) | Err(_) => {
                    peer.mark_disconnect();
                    node.with_ibd(|ibd| ibd.advance_peer());
                    continue;
                }
            }
        }

        // further ahead: plan ranges and request the first
        drop(chain);
        node.with_ibd(|ibd| ibd.plan_ranges(local_height, announced.block.height));
        let Some((start, count)) = node.with_ibd(|ibd| ibd.pop_range()) else {
            node.with_ibd(|ibd| ibd.advance_peer());
            continue;
        };
        peer.send(Message::GetBlocks(GetBlocksPayload {
            start_index: start,
            max_count: count,
        }));
        return;
    }
}

/// After a successful IBD delivery: request the next range or finish
async fn ibd_next_range(node: &Arc<Node>, peer: &Arc<Peer>) {
    if let Some((start, count)) = node.with_ibd(|ibd| ibd.pop_range()) {
        peer.send(Message::GetBlocks(GetBlocksPayload {
            start_index: start,
            max_count: count,
        }));
        return;
    }

    let Some(chain) = node.lock_chain().await else {
        return;
    };
    let latest = chain.latest_block();
    drop(chain);

    node.with_ibd(|ibd| ibd.succeed());
    info!(height = latest.height, "IBD complete");
    node.broadcast(Message::LatestBlock(LatestBlockPayload { block: latest }), None);
    peer.send(Message::GetMempool);
}
