//! Handshake and sync tests
//!
//! Drives the dispatcher directly against scripted peers, then runs a real
//! two-node sync over localhost sockets.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::sync::mpsc;

use ox_core::constants::PROTOCOL_VERSION;
use ox_core::consensus::Network;
use ox_core::node::{handle_message, Node, NodeConfig};
use ox_core::p2p::{IbdPhase, Message, Peer, VersionPayload, OUTBOUND_QUEUE};

fn test_node(dir: &TempDir) -> Arc<Node> {
    Node::new(NodeConfig {
        data_dir: dir.path().to_path_buf(),
        listen: None,
        seeds: Vec::new(),
        network: Network::Regtest,
    })
    .unwrap()
}

fn scripted_peer(remote_initiated: bool) -> (Arc<Peer>, mpsc::Receiver<Message>) {
    let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE);
    let peer = Arc::new(Peer::new(
        7,
        "127.0.0.1:7777".parse().unwrap(),
        remote_initiated,
        tx,
        0,
    ));
    (peer, rx)
}

fn version_from(nonce: &str, height: u64) -> String {
    Message::Version(VersionPayload {
        ver: PROTOCOL_VERSION,
        height,
        nonce: nonce.to_string(),
    })
    .encode()
    .unwrap()
}

#[tokio::test]
async fn test_message_before_version_disconnects() {
    let dir = TempDir::new().unwrap();
    let node = test_node(&dir);
    let (peer, _rx) = scripted_peer(true);

    handle_message(&node, &peer, &Message::Ping.encode().unwrap()).await;
    assert!(peer.should_disconnect());
}

#[tokio::test]
async fn test_message_before_handshake_disconnects() {
    let dir = TempDir::new().unwrap();
    let node = test_node(&dir);
    let (peer, mut rx) = scripted_peer(true);

    handle_message(&node, &peer, &version_from(&"aa".repeat(32), 3)).await;
    assert!(!peer.should_disconnect());
    assert!(matches!(rx.try_recv().unwrap(), Message::Version(_)));

    // anything but VersionAck is premature
    handle_message(&node, &peer, &Message::GetLatestBlock.encode().unwrap()).await;
    assert!(peer.should_disconnect());
}

#[tokio::test]
async fn test_self_loop_disconnects() {
    let dir = TempDir::new().unwrap();
    let node = test_node(&dir);
    let (peer, mut rx) = scripted_peer(true);

    handle_message(&node, &peer, &version_from(&node.nonce, 3)).await;
    assert!(peer.should_disconnect());
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_old_protocol_version_disconnects() {
    let dir = TempDir::new().unwrap();
    let node = test_node(&dir);
    let (peer, _rx) = scripted_peer(true);

    let line = Message::Version(VersionPayload {
        ver: 0,
        height: 3,
        nonce: "aa".repeat(32),
    })
    .encode()
    .unwrap();
    handle_message(&node, &peer, &line).await;
    assert!(peer.should_disconnect());
}

#[tokio::test]
async fn test_duplicate_version_disconnects() {
    let dir = TempDir::new().unwrap();
    let node = test_node(&dir);
    let (peer, _rx) = scripted_peer(true);

    handle_message(&node, &peer, &version_from(&"aa".repeat(32), 3)).await;
    assert!(!peer.should_disconnect());
    handle_message(&node, &peer, &version_from(&"bb".repeat(32), 3)).await;
    assert!(peer.should_disconnect());
}

#[tokio::test]
async fn test_accepting_side_handshake() {
    let dir = TempDir::new().unwrap();
    let node = test_node(&dir);
    let (peer, mut rx) = scripted_peer(true);

    handle_message(&node, &peer, &version_from(&"aa".repeat(32), 9)).await;
    match rx.try_recv().unwrap() {
        Message::Version(payload) => {
            assert_eq!(payload.ver, PROTOCOL_VERSION);
            assert_eq!(payload.nonce, node.nonce);
        }
        other => panic!("expected Version, got {other:?}"),
    }
    assert_eq!(peer.state().last_height, 9);

    handle_message(&node, &peer, &Message::VersionAck.encode().unwrap()).await;
    assert!(peer.state().has_handshake);
    assert_eq!(rx.try_recv().unwrap(), Message::VersionAck);
    // the accepting side does not probe for the peer's tip
    assert!(rx.try_recv().is_err());

    // with the handshake done, chain queries are served
    handle_message(&node, &peer, &Message::GetLatestBlock.encode().unwrap()).await;
    match rx.try_recv().unwrap() {
        Message::LatestBlock(payload) => assert_eq!(payload.block.height, 0),
        other => panic!("expected LatestBlock, got {other:?}"),
    }
}

#[tokio::test]
async fn test_dialing_side_handshake_probes_tip() {
    let dir = TempDir::new().unwrap();
    let node = test_node(&dir);
    let (peer, mut rx) = scripted_peer(false);

    handle_message(&node, &peer, &version_from(&"aa".repeat(32), 9)).await;
    assert_eq!(rx.try_recv().unwrap(), Message::VersionAck);

    handle_message(&node, &peer, &Message::VersionAck.encode().unwrap()).await;
    assert!(peer.state().has_handshake);
    assert_eq!(rx.try_recv().unwrap(), Message::VersionAck);
    assert_eq!(rx.try_recv().unwrap(), Message::GetLatestBlock);
}

#[tokio::test]
async fn test_checksum_mismatch_is_silently_dropped() {
    let dir = TempDir::new().unwrap();
    let node = test_node(&dir);
    let (peer, mut rx) = scripted_peer(true);

    handle_message(&node, &peer, r#"{"t":1000,"c":0,"d":"{}"}"#).await;
    assert!(!peer.should_disconnect());
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_malformed_json_disconnects() {
    let dir = TempDir::new().unwrap();
    let node = test_node(&dir);
    let (peer, _rx) = scripted_peer(true);

    handle_message(&node, &peer, "this is not json").await;
    assert!(peer.should_disconnect());
}

#[tokio::test]
async fn test_unknown_type_disconnects() {
    let dir = TempDir::new().unwrap();
    let node = test_node(&dir);
    let (peer, _rx) = scripted_peer(true);

    // 1142124451 is the checksum of "{}"
    handle_message(&node, &peer, r#"{"t":777,"c":1142124451,"d":"{}"}"#).await;
    assert!(peer.should_disconnect());
}

fn free_addr() -> SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

/// Mine coinbase-only regtest blocks straight into a node's chain
async fn mine_blocks(node: &Arc<Node>, count: u64, miner: &str) {
    let mut chain = node.chain().lock().await;
    for _ in 0..count {
        let now = chain.latest_block().timestamp + 1_000;
        let mut block = chain.assemble_candidate(miner, now);
        block.hash = block.compute_hash();
        chain.add_new_block(&block, now).unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_two_node_initial_block_download() {
    let serve_addr = free_addr();

    let dir_a = TempDir::new().unwrap();
    let node_a = Node::new(NodeConfig {
        data_dir: dir_a.path().to_path_buf(),
        listen: Some(serve_addr),
        seeds: Vec::new(),
        network: Network::Regtest,
    })
    .unwrap();
    mine_blocks(&node_a, 5, "serving-miner").await;
    Arc::clone(&node_a).start().await.unwrap();

    let dir_b = TempDir::new().unwrap();
    let node_b = Node::new(NodeConfig {
        data_dir: dir_b.path().to_path_buf(),
        listen: None,
        seeds: vec![serve_addr],
        network: Network::Regtest,
    })
    .unwrap();
    Arc::clone(&node_b).start().await.unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let height = node_b.chain().lock().await.height();
        let phase = node_b.with_ibd(|ibd| ibd.phase());
        if height == 5 && phase == IbdPhase::Succeeded {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "sync timed out at height {height}, phase {phase:?}"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let tip_a = node_a.chain().lock().await.latest_block();
    let tip_b = node_b.chain().lock().await.latest_block();
    assert_eq!(tip_a, tip_b);

    node_b.shutdown().await;
    node_a.shutdown().await;
}
