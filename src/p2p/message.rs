//! P2P wire messages
//!
//! Every line on the wire is an envelope `{t, c, d}`: an integer message
//! type, a signed 32-bit checksum (first 4 bytes, big-endian, of SHA-256 over
//! the body), and the JSON-encoded body string. A mismatching checksum drops
//! the message without further reaction.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::consensus::Block;
use crate::crypto::sha256;
use crate::validation::PendingTransaction;

/// Message type ids
pub const MSG_VERSION: u32 = 1;
pub const MSG_VERSION_ACK: u32 = 2;
pub const MSG_GET_LATEST_BLOCK: u32 = 10;
pub const MSG_GET_BLOCKS: u32 = 11;
pub const MSG_LATEST_BLOCK: u32 = 15;
pub const MSG_BLOCKS: u32 = 16;
pub const MSG_GET_MEMPOOL: u32 = 50;
pub const MSG_MEMPOOL: u32 = 55;
pub const MSG_PING: u32 = 1000;
pub const MSG_PONG: u32 = 1001;

#[derive(Serialize, Deserialize)]
struct Envelope {
    t: u32,
    c: i32,
    d: String,
}

#[derive(Serialize, Deserialize)]
struct EmptyBody {}

/// Version handshake body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionPayload {
    /// Advertised protocol version
    pub ver: u32,
    /// Advertised tip height
    pub height: u64,
    /// Random 32-byte hex identifying the node instance (self-loop guard)
    pub nonce: String,
}

/// Block range request body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetBlocksPayload {
    pub start_index: u64,
    pub max_count: u64,
}

/// Tip announcement body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatestBlockPayload {
    pub block: Block,
}

/// Block range delivery body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlocksPayload {
    pub blocks: Vec<Block>,
}

/// Pending transaction delivery body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MempoolPayload {
    /// True when these transactions were relayed from another peer
    pub rel: bool,
    pub txs: Vec<PendingTransaction>,
}

/// A decoded peer message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Version(VersionPayload),
    VersionAck,
    GetLatestBlock,
    GetBlocks(GetBlocksPayload),
    LatestBlock(LatestBlockPayload),
    Blocks(BlocksPayload),
    GetMempool,
    Mempool(MempoolPayload),
    Ping,
    Pong,
}

/// Message decoding errors
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Malformed JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Checksum mismatch")]
    Checksum,
    #[error("Unknown message type {0}")]
    UnknownType(u32),
}

/// First 4 bytes of SHA-256 over the body, big-endian, as a signed 32-bit
pub fn checksum(body: &str) -> i32 {
    let digest = sha256(body.as_bytes());
    i32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
}

impl Message {
    /// Wire type id of this message
    pub fn type_id(&self) -> u32 {
        match self {
            Message::Version(_) => MSG_VERSION,
            Message::VersionAck => MSG_VERSION_ACK,
            Message::GetLatestBlock => MSG_GET_LATEST_BLOCK,
            Message::GetBlocks(_) => MSG_GET_BLOCKS,
            Message::LatestBlock(_) => MSG_LATEST_BLOCK,
            Message::Blocks(_) => MSG_BLOCKS,
            Message::GetMempool => MSG_GET_MEMPOOL,
            Message::Mempool(_) => MSG_MEMPOOL,
            Message::Ping => MSG_PING,
            Message::Pong => MSG_PONG,
        }
    }

    /// Serialize to one envelope line (newline not included)
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        let body = match self {
            Message::Version(payload) => serde_json::to_string(payload)?,
            Message::GetBlocks(payload) => serde_json::to_string(payload)?,
            Message::LatestBlock(payload) => serde_json::to_string(payload)?,
            Message::Blocks(payload) => serde_json::to_string(payload)?,
            Message::Mempool(payload) => serde_json::to_string(payload)?,
            Message::VersionAck
            | Message::GetLatestBlock
            | Message::GetMempool
            | Message::Ping
            | Message::Pong => serde_json::to_string(&EmptyBody {})?,
        };
        serde_json::to_string(&Envelope {
            t: self.type_id(),
            c: checksum(&body),
            d: body,
        })
    }

    /// Parse one envelope line
    pub fn decode(line: &str) -> Result<Message, DecodeError> {
        let envelope: Envelope = serde_json::from_str(line)?;
        if checksum(&envelope.d) != envelope.c {
            return Err(DecodeError::Checksum);
        }
        let message = match envelope.t {
            MSG_VERSION => Message::Version(serde_json::from_str(&envelope.d)?),
            MSG_VERSION_ACK => Message::VersionAck,
            MSG_GET_LATEST_BLOCK => Message::GetLatestBlock,
            MSG_GET_BLOCKS => Message::GetBlocks(serde_json::from_str(&envelope.d)?),
            MSG_LATEST_BLOCK => Message::LatestBlock(serde_json::from_str(&envelope.d)?),
            MSG_BLOCKS => Message::Blocks(serde_json::from_str(&envelope.d)?),
            MSG_GET_MEMPOOL => Message::GetMempool,
            MSG_MEMPOOL => Message::Mempool(serde_json::from_str(&envelope.d)?),
            MSG_PING => Message::Ping,
            MSG_PONG => Message::Pong,
            other => return Err(DecodeError::UnknownType(other)),
        };
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::genesis_block;

    #[test]
    fn test_encode_decode_roundtrip() {
        let messages = vec![
            Message::Version(VersionPayload {
                ver: 1,
                height: 42,
                nonce: "ab".repeat(32),
            }),
            Message::VersionAck,
            Message::GetLatestBlock,
            Message::GetBlocks(GetBlocksPayload {
                start_index: 10,
                max_count: 32,
            }),
            Message::LatestBlock(LatestBlockPayload {
                block: genesis_block(),
            }),
            Message::Blocks(BlocksPayload {
                blocks: vec![genesis_block()],
            }),
            Message::GetMempool,
            Message::Mempool(MempoolPayload {
                rel: true,
                txs: vec![],
            }),
            Message::Ping,
            Message::Pong,
        ];
        for message in messages {
            let line = message.encode().unwrap();
            assert_eq!(Message::decode(&line).unwrap(), message);
        }
    }

    #[test]
    fn test_checksum_mismatch_detected() {
        let line = Message::Ping.encode().unwrap();
        let tampered = line.replace("\"c\":", "\"c\":1");
        assert!(matches!(
            Message::decode(&tampered),
            Err(DecodeError::Checksum) | Err(DecodeError::Json(_))
        ));
    }

    #[test]
    fn test_unknown_type_rejected() {
        let body = "{}".to_string();
        let line = serde_json::to_string(&Envelope {
            t: 999,
            c: checksum(&body),
            d: body,
        })
        .unwrap();
        assert!(matches!(
            Message::decode(&line),
            Err(DecodeError::UnknownType(999))
        ));
    }

    #[test]
    fn test_checksum_is_signed_big_endian() {
        // SHA-256("{}") begins 0x44 0x13 0x6f 0xa3
        assert_eq!(checksum("{}"), 0x44136fa3);
        // a body whose digest has the top bit set yields a negative checksum
        assert_eq!(checksum("pong"), -1751792129);
    }

    #[test]
    fn test_wire_field_names() {
        let line = Message::Version(VersionPayload {
            ver: 1,
            height: 7,
            nonce: "00".repeat(32),
        })
        .encode()
        .unwrap();
        assert!(line.contains("\"t\":1"));
        assert!(line.contains("\"c\":"));
        assert!(line.contains("\"d\":"));
        assert!(line.contains("ver"));
        assert!(line.contains("height"));
        assert!(line.contains("nonce"));
    }
}
