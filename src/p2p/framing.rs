//! Newline framing with the 0x7F byte mask
//!
//! Messages are newline-terminated JSON lines. Every byte is masked with
//! 0x7F on both read and write; the protocol content is ASCII (hex and
//! Base58), so the mask is lossless there and this quirk is
//! compatibility-visible on the wire.

use thiserror::Error;

/// A frame larger than this marks the peer for disconnection
pub const MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

/// Framing errors
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("Frame exceeds {MAX_FRAME_SIZE} bytes")]
    Oversize,
}

/// Accumulates masked bytes and emits complete lines
#[derive(Default)]
pub struct FrameReader {
    buffer: Vec<u8>,
}

impl FrameReader {
    pub fn new() -> Self {
        FrameReader::default()
    }

    /// Feed raw bytes; returns every complete frame they finish
    ///
    /// Partial frames stay buffered for the next read. An over-long frame is
    /// an error and the reader should not be reused afterwards.
    pub fn push(&mut self, bytes: &[u8]) -> Result<Vec<String>, FrameError> {
        let mut frames = Vec::new();
        for &raw in bytes {
            let byte = raw & 0x7F;
            if byte == b'\n' {
                let line = std::mem::take(&mut self.buffer);
                frames.push(String::from_utf8_lossy(&line).into_owned());
            } else {
                self.buffer.push(byte);
                if self.buffer.len() > MAX_FRAME_SIZE {
                    return Err(FrameError::Oversize);
                }
            }
        }
        Ok(frames)
    }
}

/// Serialize one line for the wire: mask every byte, terminate with newline
pub fn encode_frame(line: &str) -> Vec<u8> {
    let mut out: Vec<u8> = line.bytes().map(|b| b & 0x7F).collect();
    out.push(b'\n');
    out
}
