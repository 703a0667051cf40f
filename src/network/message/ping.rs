//! Ping/pong keepalive messages (8-byte little-endian nonce)

use crate::network::cursor::{ByteBuilder, ByteCursor, Endian};
use crate::network::protocol::{CodecResult, Command, WireMessage};
use bytes::Bytes;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PingMessage {
    pub nonce: u64,
}

impl PingMessage {
    /// Ping with a random nonce
    pub fn new() -> Self {
        Self {
            nonce: rand::random(),
        }
    }

    pub fn with_nonce(nonce: u64) -> Self {
        Self { nonce }
    }
}

impl Default for PingMessage {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PongMessage {
    pub nonce: u64,
}

impl PongMessage {
    /// Pong echoing the ping's nonce
    pub fn reply_to(ping: &PingMessage) -> Self {
        Self { nonce: ping.nonce }
    }

    pub fn answers(&self, ping: &PingMessage) -> bool {
        self.nonce == ping.nonce
    }
}

fn nonce_payload(nonce: u64) -> Bytes {
    let mut builder = ByteBuilder::with_capacity(8);
    builder.append_u64(nonce, Endian::Little);
    Bytes::from(builder.build())
}

impl WireMessage for PingMessage {
    const COMMAND: Command = Command::Ping;

    fn parse_payload(cursor: &mut ByteCursor<'_>) -> CodecResult<Self> {
        Ok(Self {
            nonce: cursor.read_u64(Endian::Little),
        })
    }

    fn payload(&self) -> Bytes {
        nonce_payload(self.nonce)
    }
}

impl WireMessage for PongMessage {
    const COMMAND: Command = Command::Pong;

    fn parse_payload(cursor: &mut ByteCursor<'_>) -> CodecResult<Self> {
        Ok(Self {
            nonce: cursor.read_u64(Endian::Little),
        })
    }

    fn payload(&self) -> Bytes {
        nonce_payload(self.nonce)
    }
}
