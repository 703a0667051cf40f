//! Bitcoin protocol message envelope
//!
//! Every message is a 24-byte header (magic, command, payload length,
//! checksum) followed by the payload. The header is validated here before
//! any type-specific payload parser runs.

use crate::network::cursor::{ByteBuilder, ByteCursor, Endian};
use crate::network::message::{
    BlockMessage, GetBlocksMessage, GetDataMessage, GetHeadersMessage, HeadersMessage,
    InventoryMessage, NotFoundMessage, PingMessage, PongMessage, RejectMessage,
    TransactionMessage, VerackMessage, VersionMessage,
};
use crate::primitives::{BlockHeader, Hash};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;
use thiserror::Error;
use tracing::debug;

/// Bitcoin protocol constants
pub const BITCOIN_MAGIC_MAINNET: [u8; 4] = [0xf9, 0xbe, 0xb4, 0xd9];
pub const BITCOIN_MAGIC_TESTNET: [u8; 4] = [0x0b, 0x11, 0x09, 0x07];
pub const BITCOIN_MAGIC_REGTEST: [u8; 4] = [0xfa, 0xbf, 0xb5, 0xda];

/// Maximum protocol message size (32MB)
pub const MAX_PROTOCOL_MESSAGE_LENGTH: usize = 32 * 1024 * 1024;

pub const MESSAGE_HEADER_BYTE_COUNT: usize = 24;
pub const COMMAND_BYTE_COUNT: usize = 12;

/// Protocol version advertised in our version message
pub const PROTOCOL_VERSION: i32 = 70015;

/// Merkle root shared by every network's genesis block, in wire order
const GENESIS_MERKLE_ROOT: [u8; 32] = [
    0x3b, 0xa3, 0xed, 0xfd, 0x7a, 0x7b, 0x12, 0xb2, 0x7a, 0xc7, 0x2c, 0x3e, 0x67, 0x76, 0x8f, 0x61,
    0x7f, 0xc8, 0x1b, 0xc3, 0x88, 0x8a, 0x51, 0x32, 0x3a, 0x9f, 0xb8, 0xaa, 0x4b, 0x1e, 0x5e, 0x4a,
];

/// Network selection; each network has its own magic number
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Mainnet,
    Testnet,
    Regtest,
}

impl Network {
    pub fn magic(&self) -> [u8; 4] {
        match self {
            Network::Mainnet => BITCOIN_MAGIC_MAINNET,
            Network::Testnet => BITCOIN_MAGIC_TESTNET,
            Network::Regtest => BITCOIN_MAGIC_REGTEST,
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            Network::Mainnet => 8333,
            Network::Testnet => 18333,
            Network::Regtest => 18444,
        }
    }

    /// Header of the network's first block, the root of every chain
    pub fn genesis_header(&self) -> BlockHeader {
        let (timestamp, bits, nonce) = match self {
            Network::Mainnet => (1_231_006_505, 0x1d00_ffff, 2_083_236_893),
            Network::Testnet => (1_296_688_602, 0x1d00_ffff, 414_098_458),
            Network::Regtest => (1_296_688_602, 0x207f_ffff, 2),
        };
        BlockHeader {
            version: 1,
            previous_block_hash: Hash::ZERO,
            merkle_root: Hash::new(GENESIS_MERKLE_ROOT),
            timestamp,
            bits,
            nonce,
        }
    }
}

impl Default for Network {
    fn default() -> Self {
        Self::Mainnet
    }
}

/// Codec failures. Every variant means the bytes were structurally invalid;
/// a cleanly absent message is `Ok(None)` instead.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Invalid magic number: expected {expected:02x?}, got {actual:02x?}")]
    BadMagic { expected: [u8; 4], actual: [u8; 4] },

    #[error("Invalid command bytes: {0:02x?}")]
    InvalidCommand(Vec<u8>),

    #[error("Message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("Payload length mismatch: header declares {declared}, found {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("Invalid checksum for {command}")]
    ChecksumMismatch { command: String },

    #[error("{command}: declared count {count} exceeds maximum {max}")]
    CountExceeded {
        command: &'static str,
        count: u64,
        max: u64,
    },

    #[error("{command}: payload ended before all fields were read")]
    Overflow { command: &'static str },

    #[error("{command}: malformed payload: {reason}")]
    InvalidPayload {
        command: &'static str,
        reason: String,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type CodecResult<T> = Result<T, CodecError>;

/// Commands understood by this node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Version,
    Verack,
    Ping,
    Pong,
    Inventory,
    GetData,
    NotFound,
    GetBlocks,
    GetHeaders,
    Headers,
    Block,
    Transaction,
    Reject,
}

impl Command {
    pub const ALL: [Command; 13] = [
        Command::Version,
        Command::Verack,
        Command::Ping,
        Command::Pong,
        Command::Inventory,
        Command::GetData,
        Command::NotFound,
        Command::GetBlocks,
        Command::GetHeaders,
        Command::Headers,
        Command::Block,
        Command::Transaction,
        Command::Reject,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Version => "version",
            Command::Verack => "verack",
            Command::Ping => "ping",
            Command::Pong => "pong",
            Command::Inventory => "inv",
            Command::GetData => "getdata",
            Command::NotFound => "notfound",
            Command::GetBlocks => "getblocks",
            Command::GetHeaders => "getheaders",
            Command::Headers => "headers",
            Command::Block => "block",
            Command::Transaction => "tx",
            Command::Reject => "reject",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|command| command.as_str() == name)
    }

    /// 12-byte null-padded wire form
    pub fn to_bytes(&self) -> [u8; COMMAND_BYTE_COUNT] {
        let mut bytes = [0u8; COMMAND_BYTE_COUNT];
        let name = self.as_str().as_bytes();
        bytes[..name.len()].copy_from_slice(name);
        bytes
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parsed message header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageHeader {
    pub magic: [u8; 4],
    /// Command name with padding stripped
    pub command: String,
    pub payload_length: u32,
    pub checksum: [u8; 4],
}

impl MessageHeader {
    /// Parse the first 24 bytes. `Ok(None)` when fewer bytes are available.
    pub fn parse(bytes: &[u8]) -> CodecResult<Option<Self>> {
        if bytes.len() < MESSAGE_HEADER_BYTE_COUNT {
            return Ok(None);
        }

        let mut cursor = ByteCursor::new(&bytes[..MESSAGE_HEADER_BYTE_COUNT]);
        let mut magic = [0u8; 4];
        magic.copy_from_slice(&cursor.read_bytes(4, Endian::Big));
        let command_bytes = cursor.read_bytes(COMMAND_BYTE_COUNT, Endian::Big);
        let payload_length = cursor.read_u32(Endian::Little);
        let mut checksum = [0u8; 4];
        checksum.copy_from_slice(&cursor.read_bytes(4, Endian::Big));

        let command = parse_command(&command_bytes)?;
        Ok(Some(Self {
            magic,
            command,
            payload_length,
            checksum,
        }))
    }

    pub fn total_length(&self) -> usize {
        MESSAGE_HEADER_BYTE_COUNT + self.payload_length as usize
    }

    pub fn ensure_magic(&self, expected: [u8; 4]) -> CodecResult<()> {
        if self.magic != expected {
            return Err(CodecError::BadMagic {
                expected,
                actual: self.magic,
            });
        }
        Ok(())
    }

    pub fn ensure_size(&self) -> CodecResult<()> {
        if self.payload_length as usize > MAX_PROTOCOL_MESSAGE_LENGTH - MESSAGE_HEADER_BYTE_COUNT {
            return Err(CodecError::MessageTooLarge {
                size: self.total_length(),
                max: MAX_PROTOCOL_MESSAGE_LENGTH,
            });
        }
        Ok(())
    }
}

/// Printable ASCII followed only by null padding
fn parse_command(bytes: &[u8]) -> CodecResult<String> {
    let name_length = bytes.iter().position(|byte| *byte == 0).unwrap_or(bytes.len());
    let (name, padding) = bytes.split_at(name_length);
    let printable = name.iter().all(|byte| byte.is_ascii_graphic());
    let padded = padding.iter().all(|byte| *byte == 0);
    if !printable || !padded {
        return Err(CodecError::InvalidCommand(bytes.to_vec()));
    }
    Ok(String::from_utf8_lossy(name).into_owned())
}

/// Calculate message checksum (first four bytes of double SHA256)
pub fn calculate_checksum(payload: &[u8]) -> [u8; 4] {
    let hash = Hash::double_sha256(payload);
    let mut checksum = [0u8; 4];
    checksum.copy_from_slice(&hash.as_bytes()[..4]);
    checksum
}

/// Validate the envelope of a complete message and return its payload.
///
/// `Ok(None)` when the buffer cannot hold a header or carries a different
/// command than `expected`.
pub fn open_envelope(bytes: &[u8], magic: [u8; 4], expected: Command) -> CodecResult<Option<&[u8]>> {
    let Some(header) = MessageHeader::parse(bytes)? else {
        return Ok(None);
    };
    header.ensure_magic(magic)?;
    if header.command != expected.as_str() {
        return Ok(None);
    }
    validate_payload(&header, bytes).map(Some)
}

fn validate_payload<'a>(header: &MessageHeader, bytes: &'a [u8]) -> CodecResult<&'a [u8]> {
    header.ensure_size()?;

    let payload = &bytes[MESSAGE_HEADER_BYTE_COUNT..];
    if payload.len() != header.payload_length as usize {
        return Err(CodecError::LengthMismatch {
            declared: header.payload_length as usize,
            actual: payload.len(),
        });
    }

    if calculate_checksum(payload) != header.checksum {
        return Err(CodecError::ChecksumMismatch {
            command: header.command.clone(),
        });
    }

    Ok(payload)
}

/// Serialize header + payload
pub fn seal(magic: [u8; 4], command: Command, payload: &[u8]) -> Bytes {
    let mut builder = ByteBuilder::with_capacity(MESSAGE_HEADER_BYTE_COUNT + payload.len());
    builder
        .append_bytes(&magic, Endian::Big)
        .append_bytes(&command.to_bytes(), Endian::Big)
        .append_u32(payload.len() as u32, Endian::Little)
        .append_bytes(&calculate_checksum(payload), Endian::Big)
        .append_bytes(payload, Endian::Big);
    Bytes::from(builder.build())
}

/// Lazily built, cached payload bytes for outbound messages.
///
/// Mutators on the owning message call [`invalidate`](Self::invalidate);
/// the cache never takes part in equality.
#[derive(Default)]
pub struct CachedPayload(OnceLock<Bytes>);

impl CachedPayload {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_build<F>(&self, build: F) -> Bytes
    where
        F: FnOnce() -> Vec<u8>,
    {
        self.0.get_or_init(|| Bytes::from(build())).clone()
    }

    pub fn invalidate(&mut self) {
        self.0 = OnceLock::new();
    }

    pub fn is_cached(&self) -> bool {
        self.0.get().is_some()
    }
}

impl Clone for CachedPayload {
    fn clone(&self) -> Self {
        let cell = OnceLock::new();
        if let Some(bytes) = self.0.get() {
            let _ = cell.set(bytes.clone());
        }
        Self(cell)
    }
}

impl PartialEq for CachedPayload {
    fn eq(&self, _other: &Self) -> bool {
        true
    }
}

impl Eq for CachedPayload {}

impl fmt::Debug for CachedPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CachedPayload({})", if self.is_cached() { "cached" } else { "empty" })
    }
}

/// A message type with a fixed command and a payload codec
pub trait WireMessage: Sized {
    const COMMAND: Command;

    /// Parse the payload. Overflow is checked by the caller.
    fn parse_payload(cursor: &mut ByteCursor<'_>) -> CodecResult<Self>;

    /// Serialized payload, possibly served from a cache
    fn payload(&self) -> Bytes;

    /// Decode a complete message of this type.
    fn decode(bytes: &[u8], magic: [u8; 4]) -> CodecResult<Option<Self>> {
        let Some(payload) = open_envelope(bytes, magic, Self::COMMAND)? else {
            return Ok(None);
        };
        parse_checked(payload).map(Some)
    }

    fn encode(&self, magic: [u8; 4]) -> Bytes {
        seal(magic, Self::COMMAND, &self.payload())
    }
}

fn parse_checked<M: WireMessage>(payload: &[u8]) -> CodecResult<M> {
    let mut cursor = ByteCursor::new(payload);
    let message = M::parse_payload(&mut cursor)?;
    if cursor.did_overflow() {
        return Err(CodecError::Overflow {
            command: M::COMMAND.as_str(),
        });
    }
    Ok(message)
}

/// Bitcoin protocol message types
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolMessage {
    Version(VersionMessage),
    Verack(VerackMessage),
    Ping(PingMessage),
    Pong(PongMessage),
    Inventory(InventoryMessage),
    GetData(GetDataMessage),
    NotFound(NotFoundMessage),
    GetBlocks(GetBlocksMessage),
    GetHeaders(GetHeadersMessage),
    Headers(HeadersMessage),
    Block(BlockMessage),
    Transaction(TransactionMessage),
    Reject(RejectMessage),
}

impl ProtocolMessage {
    pub fn command(&self) -> Command {
        match self {
            ProtocolMessage::Version(_) => Command::Version,
            ProtocolMessage::Verack(_) => Command::Verack,
            ProtocolMessage::Ping(_) => Command::Ping,
            ProtocolMessage::Pong(_) => Command::Pong,
            ProtocolMessage::Inventory(_) => Command::Inventory,
            ProtocolMessage::GetData(_) => Command::GetData,
            ProtocolMessage::NotFound(_) => Command::NotFound,
            ProtocolMessage::GetBlocks(_) => Command::GetBlocks,
            ProtocolMessage::GetHeaders(_) => Command::GetHeaders,
            ProtocolMessage::Headers(_) => Command::Headers,
            ProtocolMessage::Block(_) => Command::Block,
            ProtocolMessage::Transaction(_) => Command::Transaction,
            ProtocolMessage::Reject(_) => Command::Reject,
        }
    }

    /// Decode any supported message.
    ///
    /// `Ok(None)` for short buffers and for well-formed messages whose
    /// command this node does not handle.
    pub fn decode(bytes: &[u8], magic: [u8; 4]) -> CodecResult<Option<Self>> {
        let Some(header) = MessageHeader::parse(bytes)? else {
            return Ok(None);
        };
        header.ensure_magic(magic)?;

        let Some(command) = Command::from_name(&header.command) else {
            debug!("Unsupported command: {}", header.command);
            return Ok(None);
        };

        let payload = validate_payload(&header, bytes)?;
        let message = match command {
            Command::Version => ProtocolMessage::Version(parse_checked(payload)?),
            Command::Verack => ProtocolMessage::Verack(parse_checked(payload)?),
            Command::Ping => ProtocolMessage::Ping(parse_checked(payload)?),
            Command::Pong => ProtocolMessage::Pong(parse_checked(payload)?),
            Command::Inventory => ProtocolMessage::Inventory(parse_checked(payload)?),
            Command::GetData => ProtocolMessage::GetData(parse_checked(payload)?),
            Command::NotFound => ProtocolMessage::NotFound(parse_checked(payload)?),
            Command::GetBlocks => ProtocolMessage::GetBlocks(parse_checked(payload)?),
            Command::GetHeaders => ProtocolMessage::GetHeaders(parse_checked(payload)?),
            Command::Headers => ProtocolMessage::Headers(parse_checked(payload)?),
            Command::Block => ProtocolMessage::Block(parse_checked(payload)?),
            Command::Transaction => ProtocolMessage::Transaction(parse_checked(payload)?),
            Command::Reject => ProtocolMessage::Reject(parse_checked(payload)?),
        };
        Ok(Some(message))
    }

    pub fn encode(&self, magic: [u8; 4]) -> Bytes {
        match self {
            ProtocolMessage::Version(message) => message.encode(magic),
            ProtocolMessage::Verack(message) => message.encode(magic),
            ProtocolMessage::Ping(message) => message.encode(magic),
            ProtocolMessage::Pong(message) => message.encode(magic),
            ProtocolMessage::Inventory(message) => message.encode(magic),
            ProtocolMessage::GetData(message) => message.encode(magic),
            ProtocolMessage::NotFound(message) => message.encode(magic),
            ProtocolMessage::GetBlocks(message) => message.encode(magic),
            ProtocolMessage::GetHeaders(message) => message.encode(magic),
            ProtocolMessage::Headers(message) => message.encode(magic),
            ProtocolMessage::Block(message) => message.encode(magic),
            ProtocolMessage::Transaction(message) => message.encode(magic),
            ProtocolMessage::Reject(message) => message.encode(magic),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAGIC: [u8; 4] = BITCOIN_MAGIC_MAINNET;

    #[test]
    fn test_genesis_hashes() {
        assert_eq!(
            Network::Mainnet.genesis_header().hash().to_hex(),
            "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f"
        );
        assert_eq!(
            Network::Testnet.genesis_header().hash().to_hex(),
            "000000000933ea01ad0ee984209779baaec3ced90fa3f408719526f8d77f4943"
        );
        assert_eq!(
            Network::Regtest.genesis_header().hash().to_hex(),
            "0f9188f13cb7b2c71f2a335e3a4fc328bf5beb436012afca590b1a11466e2206"
        );
    }

    #[test]
    fn test_short_buffer_is_absent() {
        for length in 0..MESSAGE_HEADER_BYTE_COUNT {
            let bytes = vec![0u8; length];
            assert!(matches!(ProtocolMessage::decode(&bytes, MAGIC), Ok(None)));
            assert!(matches!(PingMessage::decode(&bytes, MAGIC), Ok(None)));
        }
    }

    #[test]
    fn test_seal_layout() {
        let sealed = seal(MAGIC, Command::Verack, &[]);
        assert_eq!(sealed.len(), MESSAGE_HEADER_BYTE_COUNT);
        assert_eq!(&sealed[..4], &MAGIC);
        assert_eq!(&sealed[4..10], b"verack");
        assert_eq!(&sealed[10..16], &[0u8; 6]);
        assert_eq!(&sealed[16..20], &[0, 0, 0, 0]);
        assert_eq!(&sealed[20..24], &[0x5d, 0xf6, 0xe0, 0xe2]);
    }

    #[test]
    fn test_bad_magic_is_error() {
        let sealed = seal(BITCOIN_MAGIC_TESTNET, Command::Verack, &[]);
        assert!(matches!(
            ProtocolMessage::decode(&sealed, MAGIC),
            Err(CodecError::BadMagic { .. })
        ));
    }

    #[test]
    fn test_checksum_mismatch_is_error() {
        let mut sealed = seal(MAGIC, Command::Ping, &7u64.to_le_bytes()).to_vec();
        sealed[MESSAGE_HEADER_BYTE_COUNT] ^= 0xff;
        assert!(matches!(
            PingMessage::decode(&sealed, MAGIC),
            Err(CodecError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_length_mismatch_is_error() {
        let mut sealed = seal(MAGIC, Command::Ping, &7u64.to_le_bytes()).to_vec();
        sealed.push(0);
        assert!(matches!(
            ProtocolMessage::decode(&sealed, MAGIC),
            Err(CodecError::LengthMismatch { declared: 8, actual: 9 })
        ));
    }

    #[test]
    fn test_other_command_is_absent_for_typed_decode() {
        let sealed = seal(MAGIC, Command::Ping, &7u64.to_le_bytes());
        assert!(matches!(PongMessage::decode(&sealed, MAGIC), Ok(None)));
    }

    #[test]
    fn test_unsupported_command_is_absent() {
        let mut sealed = seal(MAGIC, Command::Verack, &[]).to_vec();
        sealed[4..16].copy_from_slice(b"sendheaders\0");
        assert!(matches!(ProtocolMessage::decode(&sealed, MAGIC), Ok(None)));
    }

    #[test]
    fn test_garbage_command_is_error() {
        let mut sealed = seal(MAGIC, Command::Verack, &[]).to_vec();
        sealed[4..16].copy_from_slice(b"ver\0ack\0\0\0\0\0");
        assert!(matches!(
            ProtocolMessage::decode(&sealed, MAGIC),
            Err(CodecError::InvalidCommand(_))
        ));
    }

    #[test]
    fn test_truncated_payload_is_overflow() {
        // A ping payload must carry eight bytes
        let sealed = seal(MAGIC, Command::Ping, &[1, 2, 3]);
        assert!(matches!(
            PingMessage::decode(&sealed, MAGIC),
            Err(CodecError::Overflow { command: "ping" })
        ));
    }

    #[test]
    fn test_command_names_round_trip() {
        for command in Command::ALL {
            assert_eq!(Command::from_name(command.as_str()), Some(command));
        }
    }

    #[test]
    fn test_cached_payload_invalidation() {
        let mut cache = CachedPayload::new();
        assert_eq!(cache.get_or_build(|| vec![1]), Bytes::from_static(&[1]));
        // Served from cache
        assert_eq!(cache.get_or_build(|| vec![2]), Bytes::from_static(&[1]));
        cache.invalidate();
        assert!(!cache.is_cached());
        assert_eq!(cache.get_or_build(|| vec![2]), Bytes::from_static(&[2]));
    }
}
