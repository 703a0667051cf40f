//! getblocks / getheaders requests
//!
//! Layout: u32 LE protocol version, compact-size hash count, the locator
//! hashes, then a single stop hash (all-zero for "as many as possible").

use crate::network::cursor::{ByteBuilder, ByteCursor, Endian};
use crate::network::protocol::{
    CachedPayload, CodecError, CodecResult, Command, WireMessage, PROTOCOL_VERSION,
};
use crate::primitives::Hash;
use bytes::Bytes;

/// Locator lists at or above this length are rejected
pub const MAX_BLOCK_HASH_COUNT: u64 = 500;

fn parse_locator(cursor: &mut ByteCursor<'_>, command: Command) -> CodecResult<(u32, Vec<Hash>, Hash)> {
    let version = cursor.read_u32(Endian::Little);
    let count = cursor.read_variable_length_integer();
    if count >= MAX_BLOCK_HASH_COUNT {
        return Err(CodecError::CountExceeded {
            command: command.as_str(),
            count,
            max: MAX_BLOCK_HASH_COUNT,
        });
    }
    let mut hashes = Vec::with_capacity(count as usize);
    for _ in 0..count {
        hashes.push(cursor.read_hash());
    }
    let stop_hash = cursor.read_hash();
    Ok((version, hashes, stop_hash))
}

fn build_locator(version: u32, hashes: &[Hash], stop_hash: &Hash) -> Vec<u8> {
    let mut builder = ByteBuilder::with_capacity(4 + 9 + (hashes.len() + 1) * 32);
    builder
        .append_u32(version, Endian::Little)
        .append_variable_length_integer(hashes.len() as u64);
    for hash in hashes {
        builder.append_hash(hash);
    }
    builder.append_hash(stop_hash);
    builder.build()
}

macro_rules! locator_message {
    ($(#[$meta:meta])* $name:ident, $command:expr) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq)]
        pub struct $name {
            version: u32,
            block_hashes: Vec<Hash>,
            stop_hash: Hash,
            cache: CachedPayload,
        }

        impl $name {
            /// Request everything after the locator
            pub fn new(block_hashes: Vec<Hash>) -> Self {
                Self::with_stop_hash(block_hashes, Hash::ZERO)
            }

            pub fn with_stop_hash(block_hashes: Vec<Hash>, stop_hash: Hash) -> Self {
                Self {
                    version: PROTOCOL_VERSION as u32,
                    block_hashes,
                    stop_hash,
                    cache: CachedPayload::new(),
                }
            }

            pub fn version(&self) -> u32 {
                self.version
            }

            pub fn block_hashes(&self) -> &[Hash] {
                &self.block_hashes
            }

            pub fn stop_hash(&self) -> &Hash {
                &self.stop_hash
            }

            pub fn set_version(&mut self, version: u32) {
                self.version = version;
                self.cache.invalidate();
            }

            pub fn add_block_hash(&mut self, hash: Hash) {
                self.block_hashes.push(hash);
                self.cache.invalidate();
            }

            pub fn set_stop_hash(&mut self, hash: Hash) {
                self.stop_hash = hash;
                self.cache.invalidate();
            }
        }

        impl WireMessage for $name {
            const COMMAND: Command = $command;

            fn parse_payload(cursor: &mut ByteCursor<'_>) -> CodecResult<Self> {
                let (version, block_hashes, stop_hash) = parse_locator(cursor, Self::COMMAND)?;
                Ok(Self {
                    version,
                    block_hashes,
                    stop_hash,
                    cache: CachedPayload::new(),
                })
            }

            fn payload(&self) -> Bytes {
                self.cache
                    .get_or_build(|| build_locator(self.version, &self.block_hashes, &self.stop_hash))
            }
        }
    };
}

locator_message!(
    /// Ask a peer to announce the blocks following the locator
    GetBlocksMessage,
    Command::GetBlocks
);
locator_message!(
    /// Ask a peer for headers following the locator
    GetHeadersMessage,
    Command::GetHeaders
);
