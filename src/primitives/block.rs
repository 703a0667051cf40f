//! Block and block header with wire serialization and chain-work math

use crate::network::cursor::{ByteBuilder, ByteCursor, Endian};
use crate::primitives::transaction::bounded_capacity;
use crate::primitives::{Hash, Transaction};
use serde::{Deserialize, Serialize};

/// Serialized size of a block header
pub const BLOCK_HEADER_BYTE_COUNT: usize = 80;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub version: i32,
    pub previous_block_hash: Hash,
    pub merkle_root: Hash,
    pub timestamp: u32,
    /// Compact difficulty target
    pub bits: u32,
    pub nonce: u32,
}

impl BlockHeader {
    pub fn read_from(cursor: &mut ByteCursor<'_>) -> Self {
        Self {
            version: cursor.read_i32(Endian::Little),
            previous_block_hash: cursor.read_hash(),
            merkle_root: cursor.read_hash(),
            timestamp: cursor.read_u32(Endian::Little),
            bits: cursor.read_u32(Endian::Little),
            nonce: cursor.read_u32(Endian::Little),
        }
    }

    pub fn write_to(&self, builder: &mut ByteBuilder) {
        builder
            .append_i32(self.version, Endian::Little)
            .append_hash(&self.previous_block_hash)
            .append_hash(&self.merkle_root)
            .append_u32(self.timestamp, Endian::Little)
            .append_u32(self.bits, Endian::Little)
            .append_u32(self.nonce, Endian::Little);
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut builder = ByteBuilder::with_capacity(BLOCK_HEADER_BYTE_COUNT);
        self.write_to(&mut builder);
        builder.build()
    }

    pub fn hash(&self) -> Hash {
        Hash::double_sha256(&self.to_bytes())
    }

    pub fn work(&self) -> ChainWork {
        ChainWork::from_compact_bits(self.bits)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn read_from(cursor: &mut ByteCursor<'_>) -> Self {
        let header = BlockHeader::read_from(cursor);
        let transaction_count = cursor.read_variable_length_integer();
        let mut transactions =
            Vec::with_capacity(bounded_capacity(transaction_count, cursor));
        for _ in 0..transaction_count {
            if cursor.did_overflow() {
                break;
            }
            transactions.push(Transaction::read_from(cursor));
        }
        Self {
            header,
            transactions,
        }
    }

    pub fn write_to(&self, builder: &mut ByteBuilder) {
        self.header.write_to(builder);
        builder.append_variable_length_integer(self.transactions.len() as u64);
        for transaction in &self.transactions {
            transaction.write_to(builder);
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut builder = ByteBuilder::new();
        self.write_to(&mut builder);
        builder.build()
    }

    /// Parse a complete serialized block; trailing bytes are rejected.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let mut cursor = ByteCursor::new(bytes);
        let block = Self::read_from(&mut cursor);
        if cursor.did_overflow() || cursor.remaining_byte_count() != 0 {
            return None;
        }
        Some(block)
    }

    pub fn hash(&self) -> Hash {
        self.header.hash()
    }

    pub fn previous_block_hash(&self) -> Hash {
        self.header.previous_block_hash
    }

    pub fn calculate_merkle_root(&self) -> Hash {
        let hashes: Vec<Hash> = self.transactions.iter().map(Transaction::hash).collect();
        merkle_root(hashes)
    }

    pub fn has_valid_merkle_root(&self) -> bool {
        !self.transactions.is_empty() && self.calculate_merkle_root() == self.header.merkle_root
    }
}

/// Bitcoin merkle root; odd levels duplicate their last hash.
pub fn merkle_root(mut level: Vec<Hash>) -> Hash {
    if level.is_empty() {
        return Hash::ZERO;
    }
    while level.len() > 1 {
        if level.len() % 2 == 1 {
            if let Some(last) = level.last().copied() {
                level.push(last);
            }
        }
        level = level
            .chunks(2)
            .map(|pair| {
                let mut concatenated = [0u8; 64];
                concatenated[..32].copy_from_slice(pair[0].as_bytes());
                concatenated[32..].copy_from_slice(pair[1].as_bytes());
                Hash::double_sha256(&concatenated)
            })
            .collect();
    }
    level[0]
}

/// Cumulative proof-of-work
///
/// Held as `u128`, which covers every target with an exponent of 0x14 or
/// more; harder targets saturate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct ChainWork(u128);

impl ChainWork {
    pub const ZERO: ChainWork = ChainWork(0);

    pub fn new(value: u128) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u128 {
        self.0
    }

    /// Expected hashes for one block at the given compact target,
    /// approximately 2^256 / (target + 1).
    pub fn from_compact_bits(bits: u32) -> Self {
        let exponent = (bits >> 24) as i32;
        let mantissa = bits & 0x007f_ffff;
        let negative = bits & 0x0080_0000 != 0;
        if mantissa == 0 || negative {
            return Self::ZERO;
        }
        // target = mantissa * 2^(8 * (exponent - 3))
        let shift = 256 - 8 * (exponent - 3);
        if shift < 0 {
            return Self::ZERO;
        }
        if shift >= 128 {
            return Self(u128::MAX);
        }
        Self((1u128 << shift) / u128::from(mantissa))
    }

    pub fn saturating_add(self, other: ChainWork) -> ChainWork {
        ChainWork(self.0.saturating_add(other.0))
    }
}
