//! block / tx / headers messages

use crate::network::cursor::{ByteBuilder, ByteCursor};
use crate::network::protocol::{CachedPayload, CodecError, CodecResult, Command, WireMessage};
use crate::primitives::transaction::bounded_capacity;
use crate::primitives::{Block, BlockHeader, Transaction, BLOCK_HEADER_BYTE_COUNT};
use bytes::Bytes;

/// Maximum headers per headers message
pub const MAX_HEADERS_COUNT: u64 = 2000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockMessage {
    block: Block,
    cache: CachedPayload,
}

impl BlockMessage {
    pub fn new(block: Block) -> Self {
        Self {
            block,
            cache: CachedPayload::new(),
        }
    }

    pub fn block(&self) -> &Block {
        &self.block
    }

    pub fn into_block(self) -> Block {
        self.block
    }

    pub fn set_block(&mut self, block: Block) {
        self.block = block;
        self.cache.invalidate();
    }
}

impl WireMessage for BlockMessage {
    const COMMAND: Command = Command::Block;

    fn parse_payload(cursor: &mut ByteCursor<'_>) -> CodecResult<Self> {
        Ok(Self::new(Block::read_from(cursor)))
    }

    fn payload(&self) -> Bytes {
        self.cache.get_or_build(|| self.block.to_bytes())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionMessage {
    transaction: Transaction,
    cache: CachedPayload,
}

impl TransactionMessage {
    pub fn new(transaction: Transaction) -> Self {
        Self {
            transaction,
            cache: CachedPayload::new(),
        }
    }

    pub fn transaction(&self) -> &Transaction {
        &self.transaction
    }

    pub fn into_transaction(self) -> Transaction {
        self.transaction
    }
}

impl WireMessage for TransactionMessage {
    const COMMAND: Command = Command::Transaction;

    fn parse_payload(cursor: &mut ByteCursor<'_>) -> CodecResult<Self> {
        Ok(Self::new(Transaction::read_from(cursor)))
    }

    fn payload(&self) -> Bytes {
        self.cache.get_or_build(|| self.transaction.to_bytes())
    }
}

/// Block headers, each followed by an (always zero) transaction count
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeadersMessage {
    headers: Vec<BlockHeader>,
    cache: CachedPayload,
}

impl HeadersMessage {
    pub fn new(headers: Vec<BlockHeader>) -> Self {
        Self {
            headers,
            cache: CachedPayload::new(),
        }
    }

    pub fn headers(&self) -> &[BlockHeader] {
        &self.headers
    }

    pub fn add_header(&mut self, header: BlockHeader) {
        self.headers.push(header);
        self.cache.invalidate();
    }
}

impl WireMessage for HeadersMessage {
    const COMMAND: Command = Command::Headers;

    fn parse_payload(cursor: &mut ByteCursor<'_>) -> CodecResult<Self> {
        let count = cursor.read_variable_length_integer();
        if count > MAX_HEADERS_COUNT {
            return Err(CodecError::CountExceeded {
                command: Self::COMMAND.as_str(),
                count,
                max: MAX_HEADERS_COUNT,
            });
        }
        let mut headers = Vec::with_capacity(bounded_capacity(count, cursor) / BLOCK_HEADER_BYTE_COUNT);
        for _ in 0..count {
            if cursor.did_overflow() {
                break;
            }
            headers.push(BlockHeader::read_from(cursor));
            let transaction_count = cursor.read_variable_length_integer();
            if transaction_count != 0 && !cursor.did_overflow() {
                return Err(CodecError::InvalidPayload {
                    command: Self::COMMAND.as_str(),
                    reason: format!("header carries transaction count {}", transaction_count),
                });
            }
        }
        Ok(Self::new(headers))
    }

    fn payload(&self) -> Bytes {
        self.cache.get_or_build(|| {
            let mut builder =
                ByteBuilder::with_capacity(3 + self.headers.len() * (BLOCK_HEADER_BYTE_COUNT + 1));
            builder.append_variable_length_integer(self.headers.len() as u64);
            for header in &self.headers {
                header.write_to(&mut builder);
                builder.append_variable_length_integer(0);
            }
            builder.build()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::protocol::BITCOIN_MAGIC_REGTEST;
    use crate::primitives::Hash;

    fn header(nonce: u32) -> BlockHeader {
        BlockHeader {
            version: 1,
            previous_block_hash: Hash::new([1; 32]),
            merkle_root: Hash::new([2; 32]),
            timestamp: 1_600_000_000,
            bits: 0x207f_ffff,
            nonce,
        }
    }

    #[test]
    fn test_headers_payload_has_zero_tx_counts() {
        let message = HeadersMessage::new(vec![header(1), header(2)]);
        let payload = message.payload();
        assert_eq!(payload.len(), 1 + 2 * 81);
        assert_eq!(payload[81], 0);
        assert_eq!(payload[162], 0);

        let encoded = message.encode(BITCOIN_MAGIC_REGTEST);
        let decoded = HeadersMessage::decode(&encoded, BITCOIN_MAGIC_REGTEST).unwrap().unwrap();
        assert_eq!(decoded.headers(), message.headers());
    }

    #[test]
    fn test_headers_with_transactions_rejected() {
        let mut builder = ByteBuilder::new();
        builder.append_variable_length_integer(1);
        header(3).write_to(&mut builder);
        builder.append_variable_length_integer(4);
        let bytes = builder.build();
        let mut cursor = ByteCursor::new(&bytes);
        assert!(matches!(
            HeadersMessage::parse_payload(&mut cursor),
            Err(CodecError::InvalidPayload { .. })
        ));
    }
}
