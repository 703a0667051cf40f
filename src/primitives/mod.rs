//! Core value types: hashes, blocks, transactions and identifiers

pub mod block;
pub mod hash;
pub mod ids;
pub mod transaction;

pub use block::{Block, BlockHeader, ChainWork, BLOCK_HEADER_BYTE_COUNT};
pub use hash::Hash;
pub use ids::{
    AccountId, BlockId, IdSequence, NodeId, PendingBlockId, PendingTransactionId, SegmentId,
    SessionId, TransactionId, WorkerId,
};
pub use transaction::{OutPoint, Transaction, TransactionInput, TransactionOutput};
