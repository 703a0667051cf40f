//! Bitseg Node - Bitcoin P2P node core
//!
//! Wire codec, nested-set chain segments, pending download queues and the
//! coordinator that ties them to connected peers.
//!
//! ## Layout
//!
//! 1. `primitives`: hashes, blocks, transactions, typed identifiers
//! 2. `network`: byte cursor, message codec, stream framing, peer connections
//! 3. `storage`: chain segment tree, pending stores, block queue, block store
//! 4. `node`: synchronization coordinator and in-flight tracking

// Memory allocator optimization using mimalloc (faster than default allocator)
#[cfg(not(target_os = "windows"))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

pub mod config;
pub mod network;
pub mod node;
pub mod primitives;
pub mod storage;
pub mod utils;

pub use config::{LoggingConfig, NodeConfig, SyncConfig};
pub use primitives::{Block, BlockHeader, Hash, Transaction};
