#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;

use bitseg_node::network::{Network, PeerTransport, ProtocolMessage};
use bitseg_node::node::Clock;
use bitseg_node::primitives::block::merkle_root;
use bitseg_node::primitives::{
    Block, BlockHeader, Hash, NodeId, OutPoint, Transaction, TransactionInput, TransactionOutput,
};

pub const EASY_BITS: u32 = 0x207f_ffff;

pub fn node(value: i64) -> NodeId {
    NodeId::wrap(value).unwrap()
}

pub fn genesis() -> BlockHeader {
    Network::Regtest.genesis_header()
}

pub fn coinbase(tag: u8) -> Transaction {
    Transaction {
        version: 1,
        inputs: vec![TransactionInput {
            previous_output: OutPoint {
                hash: Hash::ZERO,
                index: u32::MAX,
            },
            script_sig: vec![tag, 0x51],
            sequence: u32::MAX,
        }],
        outputs: vec![TransactionOutput {
            value: 50_0000_0000,
            script_pubkey: vec![0x51],
        }],
        lock_time: 0,
    }
}

/// Block on `previous` with a single coinbase and a valid merkle root
pub fn block_on(previous: Hash, tag: u8, timestamp: u32) -> Block {
    let transactions = vec![coinbase(tag)];
    let root = merkle_root(transactions.iter().map(Transaction::hash).collect());
    Block {
        header: BlockHeader {
            version: 1,
            previous_block_hash: previous,
            merkle_root: root,
            timestamp,
            bits: EASY_BITS,
            nonce: u32::from(tag),
        },
        transactions,
    }
}

/// `count` blocks extending `from`, timestamps increasing
pub fn chain_from(from: Hash, count: usize, first_tag: u8) -> Vec<Block> {
    let mut blocks = Vec::with_capacity(count);
    let mut previous = from;
    for i in 0..count {
        let block = block_on(previous, first_tag.wrapping_add(i as u8), 1_300_000_000 + i as u32);
        previous = block.hash();
        blocks.push(block);
    }
    blocks
}

/// Transport that records every message instead of sending it
#[derive(Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<(NodeId, ProtocolMessage)>>,
    disconnected: Mutex<Vec<NodeId>>,
}

impl RecordingTransport {
    /// Nodes whose connection handles were released
    pub fn disconnected(&self) -> Vec<NodeId> {
        self.disconnected.lock().unwrap().clone()
    }

    pub fn take(&self) -> Vec<(NodeId, ProtocolMessage)> {
        std::mem::take(&mut *self.sent.lock().unwrap())
    }

    /// Hashes requested with getdata, per destination, in send order
    pub fn take_requests(&self) -> Vec<(NodeId, Vec<Hash>)> {
        self.take()
            .into_iter()
            .filter_map(|(node, message)| match message {
                ProtocolMessage::GetData(get_data) => {
                    Some((node, get_data.items().iter().map(|item| item.hash).collect()))
                }
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl PeerTransport for RecordingTransport {
    async fn send(&self, node: NodeId, message: ProtocolMessage) -> Result<()> {
        self.sent.lock().unwrap().push((node, message));
        Ok(())
    }

    async fn disconnect(&self, node: NodeId) {
        self.disconnected.lock().unwrap().push(node);
    }
}

/// Manually advanced clock shared between the test and the coordinator
#[derive(Clone)]
pub struct TestClock {
    start: Instant,
    unix_start: u64,
    elapsed: Arc<Mutex<Duration>>,
}

impl TestClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            unix_start: 1_700_000_000,
            elapsed: Arc::new(Mutex::new(Duration::ZERO)),
        }
    }

    pub fn advance(&self, d: Duration) {
        *self.elapsed.lock().unwrap() += d;
    }
}

impl Clock for TestClock {
    fn now(&self) -> Instant {
        self.start + *self.elapsed.lock().unwrap()
    }

    fn unix_timestamp(&self) -> u64 {
        self.unix_start + self.elapsed.lock().unwrap().as_secs()
    }
}
