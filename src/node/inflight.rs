//! In-flight data requests
//!
//! One claim per inventory hash. A claim remembers which node was asked,
//! when, and whether it has already been re-requested after a timeout.

use std::collections::{BTreeSet, HashMap};
use std::time::{Duration, Instant};

use tracing::trace;

use crate::network::InventoryItem;
use crate::primitives::{Hash, NodeId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InFlightRequest {
    pub item: InventoryItem,
    pub node: NodeId,
    pub requested_at: Instant,
    pub retried: bool,
}

#[derive(Debug)]
pub struct InFlightRequests {
    requests: HashMap<Hash, InFlightRequest>,
    by_node: HashMap<NodeId, BTreeSet<Hash>>,
    max_per_node: usize,
}

impl InFlightRequests {
    pub fn new(max_per_node: usize) -> Self {
        Self {
            requests: HashMap::new(),
            by_node: HashMap::new(),
            max_per_node: max_per_node.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn is_in_flight(&self, hash: &Hash) -> bool {
        self.requests.contains_key(hash)
    }

    pub fn get(&self, hash: &Hash) -> Option<&InFlightRequest> {
        self.requests.get(hash)
    }

    pub fn count_for(&self, node: NodeId) -> usize {
        self.by_node.get(&node).map(BTreeSet::len).unwrap_or(0)
    }

    pub fn has_capacity(&self, node: NodeId) -> bool {
        self.count_for(node) < self.max_per_node
    }

    /// Record a request to `node`. Returns false when the item is already
    /// claimed or the node is at its limit.
    pub fn claim(&mut self, item: InventoryItem, node: NodeId, now: Instant) -> bool {
        if self.requests.contains_key(&item.hash) || !self.has_capacity(node) {
            return false;
        }
        self.by_node.entry(node).or_default().insert(item.hash);
        self.requests.insert(
            item.hash,
            InFlightRequest {
                item,
                node,
                requested_at: now,
                retried: false,
            },
        );
        true
    }

    /// Move an existing claim to `node` and mark it retried.
    pub fn reassign(&mut self, hash: &Hash, node: NodeId, now: Instant) -> bool {
        let previous = match self.requests.get_mut(hash) {
            Some(request) => {
                let previous = request.node;
                request.node = node;
                request.requested_at = now;
                request.retried = true;
                previous
            }
            None => return false,
        };
        self.detach(previous, hash);
        self.by_node.entry(node).or_default().insert(*hash);
        trace!("Reassigned {} from node {} to node {}", hash, previous, node);
        true
    }

    pub fn release(&mut self, hash: &Hash) -> Option<InFlightRequest> {
        let request = self.requests.remove(hash)?;
        self.detach(request.node, hash);
        Some(request)
    }

    /// Drop every claim held by `node`.
    pub fn release_node(&mut self, node: NodeId) -> Vec<InFlightRequest> {
        let hashes = self.by_node.remove(&node).unwrap_or_default();
        hashes
            .iter()
            .filter_map(|hash| self.requests.remove(hash))
            .collect()
    }

    /// Claims older than `timeout`, oldest first
    pub fn expired(&self, now: Instant, timeout: Duration) -> Vec<InFlightRequest> {
        let mut expired: Vec<InFlightRequest> = self
            .requests
            .values()
            .filter(|request| now.saturating_duration_since(request.requested_at) >= timeout)
            .cloned()
            .collect();
        expired.sort_by_key(|request| request.requested_at);
        expired
    }

    fn detach(&mut self, node: NodeId, hash: &Hash) {
        if let Some(hashes) = self.by_node.get_mut(&node) {
            hashes.remove(hash);
            if hashes.is_empty() {
                self.by_node.remove(&node);
            }
        }
    }
}
