//! Inventory item model
//!
//! Inventory items announce ("what I have") and request ("what I want")
//! blocks and transactions. Equality and hashing are structural over the
//! (type, hash) pair so item sets deduplicate across peers.

use crate::network::cursor::{ByteBuilder, ByteCursor, Endian};
use crate::primitives::Hash;
use serde::{Deserialize, Serialize};

/// Inventory types
pub const MSG_ERROR: u32 = 0;
pub const MSG_TX: u32 = 1;
pub const MSG_BLOCK: u32 = 2;
pub const MSG_FILTERED_BLOCK: u32 = 3;
pub const MSG_CMPCT_BLOCK: u32 = 4;

/// Serialized size of one inventory item
pub const INVENTORY_ITEM_BYTE_COUNT: usize = 36;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InventoryItemType {
    Error,
    Transaction,
    Block,
    MerkleBlock,
    CompactBlock,
    /// Unrecognised discriminant, preserved for re-serialization
    Unknown(u32),
}

impl InventoryItemType {
    pub fn from_u32(value: u32) -> Self {
        match value {
            MSG_ERROR => InventoryItemType::Error,
            MSG_TX => InventoryItemType::Transaction,
            MSG_BLOCK => InventoryItemType::Block,
            MSG_FILTERED_BLOCK => InventoryItemType::MerkleBlock,
            MSG_CMPCT_BLOCK => InventoryItemType::CompactBlock,
            other => InventoryItemType::Unknown(other),
        }
    }

    pub fn as_u32(&self) -> u32 {
        match self {
            InventoryItemType::Error => MSG_ERROR,
            InventoryItemType::Transaction => MSG_TX,
            InventoryItemType::Block => MSG_BLOCK,
            InventoryItemType::MerkleBlock => MSG_FILTERED_BLOCK,
            InventoryItemType::CompactBlock => MSG_CMPCT_BLOCK,
            InventoryItemType::Unknown(value) => *value,
        }
    }

    /// Block-like types that the sync pipeline downloads as full blocks
    pub fn is_block(&self) -> bool {
        matches!(
            self,
            InventoryItemType::Block | InventoryItemType::MerkleBlock | InventoryItemType::CompactBlock
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InventoryItem {
    pub item_type: InventoryItemType,
    pub hash: Hash,
}

impl InventoryItem {
    pub fn new(item_type: InventoryItemType, hash: Hash) -> Self {
        Self { item_type, hash }
    }

    pub fn block(hash: Hash) -> Self {
        Self::new(InventoryItemType::Block, hash)
    }

    pub fn transaction(hash: Hash) -> Self {
        Self::new(InventoryItemType::Transaction, hash)
    }

    pub fn read_from(cursor: &mut ByteCursor<'_>) -> Self {
        let item_type = InventoryItemType::from_u32(cursor.read_u32(Endian::Little));
        let hash = cursor.read_hash();
        Self { item_type, hash }
    }

    pub fn write_to(&self, builder: &mut ByteBuilder) {
        builder
            .append_u32(self.item_type.as_u32(), Endian::Little)
            .append_hash(&self.hash);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_structural_equality() {
        let hash = Hash::new([0x42; 32]);
        let first = InventoryItem::block(hash);
        let second = InventoryItem::block(hash);
        let transaction = InventoryItem::transaction(hash);

        assert_eq!(first, second);
        assert_ne!(first, transaction);

        let set: HashSet<InventoryItem> = [first, second, transaction].into_iter().collect();
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_unknown_type_preserved() {
        let item = InventoryItem::new(InventoryItemType::from_u32(0x4000_0001), Hash::ZERO);
        let mut builder = ByteBuilder::new();
        item.write_to(&mut builder);
        let bytes = builder.build();
        assert_eq!(bytes.len(), INVENTORY_ITEM_BYTE_COUNT);

        let mut cursor = ByteCursor::new(&bytes);
        assert_eq!(InventoryItem::read_from(&mut cursor), item);
    }
}
