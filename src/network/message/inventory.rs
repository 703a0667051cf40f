//! inv / getdata / notfound messages
//!
//! All three share one layout: a compact-size count followed by that many
//! inventory items.

use crate::network::cursor::{variable_length_integer_size, ByteBuilder, ByteCursor};
use crate::network::inventory::{InventoryItem, INVENTORY_ITEM_BYTE_COUNT};
use crate::network::protocol::{CachedPayload, CodecError, CodecResult, Command, WireMessage};
use crate::primitives::transaction::bounded_capacity;
use bytes::Bytes;

/// Inventory-style messages carry fewer than this many items
pub const MAX_INVENTORY_COUNT: u64 = 50_000;

fn parse_items(cursor: &mut ByteCursor<'_>, command: Command) -> CodecResult<Vec<InventoryItem>> {
    let count = cursor.read_variable_length_integer();
    if count >= MAX_INVENTORY_COUNT {
        return Err(CodecError::CountExceeded {
            command: command.as_str(),
            count,
            max: MAX_INVENTORY_COUNT,
        });
    }
    let mut items = Vec::with_capacity(bounded_capacity(count, cursor));
    for _ in 0..count {
        if cursor.did_overflow() {
            break;
        }
        items.push(InventoryItem::read_from(cursor));
    }
    Ok(items)
}

fn build_items(items: &[InventoryItem]) -> Vec<u8> {
    let count = items.len() as u64;
    let mut builder = ByteBuilder::with_capacity(
        variable_length_integer_size(count) + items.len() * INVENTORY_ITEM_BYTE_COUNT,
    );
    builder.append_variable_length_integer(count);
    for item in items {
        item.write_to(&mut builder);
    }
    builder.build()
}

macro_rules! inventory_message {
    ($(#[$meta:meta])* $name:ident, $command:expr) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Default, PartialEq, Eq)]
        pub struct $name {
            items: Vec<InventoryItem>,
            cache: CachedPayload,
        }

        impl $name {
            pub fn new() -> Self {
                Self::default()
            }

            pub fn with_items(items: Vec<InventoryItem>) -> Self {
                Self {
                    items,
                    cache: CachedPayload::new(),
                }
            }

            pub fn items(&self) -> &[InventoryItem] {
                &self.items
            }

            pub fn into_items(self) -> Vec<InventoryItem> {
                self.items
            }

            pub fn add_item(&mut self, item: InventoryItem) {
                self.items.push(item);
                self.cache.invalidate();
            }

            pub fn clear(&mut self) {
                self.items.clear();
                self.cache.invalidate();
            }

            pub fn len(&self) -> usize {
                self.items.len()
            }

            pub fn is_empty(&self) -> bool {
                self.items.is_empty()
            }

            pub fn is_payload_cached(&self) -> bool {
                self.cache.is_cached()
            }
        }

        impl WireMessage for $name {
            const COMMAND: Command = $command;

            fn parse_payload(cursor: &mut ByteCursor<'_>) -> CodecResult<Self> {
                Ok(Self::with_items(parse_items(cursor, Self::COMMAND)?))
            }

            fn payload(&self) -> Bytes {
                self.cache.get_or_build(|| build_items(&self.items))
            }
        }
    };
}

inventory_message!(
    /// Announcement of available blocks/transactions
    InventoryMessage,
    Command::Inventory
);
inventory_message!(
    /// Request for the data behind inventory items
    GetDataMessage,
    Command::GetData
);
inventory_message!(
    /// Reply listing requested items the peer does not have
    NotFoundMessage,
    Command::NotFound
);
