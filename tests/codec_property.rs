use proptest::prelude::*;

use bitseg_node::network::cursor::variable_length_integer_size;
use bitseg_node::network::message::{InventoryMessage, PingMessage};
use bitseg_node::network::{
    ByteBuilder, ByteCursor, Endian, InventoryItem, InventoryItemType, ProtocolMessage, WireMessage,
};
use bitseg_node::primitives::Hash;

const MAGIC: [u8; 4] = [0xfa, 0xbf, 0xb5, 0xda];

fn item_strategy() -> impl Strategy<Value = InventoryItem> {
    (any::<u32>(), any::<[u8; 32]>())
        .prop_map(|(kind, hash)| InventoryItem::new(InventoryItemType::from_u32(kind), Hash::new(hash)))
}

proptest! {
    #[test]
    fn compact_size_round_trips_with_minimal_width(value in any::<u64>()) {
        let mut builder = ByteBuilder::new();
        builder.append_variable_length_integer(value);
        let bytes = builder.build();
        prop_assert_eq!(bytes.len(), variable_length_integer_size(value));

        let mut cursor = ByteCursor::new(&bytes);
        prop_assert_eq!(cursor.read_variable_length_integer(), value);
        prop_assert!(!cursor.did_overflow());
        prop_assert_eq!(cursor.remaining_byte_count(), 0);
    }

    #[test]
    fn over_reads_never_panic(bytes in proptest::collection::vec(any::<u8>(), 0..64), width in 0usize..128) {
        let mut cursor = ByteCursor::new(&bytes);
        let read = cursor.read_bytes(width, Endian::Little);
        prop_assert_eq!(read.len(), width);
        prop_assert_eq!(cursor.did_overflow(), width > bytes.len());
        if cursor.did_overflow() {
            prop_assert!(read.iter().all(|byte| *byte == 0));
            prop_assert_eq!(cursor.remaining_byte_count(), 0);
            cursor.read_variable_length_bytes();
            prop_assert!(cursor.did_overflow());
        }
    }

    #[test]
    fn arbitrary_bytes_never_panic(bytes in proptest::collection::vec(any::<u8>(), 0..512)) {
        let _ = ProtocolMessage::decode(&bytes, MAGIC);
        let mut framed = MAGIC.to_vec();
        framed.extend_from_slice(&bytes);
        let _ = ProtocolMessage::decode(&framed, MAGIC);
    }

    #[test]
    fn ping_round_trips(nonce in any::<u64>()) {
        let encoded = PingMessage::with_nonce(nonce).encode(MAGIC);
        let decoded = PingMessage::decode(&encoded, MAGIC).unwrap().unwrap();
        prop_assert_eq!(decoded.nonce, nonce);
    }

    #[test]
    fn inventory_round_trips(items in proptest::collection::vec(item_strategy(), 0..40)) {
        let message = InventoryMessage::with_items(items.clone());
        let encoded = message.encode(MAGIC);
        let decoded = InventoryMessage::decode(&encoded, MAGIC).unwrap().unwrap();
        prop_assert_eq!(decoded.items(), items.as_slice());
    }
}
