#![no_main]
use bitseg_node::network::{Network, ProtocolMessage};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let magic = Network::Mainnet.magic();

    // Malformed input must come back as an error, never a panic
    if let Ok(Some(message)) = ProtocolMessage::decode(data, magic) {
        let encoded = ProtocolMessage::encode(&message, magic);
        let _round_trip = ProtocolMessage::decode(&encoded, magic);
    }

    // Truncations of a framed message
    for cut in [12usize, 24, data.len() / 2] {
        if cut < data.len() {
            let _ = ProtocolMessage::decode(&data[..cut], magic);
        }
    }

    // Corrupted checksum and oversized length
    if data.len() >= 24 {
        let mut corrupted = data.to_vec();
        corrupted[20] = !corrupted[20];
        let _ = ProtocolMessage::decode(&corrupted, magic);

        let max_payload = (32 * 1024 * 1024 - 24 + 1) as u32;
        corrupted[16..20].copy_from_slice(&max_payload.to_le_bytes());
        let _ = ProtocolMessage::decode(&corrupted, magic);
    }
});
