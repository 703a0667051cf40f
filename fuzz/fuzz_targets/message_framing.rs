#![no_main]
use bitseg_node::network::{MessageCodec, Network};
use bytes::BytesMut;
use libfuzzer_sys::fuzz_target;
use tokio_util::codec::Decoder;

fuzz_target!(|data: &[u8]| {
    let mut codec = MessageCodec::new(Network::Mainnet.magic());
    let mut src = BytesMut::from(data);

    // The decoder must always consume or wait, never spin or panic
    let mut rounds = 0usize;
    loop {
        let before = src.len();
        match codec.decode(&mut src) {
            Ok(Some(_)) => {}
            Ok(None) | Err(_) => break,
        }
        assert!(src.len() < before);
        rounds += 1;
        if rounds > data.len() {
            break;
        }
    }
});
