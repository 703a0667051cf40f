//! Stream framing for TCP peers
//!
//! Reassembles complete messages out of a byte stream and hands them to
//! [`ProtocolMessage::decode`]. Frames carrying commands this node does not
//! handle are consumed and skipped. Any framing error ends the stream, and
//! the peer task closes the connection.

use crate::network::protocol::{
    CodecError, MessageHeader, ProtocolMessage, MAX_PROTOCOL_MESSAGE_LENGTH,
};
use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

/// tokio-util codec for Bitcoin wire messages
#[derive(Debug, Clone)]
pub struct MessageCodec {
    magic: [u8; 4],
    max_size: usize,
}

impl MessageCodec {
    pub fn new(magic: [u8; 4]) -> Self {
        Self {
            magic,
            max_size: MAX_PROTOCOL_MESSAGE_LENGTH,
        }
    }

    pub fn with_max_size(magic: [u8; 4], max_size: usize) -> Self {
        Self {
            magic,
            max_size: max_size.min(MAX_PROTOCOL_MESSAGE_LENGTH),
        }
    }

    pub fn magic(&self) -> [u8; 4] {
        self.magic
    }
}

impl Decoder for MessageCodec {
    type Item = ProtocolMessage;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let Some(header) = MessageHeader::parse(&src[..])? else {
                return Ok(None);
            };
            header.ensure_magic(self.magic)?;
            let total_size = header.total_length();
            if total_size > self.max_size {
                return Err(CodecError::MessageTooLarge {
                    size: total_size,
                    max: self.max_size,
                });
            }

            if src.len() < total_size {
                src.reserve(total_size - src.len());
                return Ok(None);
            }

            let frame = src.split_to(total_size).freeze();
            match ProtocolMessage::decode(&frame, self.magic)? {
                Some(message) => return Ok(Some(message)),
                None => {
                    trace!("Skipped {} frame ({} bytes)", header.command, total_size);
                    continue;
                }
            }
        }
    }
}

impl Encoder<ProtocolMessage> for MessageCodec {
    type Error = CodecError;

    fn encode(&mut self, item: ProtocolMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let encoded = item.encode(self.magic);
        if encoded.len() > self.max_size {
            return Err(CodecError::MessageTooLarge {
                size: encoded.len(),
                max: self.max_size,
            });
        }
        dst.reserve(encoded.len());
        dst.extend_from_slice(&encoded);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::message::{PingMessage, VerackMessage};
    use crate::network::protocol::{seal, Command, BITCOIN_MAGIC_MAINNET, BITCOIN_MAGIC_TESTNET};

    const MAGIC: [u8; 4] = BITCOIN_MAGIC_MAINNET;

    #[test]
    fn test_reassembly_across_split_reads() {
        let mut codec = MessageCodec::new(MAGIC);
        let encoded = ProtocolMessage::Ping(PingMessage::with_nonce(42)).encode(MAGIC);

        let mut buffer = BytesMut::new();
        buffer.extend_from_slice(&encoded[..10]);
        assert!(codec.decode(&mut buffer).unwrap().is_none());
        buffer.extend_from_slice(&encoded[10..30]);
        assert!(codec.decode(&mut buffer).unwrap().is_none());
        buffer.extend_from_slice(&encoded[30..]);

        let message = codec.decode(&mut buffer).unwrap().unwrap();
        assert_eq!(message, ProtocolMessage::Ping(PingMessage::with_nonce(42)));
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_two_messages_in_one_read() {
        let mut codec = MessageCodec::new(MAGIC);
        let mut buffer = BytesMut::new();
        codec
            .encode(ProtocolMessage::Verack(VerackMessage), &mut buffer)
            .unwrap();
        codec
            .encode(ProtocolMessage::Ping(PingMessage::with_nonce(7)), &mut buffer)
            .unwrap();

        assert_eq!(
            codec.decode(&mut buffer).unwrap(),
            Some(ProtocolMessage::Verack(VerackMessage))
        );
        assert_eq!(
            codec.decode(&mut buffer).unwrap(),
            Some(ProtocolMessage::Ping(PingMessage::with_nonce(7)))
        );
        assert!(codec.decode(&mut buffer).unwrap().is_none());
    }

    #[test]
    fn test_unsupported_frame_skipped() {
        let mut codec = MessageCodec::new(MAGIC);
        let mut unsupported = seal(MAGIC, Command::Verack, &[]).to_vec();
        unsupported[4..16].copy_from_slice(b"sendheaders\0");

        let mut buffer = BytesMut::from(&unsupported[..]);
        buffer.extend_from_slice(&seal(MAGIC, Command::Ping, &9u64.to_le_bytes()));
        assert_eq!(
            codec.decode(&mut buffer).unwrap(),
            Some(ProtocolMessage::Ping(PingMessage::with_nonce(9)))
        );
    }

    #[test]
    fn test_wrong_network_is_error() {
        let mut codec = MessageCodec::new(MAGIC);
        let mut buffer = BytesMut::from(&seal(BITCOIN_MAGIC_TESTNET, Command::Verack, &[])[..]);
        assert!(matches!(
            codec.decode(&mut buffer),
            Err(CodecError::BadMagic { .. })
        ));
    }

    #[test]
    fn test_oversized_declaration_rejected_before_payload_arrives() {
        let mut codec = MessageCodec::with_max_size(MAGIC, 1024);
        let mut header = seal(MAGIC, Command::Block, &[]).to_vec();
        header[16..20].copy_from_slice(&4096u32.to_le_bytes());
        let mut buffer = BytesMut::from(&header[..]);
        assert!(matches!(
            codec.decode(&mut buffer),
            Err(CodecError::MessageTooLarge { .. })
        ));
    }
}
