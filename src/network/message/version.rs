//! version / verack handshake messages

use crate::network::cursor::{ByteBuilder, ByteCursor, Endian};
use crate::network::protocol::{CachedPayload, CodecResult, Command, WireMessage, PROTOCOL_VERSION};
use crate::utils::current_timestamp;
use bytes::Bytes;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};

/// Service flags (bitfield in Version.services)
pub const NODE_NETWORK: u64 = 1;
pub const NODE_BLOOM: u64 = 1 << 2;
pub const NODE_WITNESS: u64 = 1 << 3;
pub const NODE_NETWORK_LIMITED: u64 = 1 << 10;

/// Default user agent
pub const USER_AGENT: &str = concat!("/bitseg:", env!("CARGO_PKG_VERSION"), "/");

/// Serialized size of an address without its timestamp
pub const NETWORK_ADDRESS_BYTE_COUNT: usize = 26;

/// Peer address as carried in version messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NetworkAddress {
    pub services: u64,
    /// IPv6, or IPv4-mapped IPv6
    pub ip: [u8; 16],
    pub port: u16,
}

impl NetworkAddress {
    pub fn unspecified() -> Self {
        Self {
            services: 0,
            ip: [0u8; 16],
            port: 0,
        }
    }

    pub fn from_socket_addr(addr: SocketAddr, services: u64) -> Self {
        let ip = match addr.ip() {
            IpAddr::V4(v4) => v4.to_ipv6_mapped().octets(),
            IpAddr::V6(v6) => v6.octets(),
        };
        Self {
            services,
            ip,
            port: addr.port(),
        }
    }

    pub fn to_socket_addr(&self) -> SocketAddr {
        let v6 = Ipv6Addr::from(self.ip);
        let ip = match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        };
        SocketAddr::new(ip, self.port)
    }

    pub fn read_from(cursor: &mut ByteCursor<'_>) -> Self {
        let services = cursor.read_u64(Endian::Little);
        let mut ip = [0u8; 16];
        ip.copy_from_slice(&cursor.read_bytes(16, Endian::Big));
        let port = cursor.read_u16(Endian::Big);
        Self { services, ip, port }
    }

    pub fn write_to(&self, builder: &mut ByteBuilder) {
        builder
            .append_u64(self.services, Endian::Little)
            .append_bytes(&self.ip, Endian::Big)
            .append_u16(self.port, Endian::Big);
    }
}

impl Default for NetworkAddress {
    fn default() -> Self {
        Self::unspecified()
    }
}

/// Opening handshake message
///
/// Fields are private so that every change goes through a setter that
/// drops the cached payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionMessage {
    version: i32,
    services: u64,
    timestamp: i64,
    remote_address: NetworkAddress,
    local_address: NetworkAddress,
    nonce: u64,
    user_agent: String,
    start_height: i32,
    relay: bool,
    cache: CachedPayload,
}

impl VersionMessage {
    /// Version message from this node with a fresh nonce and timestamp
    pub fn new(services: u64, start_height: i32) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            services,
            timestamp: current_timestamp() as i64,
            remote_address: NetworkAddress::unspecified(),
            local_address: NetworkAddress::unspecified(),
            nonce: rand::random(),
            user_agent: USER_AGENT.to_string(),
            start_height,
            relay: true,
            cache: CachedPayload::new(),
        }
    }

    pub fn version(&self) -> i32 {
        self.version
    }

    pub fn services(&self) -> u64 {
        self.services
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn remote_address(&self) -> &NetworkAddress {
        &self.remote_address
    }

    pub fn local_address(&self) -> &NetworkAddress {
        &self.local_address
    }

    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    pub fn start_height(&self) -> i32 {
        self.start_height
    }

    pub fn relay(&self) -> bool {
        self.relay
    }

    pub fn set_remote_address(&mut self, address: NetworkAddress) {
        self.remote_address = address;
        self.cache.invalidate();
    }

    pub fn set_local_address(&mut self, address: NetworkAddress) {
        self.local_address = address;
        self.cache.invalidate();
    }

    pub fn set_services(&mut self, services: u64) {
        self.services = services;
        self.cache.invalidate();
    }

    pub fn set_timestamp(&mut self, timestamp: i64) {
        self.timestamp = timestamp;
        self.cache.invalidate();
    }

    pub fn set_nonce(&mut self, nonce: u64) {
        self.nonce = nonce;
        self.cache.invalidate();
    }

    pub fn set_user_agent(&mut self, user_agent: impl Into<String>) {
        self.user_agent = user_agent.into();
        self.cache.invalidate();
    }

    pub fn set_start_height(&mut self, start_height: i32) {
        self.start_height = start_height;
        self.cache.invalidate();
    }

    pub fn set_relay(&mut self, relay: bool) {
        self.relay = relay;
        self.cache.invalidate();
    }

    pub fn has_service(&self, flag: u64) -> bool {
        self.services & flag == flag
    }
}

impl WireMessage for VersionMessage {
    const COMMAND: Command = Command::Version;

    fn parse_payload(cursor: &mut ByteCursor<'_>) -> CodecResult<Self> {
        let version = cursor.read_i32(Endian::Little);
        let services = cursor.read_u64(Endian::Little);
        let timestamp = cursor.read_i64(Endian::Little);
        let remote_address = NetworkAddress::read_from(cursor);
        let local_address = NetworkAddress::read_from(cursor);
        let nonce = cursor.read_u64(Endian::Little);
        let user_agent = cursor.read_variable_length_string();
        let start_height = cursor.read_i32(Endian::Little);
        // Peers older than BIP37 omit the relay flag
        let relay = if cursor.remaining_byte_count() == 0 {
            true
        } else {
            cursor.read_bool()
        };
        Ok(Self {
            version,
            services,
            timestamp,
            remote_address,
            local_address,
            nonce,
            user_agent,
            start_height,
            relay,
            cache: CachedPayload::new(),
        })
    }

    fn payload(&self) -> Bytes {
        self.cache.get_or_build(|| {
            let mut builder = ByteBuilder::with_capacity(86 + self.user_agent.len());
            builder
                .append_i32(self.version, Endian::Little)
                .append_u64(self.services, Endian::Little)
                .append_i64(self.timestamp, Endian::Little);
            self.remote_address.write_to(&mut builder);
            self.local_address.write_to(&mut builder);
            builder
                .append_u64(self.nonce, Endian::Little)
                .append_variable_length_string(&self.user_agent)
                .append_i32(self.start_height, Endian::Little)
                .append_bool(self.relay);
            builder.build()
        })
    }
}

/// Handshake acknowledgement (empty payload)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VerackMessage;

impl WireMessage for VerackMessage {
    const COMMAND: Command = Command::Verack;

    fn parse_payload(_cursor: &mut ByteCursor<'_>) -> CodecResult<Self> {
        Ok(VerackMessage)
    }

    fn payload(&self) -> Bytes {
        Bytes::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::protocol::BITCOIN_MAGIC_MAINNET;

    #[test]
    fn test_network_address_ipv4_mapping() {
        let addr: SocketAddr = "192.168.1.1:8333".parse().unwrap();
        let network_address = NetworkAddress::from_socket_addr(addr, NODE_NETWORK);

        let mut builder = ByteBuilder::new();
        network_address.write_to(&mut builder);
        let bytes = builder.build();
        assert_eq!(bytes.len(), NETWORK_ADDRESS_BYTE_COUNT);
        assert_eq!(&bytes[..8], &[1, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(&bytes[18..26], &[0xff, 0xff, 0xc0, 0xa8, 0x01, 0x01, 0x20, 0x8d]);
        assert_eq!(network_address.to_socket_addr(), addr);
    }

    #[test]
    fn test_remote_address_change_reserializes() {
        let mut message = VersionMessage::new(NODE_NETWORK, 0);
        let before = message.encode(BITCOIN_MAGIC_MAINNET);

        let remote: SocketAddr = "10.0.0.7:18444".parse().unwrap();
        message.set_remote_address(NetworkAddress::from_socket_addr(remote, NODE_NETWORK));
        let after = message.encode(BITCOIN_MAGIC_MAINNET);
        assert_ne!(before, after);

        let decoded = VersionMessage::decode(&after, BITCOIN_MAGIC_MAINNET).unwrap().unwrap();
        assert_eq!(decoded.remote_address().to_socket_addr(), remote);
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_missing_relay_flag_defaults_to_true() {
        let mut message = VersionMessage::new(NODE_NETWORK, 5);
        message.set_relay(false);
        let payload = message.payload();
        let truncated = &payload[..payload.len() - 1];

        let mut cursor = ByteCursor::new(truncated);
        let parsed = VersionMessage::parse_payload(&mut cursor).unwrap();
        assert!(!cursor.did_overflow());
        assert!(parsed.relay());
        assert_eq!(parsed.start_height(), 5);
    }

    #[test]
    fn test_verack_is_empty() {
        let encoded = VerackMessage.encode(BITCOIN_MAGIC_MAINNET);
        assert_eq!(encoded.len(), 24);
        assert!(VerackMessage::decode(&encoded, BITCOIN_MAGIC_MAINNET).unwrap().is_some());
    }
}
