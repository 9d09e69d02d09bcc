//! Flow identity and correlation hashing
//!
//! Both directions of one TCP connection must map to the same 64-bit stream
//! id; that is what lets a response stream find the pending entry its request
//! stream created. The hash is computed over the connection's two endpoints
//! in sorted order, so (a -> b) and (b -> a) collapse to the same value.

use std::net::IpAddr;

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// One direction of a TCP connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
}

impl FlowKey {
    /// The opposite direction of the same connection.
    pub fn reversed(&self) -> FlowKey {
        FlowKey {
            src_ip: self.dst_ip,
            dst_ip: self.src_ip,
            src_port: self.dst_port,
            dst_port: self.src_port,
        }
    }

    /// True when this direction carries requests toward the captured service.
    pub fn is_incoming(&self, listen_port: u16) -> bool {
        self.dst_port == listen_port
    }

    /// Order-independent 64-bit hash of the transport flow.
    ///
    /// Equal for both directions of the same connection.
    pub fn stream_hash(&self) -> u64 {
        let a = (endpoint_bytes(self.src_ip), self.src_port);
        let b = (endpoint_bytes(self.dst_ip), self.dst_port);
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };

        let mut hash = FNV_OFFSET;
        for &byte in lo.0.iter().chain(hi.0.iter()) {
            hash = fnv_step(hash, byte);
        }
        for &byte in lo.1.to_be_bytes().iter().chain(hi.1.to_be_bytes().iter()) {
            hash = fnv_step(hash, byte);
        }
        hash
    }
}

impl std::fmt::Display for FlowKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{} -> {}:{}",
            self.src_ip, self.src_port, self.dst_ip, self.dst_port
        )
    }
}

fn endpoint_bytes(ip: IpAddr) -> [u8; 16] {
    match ip {
        IpAddr::V4(v4) => v4.to_ipv6_mapped().octets(),
        IpAddr::V6(v6) => v6.octets(),
    }
}

fn fnv_step(hash: u64, byte: u8) -> u64 {
    (hash ^ byte as u64).wrapping_mul(FNV_PRIME)
}

/// FNV-1a 32-bit, used by the consistent-sampling request limiters.
pub fn fnv1a32(data: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for &byte in data {
        hash = (hash ^ byte as u32).wrapping_mul(0x0100_0193);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(src: &str, sport: u16, dst: &str, dport: u16) -> FlowKey {
        FlowKey {
            src_ip: src.parse().unwrap(),
            dst_ip: dst.parse().unwrap(),
            src_port: sport,
            dst_port: dport,
        }
    }

    #[test]
    fn test_both_directions_hash_equal() {
        let forward = key("10.0.0.1", 43210, "10.0.0.2", 80);
        assert_eq!(forward.stream_hash(), forward.reversed().stream_hash());
    }

    #[test]
    fn test_distinct_connections_hash_differently() {
        let a = key("10.0.0.1", 43210, "10.0.0.2", 80);
        let b = key("10.0.0.1", 43211, "10.0.0.2", 80);
        assert_ne!(a.stream_hash(), b.stream_hash());
    }

    #[test]
    fn test_ipv6_flows() {
        let forward = key("2001:db8::1", 50000, "2001:db8::2", 8080);
        assert_eq!(forward.stream_hash(), forward.reversed().stream_hash());
    }

    #[test]
    fn test_direction_classification() {
        let incoming = key("10.0.0.1", 43210, "10.0.0.2", 80);
        assert!(incoming.is_incoming(80));
        assert!(!incoming.reversed().is_incoming(80));
    }

    #[test]
    fn test_fnv1a32_reference_values() {
        // Published FNV-1a test vectors
        assert_eq!(fnv1a32(b""), 0x811c_9dc5);
        assert_eq!(fnv1a32(b"a"), 0xe40c_292c);
        assert_eq!(fnv1a32(b"foobar"), 0xbf9c_f968);
    }
}
