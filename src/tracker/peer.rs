use std::net::{IpAddr, Ipv4Addr, SocketAddr};

/// A peer as announced by the tracker. The peer id is only present in the
/// dictionary response model; compact responses carry address and port only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerInfo {
    pub addr: SocketAddr,
    pub peer_id: Option<[u8; 20]>,
}

impl PeerInfo {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self {
            addr: SocketAddr::new(ip, port),
            peer_id: None,
        }
    }

    pub fn with_peer_id(ip: IpAddr, port: u16, peer_id: [u8; 20]) -> Self {
        Self {
            addr: SocketAddr::new(ip, port),
            peer_id: Some(peer_id),
        }
    }

    /// One compact-format entry: 4 bytes IPv4 followed by a big-endian port.
    pub fn from_compact(data: &[u8]) -> Option<Self> {
        if data.len() != 6 {
            return None;
        }
        let ip = Ipv4Addr::new(data[0], data[1], data[2], data[3]);
        let port = u16::from_be_bytes([data[4], data[5]]);
        Some(Self::new(IpAddr::V4(ip), port))
    }

    pub fn from_compact_list(data: &[u8]) -> Vec<Self> {
        data.chunks_exact(6).filter_map(Self::from_compact).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compact_entries_decode_address_and_port() {
        let peers = PeerInfo::from_compact_list(&[127, 0, 0, 1, 0x1A, 0xE1, 10, 0, 0, 2, 0, 80]);
        assert_eq!(peers.len(), 2);
        assert_eq!(peers[0].addr, "127.0.0.1:6881".parse().unwrap());
        assert_eq!(peers[1].addr, "10.0.0.2:80".parse().unwrap());
        assert_eq!(peers[0].peer_id, None);
    }

    #[test]
    fn trailing_partial_entry_is_dropped() {
        let peers = PeerInfo::from_compact_list(&[127, 0, 0, 1, 0x1A, 0xE1, 10, 0]);
        assert_eq!(peers.len(), 1);
    }
}
