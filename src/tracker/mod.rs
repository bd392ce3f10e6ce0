//! HTTP tracker announces: building the announce URL, decoding compact and
//! dictionary peer lists, and the periodic re-announce loop's request types.

mod client;
mod peer;
mod request;
mod response;

pub use client::TrackerClient;
pub use peer::PeerInfo;
pub use request::{AnnounceEvent, AnnounceRequest};
pub use response::AnnounceResponse;

use rand::Rng;

/// Generate an Azureus-style peer id: `-BW0001-` plus twelve random
/// printable bytes.
pub fn generate_peer_id() -> [u8; 20] {
    let mut peer_id = [0u8; 20];
    peer_id[0..8].copy_from_slice(b"-BW0001-");
    let mut rng = rand::thread_rng();
    for byte in &mut peer_id[8..] {
        *byte = rng.gen_range(b'0'..=b'z');
    }
    peer_id
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_id_has_client_prefix() {
        let peer_id = generate_peer_id();
        assert_eq!(&peer_id[0..8], b"-BW0001-");
        assert!(peer_id[8..].iter().all(|b| (b'0'..=b'z').contains(b)));
    }
}
