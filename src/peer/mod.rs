//! Peer connections: the per-peer state machine, the bounded block-request
//! pipeline, and the reader/writer message pump.

mod connection;
mod download;
mod link;

pub use connection::{establish, Peer};
pub use download::PieceDownload;
pub use link::start_link;

/// Maximum number of in-flight block requests per peer.
pub const PIPELINE_CAPACITY: usize = 10;

/// Largest block a remote peer may request from us (128 KiB). Anything
/// bigger is treated as a protocol violation.
pub const MAX_REQUEST_SIZE: u32 = 128 * 1024;

/// The four BitTorrent flow-control flags for one connection. We start out
/// choking the peer and not interested, and assume the peer does the same.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerFlags {
    /// We are choking the peer.
    pub am_choking: bool,
    /// We are interested in the peer's pieces.
    pub am_interested: bool,
    /// The peer is choking us.
    pub peer_choking: bool,
    /// The peer is interested in our pieces.
    pub peer_interested: bool,
}

impl Default for PeerFlags {
    fn default() -> Self {
        Self {
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
        }
    }
}
