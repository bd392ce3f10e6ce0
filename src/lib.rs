//! A BitTorrent client library: metainfo parsing, tracker announces, the
//! peer wire protocol and a piece-exchange engine that downloads into
//! segmented file storage.

pub mod bencode;
pub mod cli;
pub mod client;
pub mod error;
pub mod peer;
pub mod piece;
pub mod session;
pub mod storage;
pub mod swarm;
pub mod torrent;
pub mod tracker;
pub mod wire;
