//! Torrent metadata: `.torrent` parsing and the immutable descriptor the
//! rest of the engine works against.

mod descriptor;
mod hashes;
mod metainfo;

pub use descriptor::TorrentDescriptor;
pub use hashes::{PieceHash, PieceHashes};
pub use metainfo::{FileInfo, Metainfo, TorrentInfo};

use std::path::Path;

use tokio::fs;

use crate::bencode;
use crate::error::Result;

/// Load and parse a `.torrent` file.
pub async fn load_torrent_file<P: AsRef<Path>>(path: P) -> Result<Metainfo> {
    let data = fs::read(path).await?;
    parse_torrent(&data)
}

pub fn parse_torrent(data: &[u8]) -> Result<Metainfo> {
    let value = bencode::decode(data)?;
    Metainfo::from_bencode(&value)
}
