use sha1::{Digest, Sha1};

use super::PieceHashes;
use crate::bencode::{self, BencodeValue};
use crate::error::{Error, Result};

/// One file entry: path components relative to the torrent root, plus its
/// length in bytes.
#[derive(Debug, Clone)]
pub struct FileInfo {
    pub path: Vec<String>,
    pub length: u64,
}

/// Parsed info dictionary.
#[derive(Debug, Clone)]
pub struct TorrentInfo {
    /// Suggested file name (single-file) or directory name (multi-file).
    pub name: String,
    pub piece_length: u64,
    pub pieces: PieceHashes,
    pub files: Vec<FileInfo>,
    /// Whether the torrent came in multi-file form. Controls the on-disk
    /// layout: multi-file torrents materialize under a directory named
    /// after the torrent.
    pub multi_file: bool,
    pub total_length: u64,
}

impl TorrentInfo {
    fn parse(value: &BencodeValue) -> Result<Self> {
        let name = value
            .get_str(b"name")
            .ok_or_else(|| missing("name"))?
            .to_string();

        let piece_length = value.get_int(b"piece length").ok_or_else(|| missing("piece length"))?;
        if piece_length <= 0 {
            return Err(Error::InvalidTorrent("piece length must be positive".to_string()));
        }

        let pieces = PieceHashes::from_bytes(
            value.get(b"pieces").and_then(|v| v.as_bytes()).ok_or_else(|| missing("pieces"))?,
        )?;

        let (files, total_length, multi_file) = if let Some(length) = value.get_int(b"length") {
            // Single-file mode: one entry named after the torrent.
            let file = FileInfo {
                path: vec![name.clone()],
                length: length as u64,
            };
            (vec![file], length as u64, false)
        } else {
            let entries = value
                .get(b"files")
                .and_then(|v| v.as_list())
                .ok_or_else(|| missing("length or files"))?;

            let mut files = Vec::with_capacity(entries.len());
            let mut total = 0u64;
            for entry in entries {
                let length = entry.get_int(b"length").ok_or_else(|| missing("file length"))? as u64;
                let path = entry
                    .get(b"path")
                    .and_then(|v| v.as_list())
                    .ok_or_else(|| missing("file path"))?
                    .iter()
                    .map(|component| {
                        component
                            .as_str()
                            .map(String::from)
                            .ok_or_else(|| Error::InvalidTorrent("non-UTF8 path component".to_string()))
                    })
                    .collect::<Result<Vec<_>>>()?;

                total += length;
                files.push(FileInfo { path, length });
            }
            (files, total, true)
        };

        Ok(TorrentInfo {
            name,
            piece_length: piece_length as u64,
            pieces,
            files,
            multi_file,
            total_length,
        })
    }
}

/// Top-level structure of a `.torrent` file.
#[derive(Debug, Clone)]
pub struct Metainfo {
    pub announce: String,
    pub announce_list: Option<Vec<Vec<String>>>,
    pub info: TorrentInfo,
    /// SHA1 of the bencoded info dictionary.
    pub info_hash: [u8; 20],
}

impl Metainfo {
    pub fn from_bencode(value: &BencodeValue) -> Result<Self> {
        let announce = value
            .get_str(b"announce")
            .ok_or_else(|| missing("announce"))?
            .to_string();

        let announce_list = value.get(b"announce-list").and_then(|v| {
            v.as_list().map(|tiers| {
                tiers
                    .iter()
                    .filter_map(|tier| {
                        tier.as_list().map(|urls| {
                            urls.iter().filter_map(|u| u.as_str().map(String::from)).collect()
                        })
                    })
                    .collect()
            })
        });

        let info_value = value.get(b"info").ok_or_else(|| missing("info"))?;
        let info = TorrentInfo::parse(info_value)?;

        // Hash the canonical re-encoding of the info dict. Bencode dict keys
        // are sorted, so this reproduces the original bytes.
        let mut hasher = Sha1::new();
        hasher.update(bencode::encode(info_value));
        let info_hash: [u8; 20] = hasher.finalize().into();

        Ok(Metainfo {
            announce,
            announce_list,
            info,
            info_hash,
        })
    }

    pub fn info_hash_hex(&self) -> String {
        hex::encode(self.info_hash)
    }
}

fn missing(field: &str) -> Error {
    Error::InvalidTorrent(format!("missing '{field}' field"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single_file_torrent() -> Vec<u8> {
        let pieces: Vec<u8> = (0..40).collect();
        let mut doc = b"d8:announce20:http://tracker/check4:infod6:lengthi24576e4:name4:demo12:piece lengthi16384e6:pieces40:".to_vec();
        doc.extend_from_slice(&pieces);
        doc.extend_from_slice(b"ee");
        doc
    }

    #[test]
    fn parses_single_file_metainfo() {
        let value = bencode::decode(&single_file_torrent()).unwrap();
        let metainfo = Metainfo::from_bencode(&value).unwrap();

        assert_eq!(metainfo.announce, "http://tracker/check");
        assert_eq!(metainfo.info.name, "demo");
        assert_eq!(metainfo.info.piece_length, 16384);
        assert_eq!(metainfo.info.pieces.len(), 2);
        assert_eq!(metainfo.info.total_length, 24576);
        assert!(!metainfo.info.multi_file);
        assert_eq!(metainfo.info.files.len(), 1);
        assert_eq!(metainfo.info.files[0].path, vec!["demo".to_string()]);
    }

    #[test]
    fn info_hash_matches_manual_digest() {
        let doc = single_file_torrent();
        let value = bencode::decode(&doc).unwrap();
        let metainfo = Metainfo::from_bencode(&value).unwrap();

        // The info dict is the byte range between "4:info" and the final 'e'.
        let start = doc.windows(6).position(|w| w == b"4:info").unwrap() + 6;
        let mut hasher = Sha1::new();
        hasher.update(&doc[start..doc.len() - 1]);
        let expected: [u8; 20] = hasher.finalize().into();

        assert_eq!(metainfo.info_hash, expected);
    }

    #[test]
    fn rejects_missing_fields() {
        let value = bencode::decode(b"d8:announce3:urle").unwrap();
        assert!(Metainfo::from_bencode(&value).is_err());
    }
}
