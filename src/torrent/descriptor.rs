use super::{FileInfo, Metainfo, PieceHashes};

/// Immutable identity and geometry of one torrent, shared across the
/// session, scheduler and storage layers.
///
/// Pieces are numbered `0..piece_count()`; every piece but the last spans
/// `piece_length` bytes, and the last spans whatever remains (for a
/// single-piece torrent that is the whole size).
#[derive(Debug, Clone)]
pub struct TorrentDescriptor {
    pub info_hash: [u8; 20],
    pub name: String,
    pub announce: String,
    pub piece_length: u64,
    pub pieces: PieceHashes,
    pub files: Vec<FileInfo>,
    pub multi_file: bool,
    pub total_size: u64,
}

impl TorrentDescriptor {
    pub fn from_metainfo(metainfo: Metainfo) -> Self {
        Self {
            info_hash: metainfo.info_hash,
            name: metainfo.info.name,
            announce: metainfo.announce,
            piece_length: metainfo.info.piece_length,
            pieces: metainfo.info.pieces,
            files: metainfo.info.files,
            multi_file: metainfo.info.multi_file,
            total_size: metainfo.info.total_length,
        }
    }

    pub fn piece_count(&self) -> u32 {
        self.pieces.len() as u32
    }

    pub fn in_range(&self, piece: u32) -> bool {
        piece < self.piece_count()
    }

    /// Byte offset of a piece in the flat torrent byte space.
    pub fn piece_offset(&self, piece: u32) -> u64 {
        piece as u64 * self.piece_length
    }

    /// Actual length of a piece, accounting for the short last piece.
    pub fn piece_len(&self, piece: u32) -> u32 {
        debug_assert!(self.in_range(piece));
        if piece + 1 == self.piece_count() {
            (self.total_size - self.piece_offset(piece)) as u32
        } else {
            self.piece_length as u32
        }
    }

    pub fn piece_hash(&self, piece: u32) -> &[u8; 20] {
        self.pieces
            .get(piece as usize)
            .expect("piece index validated by caller")
            .as_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(piece_length: u64, total: u64, pieces: usize) -> TorrentDescriptor {
        let raw: Vec<u8> = (0..pieces * 20).map(|b| b as u8).collect();
        TorrentDescriptor {
            info_hash: [0; 20],
            name: "demo".to_string(),
            announce: "http://tracker/ann".to_string(),
            piece_length,
            pieces: PieceHashes::from_bytes(&raw).unwrap(),
            files: vec![FileInfo {
                path: vec!["demo".to_string()],
                length: total,
            }],
            multi_file: false,
            total_size: total,
        }
    }

    #[test]
    fn short_last_piece() {
        let d = descriptor(16 * 1024, 24 * 1024, 2);
        assert_eq!(d.piece_len(0), 16 * 1024);
        assert_eq!(d.piece_len(1), 8 * 1024);
        assert_eq!(d.piece_offset(1), 16 * 1024);
    }

    #[test]
    fn evenly_divided_last_piece_is_full_length() {
        let d = descriptor(16 * 1024, 32 * 1024, 2);
        assert_eq!(d.piece_len(1), 16 * 1024);
    }

    #[test]
    fn single_piece_torrent_covers_the_whole_size() {
        let d = descriptor(256 * 1024, 1000, 1);
        assert_eq!(d.piece_len(0), 1000);
        assert_eq!(d.piece_offset(0), 0);
    }
}
