use std::sync::Arc;

use sha1::{Digest, Sha1};
use tracing::{debug, info, warn};

use super::BLOCK_SIZE;
use crate::error::{Error, Result};
use crate::storage::FileStore;
use crate::torrent::TorrentDescriptor;
use crate::wire::{Bitfield, BlockInfo};

/// Runtime state of one piece. The buffer and byte-availability bitmap
/// exist only while blocks are arriving; verification happens inline on
/// the write that completes the buffer, after which the piece is either
/// flushed and immutable or back to missing.
enum Slot {
    Missing,
    Buffering { buf: Vec<u8>, have: Bitfield },
    Available,
}

/// What a block write did to its piece.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Stored in the buffer; more blocks are still missing.
    Buffered,
    /// The buffer filled, the digest matched, and the piece was flushed.
    Verified,
    /// The buffer filled but the digest did not match; buffer discarded,
    /// piece back to missing.
    HashMismatch,
    /// The piece is already verified; the write was ignored.
    AlreadyAvailable,
}

/// Per-piece buffering, hash verification and disk flush.
pub struct PieceStore {
    descriptor: Arc<TorrentDescriptor>,
    files: Arc<FileStore>,
    slots: Vec<Slot>,
}

impl PieceStore {
    pub fn new(descriptor: Arc<TorrentDescriptor>, files: Arc<FileStore>) -> Self {
        let slots = (0..descriptor.piece_count()).map(|_| Slot::Missing).collect();
        Self {
            descriptor,
            files,
            slots,
        }
    }

    pub fn is_available(&self, piece: u32) -> bool {
        matches!(self.slots.get(piece as usize), Some(Slot::Available))
    }

    /// Buffer one received block. Allocates the piece buffer lazily on the
    /// first write; when the byte-availability bitmap fills, verifies the
    /// SHA1 digest and either flushes to storage or discards the buffer.
    pub fn write_block(&mut self, piece: u32, begin: u32, data: &[u8]) -> Result<WriteOutcome> {
        let piece_len = self.descriptor.piece_len(piece);
        if begin as u64 + data.len() as u64 > piece_len as u64 {
            return Err(Error::BlockOutOfBounds {
                piece,
                offset: begin,
                length: data.len() as u32,
            });
        }

        let slot = &mut self.slots[piece as usize];
        if matches!(slot, Slot::Available) {
            return Ok(WriteOutcome::AlreadyAvailable);
        }
        if matches!(slot, Slot::Missing) {
            debug!(piece, len = piece_len, "allocating piece buffer");
            *slot = Slot::Buffering {
                buf: vec![0u8; piece_len as usize],
                have: Bitfield::new(piece_len as usize),
            };
        }

        let Slot::Buffering { buf, have } = slot else {
            unreachable!("slot initialized above");
        };
        let begin = begin as usize;
        buf[begin..begin + data.len()].copy_from_slice(data);
        have.set_range(begin, begin + data.len());

        if !have.is_full() {
            return Ok(WriteOutcome::Buffered);
        }

        // Every byte is in; verify and flush or discard.
        let mut hasher = Sha1::new();
        hasher.update(&buf[..]);
        let digest: [u8; 20] = hasher.finalize().into();

        if &digest != self.descriptor.piece_hash(piece) {
            warn!(piece, "piece failed hash verification, discarding buffer");
            self.slots[piece as usize] = Slot::Missing;
            return Ok(WriteOutcome::HashMismatch);
        }

        self.files.write_at(self.descriptor.piece_offset(piece), buf)?;
        self.slots[piece as usize] = Slot::Available;
        info!(piece, "piece verified and flushed");
        Ok(WriteOutcome::Verified)
    }

    /// Read a byte range out of a verified piece.
    pub fn read_block(&self, piece: u32, begin: u32, length: u32) -> Result<Vec<u8>> {
        if !self.is_available(piece) {
            return Err(Error::PieceUnavailable { piece });
        }
        let piece_len = self.descriptor.piece_len(piece);
        if begin as u64 + length as u64 > piece_len as u64 {
            return Err(Error::BlockOutOfBounds {
                piece,
                offset: begin,
                length,
            });
        }

        let mut data = vec![0u8; length as usize];
        self.files
            .read_at(self.descriptor.piece_offset(piece) + begin as u64, &mut data)?;
        Ok(data)
    }

    /// The blocks of `piece` not yet buffered, in offset order. This is
    /// what a download (re)starts from, so bytes that survived an earlier
    /// aborted attempt are not requested again.
    pub fn unfilled_blocks(&self, piece: u32) -> Vec<BlockInfo> {
        let piece_len = self.descriptor.piece_len(piece);
        let mut blocks = Vec::new();
        let mut begin = 0u32;
        while begin < piece_len {
            let length = BLOCK_SIZE.min(piece_len - begin);
            let filled = match &self.slots[piece as usize] {
                Slot::Available => true,
                Slot::Missing => false,
                Slot::Buffering { have, .. } => {
                    (begin..begin + length).all(|byte| have.has(byte as usize))
                }
            };
            if !filled {
                blocks.push(BlockInfo::new(piece, begin, length));
            }
            begin += length;
        }
        blocks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::{FileInfo, PieceHashes};

    fn fixture(payloads: &[&[u8]]) -> (tempfile::TempDir, PieceStore) {
        let piece_length = payloads[0].len() as u64;
        let total: u64 = payloads.iter().map(|p| p.len() as u64).sum();

        let mut raw_hashes = Vec::new();
        for payload in payloads {
            let mut hasher = Sha1::new();
            hasher.update(payload);
            raw_hashes.extend_from_slice(&hasher.finalize());
        }

        let descriptor = Arc::new(TorrentDescriptor {
            info_hash: [0; 20],
            name: "demo".to_string(),
            announce: String::new(),
            piece_length,
            pieces: PieceHashes::from_bytes(&raw_hashes).unwrap(),
            files: vec![FileInfo {
                path: vec!["demo".to_string()],
                length: total,
            }],
            multi_file: false,
            total_size: total,
        });

        let dir = tempfile::tempdir().unwrap();
        let files = Arc::new(FileStore::open(dir.path(), &descriptor).unwrap());
        let store = PieceStore::new(descriptor, files);
        (dir, store)
    }

    #[test]
    fn blocks_assemble_verify_and_flush() {
        let payload: Vec<u8> = (0..64u8).collect();
        let (dir, mut store) = fixture(&[&payload]);

        assert_eq!(
            store.write_block(0, 0, &payload[..32]).unwrap(),
            WriteOutcome::Buffered
        );
        assert!(!store.is_available(0));
        assert_eq!(
            store.write_block(0, 32, &payload[32..]).unwrap(),
            WriteOutcome::Verified
        );
        assert!(store.is_available(0));

        assert_eq!(store.read_block(0, 16, 16).unwrap(), &payload[16..32]);
        assert_eq!(std::fs::read(dir.path().join("demo")).unwrap(), payload);
    }

    #[test]
    fn hash_mismatch_discards_and_allows_retry() {
        let payload: Vec<u8> = (0..64u8).collect();
        let (_dir, mut store) = fixture(&[&payload]);

        let garbage = vec![0xAAu8; 64];
        assert_eq!(
            store.write_block(0, 0, &garbage).unwrap(),
            WriteOutcome::HashMismatch
        );
        assert!(!store.is_available(0));
        assert!(store.read_block(0, 0, 8).is_err());

        // The piece went back to missing, so a clean retry succeeds.
        assert_eq!(store.unfilled_blocks(0).len(), 1);
        assert_eq!(
            store.write_block(0, 0, &payload).unwrap(),
            WriteOutcome::Verified
        );
    }

    #[test]
    fn writes_to_a_verified_piece_are_ignored() {
        let payload: Vec<u8> = (0..32u8).collect();
        let (_dir, mut store) = fixture(&[&payload]);

        store.write_block(0, 0, &payload).unwrap();
        assert_eq!(
            store.write_block(0, 0, &[0xFF; 8]).unwrap(),
            WriteOutcome::AlreadyAvailable
        );
        assert_eq!(store.read_block(0, 0, 8).unwrap(), &payload[..8]);
    }

    #[test]
    fn bounds_are_enforced() {
        let payload: Vec<u8> = (0..32u8).collect();
        let (_dir, mut store) = fixture(&[&payload]);

        assert!(matches!(
            store.write_block(0, 30, &[0u8; 8]),
            Err(Error::BlockOutOfBounds { .. })
        ));
        store.write_block(0, 0, &payload).unwrap();
        assert!(matches!(
            store.read_block(0, 30, 8),
            Err(Error::BlockOutOfBounds { .. })
        ));
    }

    #[test]
    fn unfilled_blocks_reflect_partial_progress() {
        let payload = vec![7u8; (BLOCK_SIZE * 2 + BLOCK_SIZE / 2) as usize];
        let (_dir, mut store) = fixture(&[&payload]);

        let all = store.unfilled_blocks(0);
        assert_eq!(all.len(), 3);
        assert_eq!(all[2].length, BLOCK_SIZE / 2);

        store
            .write_block(0, BLOCK_SIZE, &payload[BLOCK_SIZE as usize..(BLOCK_SIZE * 2) as usize])
            .unwrap();
        let remaining = store.unfilled_blocks(0);
        assert_eq!(remaining.len(), 2);
        assert_eq!(remaining[0].begin, 0);
        assert_eq!(remaining[1].begin, BLOCK_SIZE * 2);
    }
}
