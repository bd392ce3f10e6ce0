//! Segmented file storage: maps the torrent's flat byte-offset space onto
//! one or more real files, translating any offset+length request into
//! per-file positional reads and writes.

use std::fs::{self, File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::torrent::TorrentDescriptor;

struct FileEntry {
    path: PathBuf,
    file: File,
    /// Start offset in the flat torrent byte space.
    offset: u64,
    length: u64,
}

/// One (file, sub-range) pair of a flat-space request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Segment {
    file_index: usize,
    file_offset: u64,
    length: u64,
}

/// Open file handles for one torrent. Files are opened for random
/// read/write at torrent start and kept open until the store is dropped;
/// all I/O is positional, so concurrent reads and writes to disjoint
/// ranges need no shared cursor.
pub struct FileStore {
    files: Vec<FileEntry>,
    total_size: u64,
}

impl FileStore {
    /// Create backing files under `root`. Single-file torrents materialize
    /// `<root>/<name>`; multi-file torrents `<root>/<name>/<path...>`, with
    /// parent directories created first.
    pub fn open(root: &Path, descriptor: &TorrentDescriptor) -> Result<Self> {
        let base = if descriptor.multi_file {
            root.join(&descriptor.name)
        } else {
            root.to_path_buf()
        };
        fs::create_dir_all(&base)?;

        let mut files = Vec::with_capacity(descriptor.files.len());
        let mut offset = 0u64;
        for file_info in &descriptor.files {
            let mut path = base.clone();
            for component in &file_info.path {
                path.push(component);
            }
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }

            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(&path)?;
            debug!(path = %path.display(), length = file_info.length, "opened backing file");

            files.push(FileEntry {
                path,
                file,
                offset,
                length: file_info.length,
            });
            offset += file_info.length;
        }

        info!(
            files = files.len(),
            total = offset,
            "torrent file storage initialized"
        );
        Ok(Self {
            files,
            total_size: offset,
        })
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    /// Read exactly `buf.len()` bytes starting at `offset` in flat space.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let segments = self.segments(offset, buf.len() as u64)?;
        let mut filled = 0usize;
        for segment in segments {
            let entry = &self.files[segment.file_index];
            let slice = &mut buf[filled..filled + segment.length as usize];
            entry
                .file
                .read_exact_at(slice, segment.file_offset)
                .map_err(|err| short_read(err, entry.offset + segment.file_offset))?;
            filled += segment.length as usize;
        }
        Ok(())
    }

    /// Write all of `data` starting at `offset` in flat space.
    pub fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        let segments = self.segments(offset, data.len() as u64)?;
        let mut written = 0usize;
        for segment in segments {
            let entry = &self.files[segment.file_index];
            let slice = &data[written..written + segment.length as usize];
            entry
                .file
                .write_all_at(slice, segment.file_offset)
                .map_err(|err| short_write(err, entry.offset + segment.file_offset))?;
            written += segment.length as usize;
        }
        Ok(())
    }

    /// Force all written data to stable storage.
    pub fn sync(&self) -> Result<()> {
        for entry in &self.files {
            entry.file.sync_all()?;
        }
        debug!("backing files synced");
        Ok(())
    }

    fn segments(&self, offset: u64, length: u64) -> Result<Vec<Segment>> {
        if offset + length > self.total_size {
            return Err(Error::RangeOutOfBounds {
                offset,
                length,
                total: self.total_size,
            });
        }
        let extents: Vec<(u64, u64)> = self.files.iter().map(|f| (f.offset, f.length)).collect();
        Ok(plan_segments(&extents, offset, length))
    }

    pub fn paths(&self) -> impl Iterator<Item = &Path> {
        self.files.iter().map(|f| f.path.as_path())
    }
}

/// Split a flat-space `(offset, length)` request across the contiguous
/// file extents `(start offset, length)`. Pure function of its inputs;
/// the caller has already bounds-checked the request.
fn plan_segments(extents: &[(u64, u64)], offset: u64, length: u64) -> Vec<Segment> {
    let mut segments = Vec::new();
    let end = offset + length;
    for (file_index, &(start, file_length)) in extents.iter().enumerate() {
        let file_end = start + file_length;
        if file_end <= offset {
            continue;
        }
        if start >= end {
            break;
        }
        let clipped_start = offset.max(start);
        let clipped_end = end.min(file_end);
        segments.push(Segment {
            file_index,
            file_offset: clipped_start - start,
            length: clipped_end - clipped_start,
        });
    }
    segments
}

fn short_read(err: std::io::Error, offset: u64) -> Error {
    match err.kind() {
        std::io::ErrorKind::UnexpectedEof => Error::ShortRead { offset },
        _ => Error::Io(err),
    }
}

fn short_write(err: std::io::Error, offset: u64) -> Error {
    match err.kind() {
        std::io::ErrorKind::WriteZero => Error::ShortWrite { offset },
        _ => Error::Io(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::{FileInfo, PieceHashes};

    fn two_file_descriptor(lengths: &[u64]) -> TorrentDescriptor {
        let files = lengths
            .iter()
            .enumerate()
            .map(|(i, &length)| FileInfo {
                path: vec![format!("file-{i}")],
                length,
            })
            .collect();
        TorrentDescriptor {
            info_hash: [0; 20],
            name: "multi".to_string(),
            announce: String::new(),
            piece_length: 16 * 1024,
            pieces: PieceHashes::from_bytes(&[0u8; 20]).unwrap(),
            files,
            multi_file: true,
            total_size: lengths.iter().sum(),
        }
    }

    #[test]
    fn segment_plan_splits_on_file_boundaries() {
        // Files of 10 and 10 bytes; a request at offset 5 of length 10
        // takes 5 bytes from each.
        let extents = [(0, 10), (10, 10)];
        let segments = plan_segments(&extents, 5, 10);
        assert_eq!(
            segments,
            vec![
                Segment {
                    file_index: 0,
                    file_offset: 5,
                    length: 5
                },
                Segment {
                    file_index: 1,
                    file_offset: 0,
                    length: 5
                },
            ]
        );
    }

    #[test]
    fn segment_plan_skips_uninvolved_files() {
        let extents = [(0, 4), (4, 4), (8, 4)];
        let segments = plan_segments(&extents, 4, 4);
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].file_index, 1);
        assert_eq!(segments[0].file_offset, 0);
    }

    #[test]
    fn write_and_read_back_across_a_boundary() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path(), &two_file_descriptor(&[10, 10])).unwrap();

        let data: Vec<u8> = (0..10).collect();
        store.write_at(5, &data).unwrap();

        let mut back = vec![0u8; 10];
        store.read_at(5, &mut back).unwrap();
        assert_eq!(back, data);

        // First file holds bytes 0..5 of the payload at its offset 5.
        let first = std::fs::read(dir.path().join("multi/file-0")).unwrap();
        assert_eq!(&first[5..10], &data[..5]);
        let second = std::fs::read(dir.path().join("multi/file-1")).unwrap();
        assert_eq!(&second[..5], &data[5..]);
    }

    #[test]
    fn out_of_range_requests_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path(), &two_file_descriptor(&[10, 10])).unwrap();

        let mut buf = [0u8; 8];
        assert!(matches!(
            store.read_at(16, &mut buf),
            Err(Error::RangeOutOfBounds { .. })
        ));
        assert!(matches!(
            store.write_at(15, &[0u8; 6]),
            Err(Error::RangeOutOfBounds { .. })
        ));
    }
}
