use crate::error::{Error, Result};

/// A 20-byte SHA1 piece digest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PieceHash([u8; 20]);

impl PieceHash {
    pub fn from_slice(slice: &[u8]) -> Result<Self> {
        let hash: [u8; 20] = slice
            .try_into()
            .map_err(|_| Error::InvalidTorrent("piece hash must be 20 bytes".to_string()))?;
        Ok(Self(hash))
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl AsRef<[u8]> for PieceHash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// The ordered piece hash list from the info dictionary.
#[derive(Debug, Clone)]
pub struct PieceHashes {
    hashes: Vec<PieceHash>,
}

impl PieceHashes {
    /// Parse the concatenated 20-byte digests of the `pieces` field.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.is_empty() || data.len() % 20 != 0 {
            return Err(Error::InvalidTorrent(
                "pieces length must be a non-zero multiple of 20".to_string(),
            ));
        }
        let hashes = data
            .chunks_exact(20)
            .map(PieceHash::from_slice)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { hashes })
    }

    pub fn len(&self) -> usize {
        self.hashes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hashes.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&PieceHash> {
        self.hashes.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PieceHash> {
        self.hashes.iter()
    }
}
