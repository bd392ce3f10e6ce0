use crate::error::{ProtocolViolation, Result};

/// Fixed-capacity piece bitmap.
///
/// Internally the bitmap is little-endian indexed: bit `n` lives in word
/// `n / 64` at position `n % 64`. The BitTorrent wire format instead numbers
/// bits from the most-significant bit of each byte, so `from_wire`/`to_wire`
/// perform the conversion at the codec boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitfield {
    words: Vec<u64>,
    len: usize,
}

impl Bitfield {
    pub fn new(len: usize) -> Self {
        Self {
            words: vec![0; len.div_ceil(64)],
            len,
        }
    }

    /// Decode a wire-format bitfield (MSB of byte 0 is piece 0). The byte
    /// count must exactly cover `len` pieces.
    pub fn from_wire(bytes: &[u8], len: usize) -> Result<Self> {
        if bytes.len() != len.div_ceil(8) {
            return Err(ProtocolViolation::BadBitfieldLength {
                bytes: bytes.len(),
                pieces: len as u32,
            }
            .into());
        }
        let mut bits = Self::new(len);
        for index in 0..len {
            if bytes[index / 8] & (1 << (7 - index % 8)) != 0 {
                bits.set(index);
            }
        }
        Ok(bits)
    }

    /// Encode to wire format, MSB-first per byte. Spare trailing bits are zero.
    pub fn to_wire(&self) -> Vec<u8> {
        let mut bytes = vec![0u8; self.len.div_ceil(8)];
        for index in 0..self.len {
            if self.has(index) {
                bytes[index / 8] |= 1 << (7 - index % 8);
            }
        }
        bytes
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn has(&self, index: usize) -> bool {
        index < self.len && self.words[index / 64] & (1 << (index % 64)) != 0
    }

    pub fn set(&mut self, index: usize) {
        if index < self.len {
            self.words[index / 64] |= 1 << (index % 64);
        }
    }

    pub fn clear(&mut self, index: usize) {
        if index < self.len {
            self.words[index / 64] &= !(1 << (index % 64));
        }
    }

    /// Set every bit in `start..end`.
    pub fn set_range(&mut self, start: usize, end: usize) {
        for index in start..end.min(self.len) {
            self.set(index);
        }
    }

    pub fn count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn is_full(&self) -> bool {
        self.count() == self.len
    }

    pub fn any(&self) -> bool {
        self.words.iter().any(|&w| w != 0)
    }

    /// Lowest set bit, if any.
    pub fn first_set(&self) -> Option<usize> {
        for (word_index, &word) in self.words.iter().enumerate() {
            if word != 0 {
                let index = word_index * 64 + word.trailing_zeros() as usize;
                return (index < self.len).then_some(index);
            }
        }
        None
    }

    /// In-place union.
    pub fn union_with(&mut self, other: &Bitfield) {
        for (word, &other_word) in self.words.iter_mut().zip(&other.words) {
            *word |= other_word;
        }
    }

    /// `self AND NOT other`, as a new bitmap.
    pub fn difference(&self, other: &Bitfield) -> Bitfield {
        let words = self
            .words
            .iter()
            .zip(&other.words)
            .map(|(&a, &b)| a & !b)
            .collect();
        Bitfield {
            words,
            len: self.len,
        }
    }
}
