use std::sync::Mutex;

use crate::wire::Bitfield;

/// The torrent-wide `completed` and `requested` piece bitmaps.
///
/// The session owns the only instance; every other component goes through
/// snapshot reads and the atomic claim/release/commit operations below, so
/// no caller ever holds a live reference to the bitmaps while scheduling.
/// Invariants: `completed` and `requested` stay disjoint, and a piece is
/// requested by at most one peer at a time.
pub struct PieceLedger {
    inner: Mutex<Inner>,
}

struct Inner {
    completed: Bitfield,
    requested: Bitfield,
}

impl PieceLedger {
    pub fn new(pieces: u32) -> Self {
        Self {
            inner: Mutex::new(Inner {
                completed: Bitfield::new(pieces as usize),
                requested: Bitfield::new(pieces as usize),
            }),
        }
    }

    /// Snapshot of the completed bitmap.
    pub fn completed(&self) -> Bitfield {
        self.inner.lock().unwrap().completed.clone()
    }

    /// Snapshot of the requested bitmap.
    pub fn requested(&self) -> Bitfield {
        self.inner.lock().unwrap().requested.clone()
    }

    /// Pieces in `available` that are neither completed nor requested.
    pub fn wanted(&self, available: &Bitfield) -> Bitfield {
        let inner = self.inner.lock().unwrap();
        available
            .difference(&inner.completed)
            .difference(&inner.requested)
    }

    /// Select the lowest-indexed wanted piece out of `available` and mark
    /// it requested, atomically with respect to other claimants.
    pub fn claim_next(&self, available: &Bitfield) -> Option<u32> {
        let mut inner = self.inner.lock().unwrap();
        let wanted = available
            .difference(&inner.completed)
            .difference(&inner.requested);
        let piece = wanted.first_set()?;
        inner.requested.set(piece);
        Some(piece as u32)
    }

    /// Return a claimed piece to the pool (choke, disconnect, hash failure).
    pub fn release(&self, piece: u32) {
        self.inner.lock().unwrap().requested.clear(piece as usize);
    }

    /// Record a verified piece: out of `requested`, into `completed`.
    pub fn commit(&self, piece: u32) {
        let mut inner = self.inner.lock().unwrap();
        inner.requested.clear(piece as usize);
        inner.completed.set(piece as usize);
    }

    pub fn completed_count(&self) -> usize {
        self.inner.lock().unwrap().completed.count()
    }

    pub fn is_complete(&self) -> bool {
        self.inner.lock().unwrap().completed.is_full()
    }
}
