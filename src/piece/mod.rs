//! Piece lifecycle: the shared completed/requested ledger and the per-piece
//! buffer/verify/flush state machine.

mod ledger;
mod store;

pub use ledger::PieceLedger;
pub use store::{PieceStore, WriteOutcome};

/// Block size used when requesting piece data (16 KiB).
pub const BLOCK_SIZE: u32 = 16 * 1024;
