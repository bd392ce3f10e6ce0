//! Peer wire protocol codec: length-prefixed messages, the fixed 68-byte
//! handshake, and the piece bitmap with its big-endian wire bit order.

mod bitfield;
mod handshake;
mod message;

pub use bitfield::Bitfield;
pub use handshake::{Handshake, HANDSHAKE_LEN, PROTOCOL_STRING};
pub use message::{BlockInfo, Message};
