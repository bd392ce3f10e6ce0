//! Bencode serialization: the `.torrent` metadata and tracker response
//! format, decoded into a generic tree of integers, byte strings, lists
//! and dictionaries.

mod decoder;
mod encoder;
mod value;

pub use decoder::decode;
pub use encoder::encode;
pub use value::BencodeValue;
