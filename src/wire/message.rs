use bytes::{Buf, BufMut, BytesMut};

use crate::error::{ProtocolViolation, Result};

/// Identifies one block within a piece: the unit actually requested and
/// transferred over the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    pub piece: u32,
    pub begin: u32,
    pub length: u32,
}

impl BlockInfo {
    pub fn new(piece: u32, begin: u32, length: u32) -> Self {
        Self {
            piece,
            begin,
            length,
        }
    }
}

/// A peer wire message. Frames on the wire are
/// `[4-byte big-endian length][1-byte type][payload]`, where the length
/// counts only type and payload; a zero length with no type byte is a
/// keep-alive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { piece: u32 },
    /// Raw wire-format bitfield bytes. Converted to a [`Bitfield`] by the
    /// receiver once the piece count is known.
    ///
    /// [`Bitfield`]: crate::wire::Bitfield
    Bitfield { raw: Vec<u8> },
    Request { block: BlockInfo },
    Piece {
        piece: u32,
        begin: u32,
        data: Vec<u8>,
    },
    Cancel { block: BlockInfo },
    /// DHT listen port hint. Decoded but otherwise ignored.
    Port { port: u16 },
}

impl Message {
    pub const CHOKE: u8 = 0;
    pub const UNCHOKE: u8 = 1;
    pub const INTERESTED: u8 = 2;
    pub const NOT_INTERESTED: u8 = 3;
    pub const HAVE: u8 = 4;
    pub const BITFIELD: u8 = 5;
    pub const REQUEST: u8 = 6;
    pub const PIECE: u8 = 7;
    pub const CANCEL: u8 = 8;
    pub const PORT: u8 = 9;

    /// Serialize to a complete frame, length prefix included.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();

        match self {
            Message::KeepAlive => {
                buf.put_u32(0);
            }
            Message::Choke => {
                buf.put_u32(1);
                buf.put_u8(Self::CHOKE);
            }
            Message::Unchoke => {
                buf.put_u32(1);
                buf.put_u8(Self::UNCHOKE);
            }
            Message::Interested => {
                buf.put_u32(1);
                buf.put_u8(Self::INTERESTED);
            }
            Message::NotInterested => {
                buf.put_u32(1);
                buf.put_u8(Self::NOT_INTERESTED);
            }
            Message::Have { piece } => {
                buf.put_u32(5);
                buf.put_u8(Self::HAVE);
                buf.put_u32(*piece);
            }
            Message::Bitfield { raw } => {
                buf.put_u32(1 + raw.len() as u32);
                buf.put_u8(Self::BITFIELD);
                buf.put_slice(raw);
            }
            Message::Request { block } => {
                buf.put_u32(13);
                buf.put_u8(Self::REQUEST);
                buf.put_u32(block.piece);
                buf.put_u32(block.begin);
                buf.put_u32(block.length);
            }
            Message::Piece { piece, begin, data } => {
                buf.put_u32(9 + data.len() as u32);
                buf.put_u8(Self::PIECE);
                buf.put_u32(*piece);
                buf.put_u32(*begin);
                buf.put_slice(data);
            }
            Message::Cancel { block } => {
                buf.put_u32(13);
                buf.put_u8(Self::CANCEL);
                buf.put_u32(block.piece);
                buf.put_u32(block.begin);
                buf.put_u32(block.length);
            }
            Message::Port { port } => {
                buf.put_u32(3);
                buf.put_u8(Self::PORT);
                buf.put_u16(*port);
            }
        }

        buf.to_vec()
    }

    /// Deserialize from a frame body (type byte plus payload, length prefix
    /// already consumed). An empty body is a keep-alive.
    pub fn decode(mut body: &[u8]) -> Result<Self> {
        if body.is_empty() {
            return Ok(Message::KeepAlive);
        }

        let id = body.get_u8();
        match id {
            Self::CHOKE => Ok(Message::Choke),
            Self::UNCHOKE => Ok(Message::Unchoke),
            Self::INTERESTED => Ok(Message::Interested),
            Self::NOT_INTERESTED => Ok(Message::NotInterested),
            Self::HAVE => {
                if body.len() < 4 {
                    return Err(ProtocolViolation::TruncatedMessage.into());
                }
                Ok(Message::Have {
                    piece: body.get_u32(),
                })
            }
            Self::BITFIELD => Ok(Message::Bitfield { raw: body.to_vec() }),
            Self::REQUEST => {
                if body.len() < 12 {
                    return Err(ProtocolViolation::TruncatedMessage.into());
                }
                Ok(Message::Request {
                    block: BlockInfo::new(body.get_u32(), body.get_u32(), body.get_u32()),
                })
            }
            Self::PIECE => {
                if body.len() < 8 {
                    return Err(ProtocolViolation::TruncatedMessage.into());
                }
                let piece = body.get_u32();
                let begin = body.get_u32();
                Ok(Message::Piece {
                    piece,
                    begin,
                    data: body.to_vec(),
                })
            }
            Self::CANCEL => {
                if body.len() < 12 {
                    return Err(ProtocolViolation::TruncatedMessage.into());
                }
                Ok(Message::Cancel {
                    block: BlockInfo::new(body.get_u32(), body.get_u32(), body.get_u32()),
                })
            }
            Self::PORT => {
                if body.len() < 2 {
                    return Err(ProtocolViolation::TruncatedMessage.into());
                }
                Ok(Message::Port {
                    port: body.get_u16(),
                })
            }
            other => Err(ProtocolViolation::UnknownMessageId(other).into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(message: Message) {
        let frame = message.encode();
        let length = u32::from_be_bytes(frame[..4].try_into().unwrap()) as usize;
        assert_eq!(length, frame.len() - 4);
        let decoded = Message::decode(&frame[4..]).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn all_message_types_round_trip() {
        round_trip(Message::KeepAlive);
        round_trip(Message::Choke);
        round_trip(Message::Unchoke);
        round_trip(Message::Interested);
        round_trip(Message::NotInterested);
        round_trip(Message::Have { piece: 42 });
        round_trip(Message::Bitfield {
            raw: vec![0b1010_0000, 0b0000_0001],
        });
        round_trip(Message::Request {
            block: BlockInfo::new(3, 16384, 16384),
        });
        round_trip(Message::Piece {
            piece: 3,
            begin: 16384,
            data: vec![7; 512],
        });
        round_trip(Message::Cancel {
            block: BlockInfo::new(3, 16384, 16384),
        });
        round_trip(Message::Port { port: 6881 });
    }

    #[test]
    fn keep_alive_is_a_bare_length_prefix() {
        assert_eq!(Message::KeepAlive.encode(), vec![0, 0, 0, 0]);
    }

    #[test]
    fn truncated_payloads_are_rejected() {
        assert!(Message::decode(&[Message::HAVE, 0, 0]).is_err());
        assert!(Message::decode(&[Message::REQUEST, 0, 0, 0, 1]).is_err());
        assert!(Message::decode(&[Message::PIECE, 0, 0, 0, 1]).is_err());
        assert!(Message::decode(&[99]).is_err());
    }
}
