use thiserror::Error;

/// Wire-level misbehavior by a remote peer. Fatal to that one connection,
/// never to the torrent.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolViolation {
    #[error("handshake truncated: read {read} of {expected} bytes")]
    HandshakeLength { read: usize, expected: usize },

    #[error("handshake carries an unknown protocol identifier")]
    HandshakeProtocol,

    #[error("handshake info hash does not match this torrent")]
    HandshakeInfoHash,

    #[error("handshake peer id does not match the id announced by the tracker")]
    HandshakePeerId,

    #[error("piece index {index} out of range ({pieces} pieces)")]
    PieceIndexOutOfRange { index: u32, pieces: u32 },

    #[error("block {begin}+{length} exceeds the bounds of piece {index}")]
    BlockOutOfRange { index: u32, begin: u32, length: u32 },

    #[error("bitfield of {bytes} bytes does not cover {pieces} pieces")]
    BadBitfieldLength { bytes: usize, pieces: u32 },

    #[error("request for {length} bytes exceeds the {max} byte block limit")]
    OversizedRequest { length: u32, max: u32 },

    #[error("request received while the peer is choked")]
    RequestWhileChoked,

    #[error("request for piece {index} which is not available locally")]
    RequestUnavailablePiece { index: u32 },

    #[error("frame of {length} bytes exceeds the maximum frame size")]
    OversizedFrame { length: usize },

    #[error("message payload truncated")]
    TruncatedMessage,

    #[error("unknown message id {0}")]
    UnknownMessageId(u8),
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("bencode parsing error: {0}")]
    Bencode(String),

    #[error("invalid torrent file: {0}")]
    InvalidTorrent(String),

    #[error("tracker error: {0}")]
    Tracker(String),

    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolViolation),

    #[error("piece {piece} is not available")]
    PieceUnavailable { piece: u32 },

    #[error("block {offset}+{length} exceeds the length of piece {piece}")]
    BlockOutOfBounds { piece: u32, offset: u32, length: u32 },

    #[error("range {offset}+{length} exceeds the {total} byte storage space")]
    RangeOutOfBounds { offset: u64, length: u64, total: u64 },

    #[error("short read at storage offset {offset}")]
    ShortRead { offset: u64 },

    #[error("short write at storage offset {offset}")]
    ShortWrite { offset: u64 },

    #[error("connection closed by peer")]
    ConnectionClosed,

    #[error("peer is not connected")]
    NotConnected,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("URL parse error: {0}")]
    UrlParse(String),
}

impl From<url::ParseError> for Error {
    fn from(err: url::ParseError) -> Self {
        Error::UrlParse(err.to_string())
    }
}

impl Error {
    /// Whether this error indicates disk-level trouble. Storage failures
    /// are fatal to the whole torrent rather than to a single connection.
    pub fn is_storage_failure(&self) -> bool {
        matches!(
            self,
            Error::ShortRead { .. } | Error::ShortWrite { .. } | Error::Io(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
