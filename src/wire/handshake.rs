use crate::error::{ProtocolViolation, Result};

pub const PROTOCOL_STRING: &[u8] = b"BitTorrent protocol";

/// Total size of the fixed-layout handshake:
/// 1 (pstrlen) + 19 (pstr) + 8 (reserved) + 20 (info hash) + 20 (peer id).
pub const HANDSHAKE_LEN: usize = 68;

/// The fixed 68-byte handshake exchanged in blocking fashion before the
/// framed-message phase begins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
}

impl Handshake {
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        Self { info_hash, peer_id }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HANDSHAKE_LEN);
        buf.push(PROTOCOL_STRING.len() as u8);
        buf.extend_from_slice(PROTOCOL_STRING);
        buf.extend_from_slice(&[0u8; 8]);
        buf.extend_from_slice(&self.info_hash);
        buf.extend_from_slice(&self.peer_id);
        buf
    }

    /// Parse and validate the fixed layout. The caller is expected to have
    /// read exactly [`HANDSHAKE_LEN`] bytes; anything shorter already failed.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() != HANDSHAKE_LEN {
            return Err(ProtocolViolation::HandshakeLength {
                read: data.len(),
                expected: HANDSHAKE_LEN,
            }
            .into());
        }
        if data[0] as usize != PROTOCOL_STRING.len() || &data[1..20] != PROTOCOL_STRING {
            return Err(ProtocolViolation::HandshakeProtocol.into());
        }

        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&data[28..48]);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&data[48..68]);

        Ok(Self { info_hash, peer_id })
    }

    /// Verify the received handshake against the torrent we are serving and,
    /// when the tracker announced one, the expected peer id.
    pub fn validate(&self, info_hash: &[u8; 20], expected_peer_id: Option<&[u8; 20]>) -> Result<()> {
        if &self.info_hash != info_hash {
            return Err(ProtocolViolation::HandshakeInfoHash.into());
        }
        if let Some(expected) = expected_peer_id {
            if &self.peer_id != expected {
                return Err(ProtocolViolation::HandshakePeerId.into());
            }
        }
        Ok(())
    }
}
