use std::net::IpAddr;

use crate::bencode::BencodeValue;
use crate::error::{Error, Result};

use super::PeerInfo;

/// A decoded announce response.
#[derive(Debug, Clone)]
pub struct AnnounceResponse {
    /// Seconds to wait before the next regular announce.
    pub interval: u64,
    pub min_interval: Option<u64>,
    /// Seeder count, when the tracker reports one.
    pub complete: Option<u64>,
    /// Leecher count, when the tracker reports one.
    pub incomplete: Option<u64>,
    pub peers: Vec<PeerInfo>,
}

impl AnnounceResponse {
    pub fn from_bencode(value: &BencodeValue) -> Result<Self> {
        if value.as_dict().is_none() {
            return Err(Error::Tracker("announce response is not a dict".into()));
        }

        if let Some(reason) = value.get(b"failure reason") {
            let reason = reason.as_str().unwrap_or("unknown failure");
            return Err(Error::Tracker(format!("tracker refused: {reason}")));
        }

        let interval = value
            .get_int(b"interval")
            .ok_or_else(|| Error::Tracker("missing interval".into()))? as u64;

        let peers = match value.get(b"peers") {
            Some(BencodeValue::Bytes(compact)) => PeerInfo::from_compact_list(compact),
            Some(BencodeValue::List(entries)) => parse_peer_dicts(entries)?,
            Some(_) => return Err(Error::Tracker("unrecognized peers format".into())),
            None => return Err(Error::Tracker("missing peers".into())),
        };

        Ok(Self {
            interval,
            min_interval: value.get_int(b"min interval").map(|i| i as u64),
            complete: value.get_int(b"complete").map(|i| i as u64),
            incomplete: value.get_int(b"incomplete").map(|i| i as u64),
            peers,
        })
    }
}

fn parse_peer_dicts(entries: &[BencodeValue]) -> Result<Vec<PeerInfo>> {
    let mut peers = Vec::with_capacity(entries.len());
    for entry in entries {
        let ip: IpAddr = entry
            .get_str(b"ip")
            .ok_or_else(|| Error::Tracker("peer entry missing ip".into()))?
            .parse()
            .map_err(|_| Error::Tracker("peer entry has an invalid ip".into()))?;
        let port = entry
            .get_int(b"port")
            .ok_or_else(|| Error::Tracker("peer entry missing port".into()))?
            as u16;

        let peer_id = entry
            .get(b"peer id")
            .and_then(BencodeValue::as_bytes)
            .and_then(|bytes| <[u8; 20]>::try_from(bytes).ok());

        peers.push(match peer_id {
            Some(id) => PeerInfo::with_peer_id(ip, port, id),
            None => PeerInfo::new(ip, port),
        });
    }
    Ok(peers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bencode::decode;

    #[test]
    fn decodes_compact_peers() {
        let raw = b"d8:completei3e10:incompletei7e8:intervali1800e5:peers6:\x7f\x00\x00\x01\x1a\xe1e";
        let response = AnnounceResponse::from_bencode(&decode(raw).unwrap()).unwrap();

        assert_eq!(response.interval, 1800);
        assert_eq!(response.complete, Some(3));
        assert_eq!(response.incomplete, Some(7));
        assert_eq!(response.peers.len(), 1);
        assert_eq!(response.peers[0].addr, "127.0.0.1:6881".parse().unwrap());
    }

    #[test]
    fn decodes_dictionary_peers_with_ids() {
        let raw = b"d8:intervali60e5:peersld2:ip9:10.0.0.427:peer id20:AAAAAAAAAAAAAAAAAAAA4:porti6881eeee";
        let response = AnnounceResponse::from_bencode(&decode(raw).unwrap()).unwrap();

        assert_eq!(response.peers.len(), 1);
        assert_eq!(response.peers[0].addr, "10.0.0.42:6881".parse().unwrap());
        assert_eq!(response.peers[0].peer_id, Some([b'A'; 20]));
    }

    #[test]
    fn surfaces_tracker_failure_reason() {
        let raw = b"d14:failure reason12:unregisterede";
        let err = AnnounceResponse::from_bencode(&decode(raw).unwrap()).unwrap_err();
        assert!(err.to_string().contains("unregistered"));
    }
}
