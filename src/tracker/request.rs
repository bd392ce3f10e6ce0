/// Lifecycle event reported with an announce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnounceEvent {
    Started,
    Stopped,
    Completed,
}

impl AnnounceEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnnounceEvent::Started => "started",
            AnnounceEvent::Stopped => "stopped",
            AnnounceEvent::Completed => "completed",
        }
    }
}

/// Parameters of one announce request.
#[derive(Debug, Clone)]
pub struct AnnounceRequest {
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
    /// Port we report as listening on.
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    /// Bytes still missing from the torrent.
    pub left: u64,
    pub event: Option<AnnounceEvent>,
}

impl AnnounceRequest {
    /// The raw query string. The two 20-byte hashes must be percent-encoded
    /// byte-for-byte, so the query is assembled by hand rather than going
    /// through a form serializer that would re-encode the percent signs.
    pub fn query_string(&self) -> String {
        let mut query = format!(
            "info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&compact=1",
            percent_encode(&self.info_hash),
            percent_encode(&self.peer_id),
            self.port,
            self.uploaded,
            self.downloaded,
            self.left,
        );
        if let Some(event) = self.event {
            query.push_str("&event=");
            query.push_str(event.as_str());
        }
        query
    }
}

fn percent_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 3);
    for &byte in bytes {
        match byte {
            b'0'..=b'9' | b'a'..=b'z' | b'A'..=b'Z' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char);
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_percent_encodes_hashes() {
        let mut info_hash = [0u8; 20];
        info_hash[0] = 0xFF;
        info_hash[1] = b'a';
        let request = AnnounceRequest {
            info_hash,
            peer_id: [b'A'; 20],
            port: 6881,
            uploaded: 1,
            downloaded: 2,
            left: 3,
            event: Some(AnnounceEvent::Started),
        };

        let query = request.query_string();
        assert!(query.starts_with("info_hash=%FFa%00"));
        assert!(query.contains("peer_id=AAAAAAAAAAAAAAAAAAAA"));
        assert!(query.contains("&port=6881&uploaded=1&downloaded=2&left=3&compact=1"));
        assert!(query.ends_with("&event=started"));
    }

    #[test]
    fn event_is_omitted_for_plain_announces() {
        let request = AnnounceRequest {
            info_hash: [0; 20],
            peer_id: [b'A'; 20],
            port: 6881,
            uploaded: 0,
            downloaded: 0,
            left: 0,
            event: None,
        };
        assert!(!request.query_string().contains("event"));
    }
}
