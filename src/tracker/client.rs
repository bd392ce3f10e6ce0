use reqwest::Client;
use tracing::{debug, info};
use url::Url;

use crate::bencode::decode;
use crate::error::{Error, Result};

use super::{AnnounceRequest, AnnounceResponse};

/// HTTP announce client. One instance per session; reqwest pools the
/// underlying connections.
pub struct TrackerClient {
    client: Client,
}

impl TrackerClient {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
        }
    }

    /// Announce to the tracker and decode the peer list.
    pub async fn announce(
        &self,
        announce_url: &str,
        request: &AnnounceRequest,
    ) -> Result<AnnounceResponse> {
        let mut url = Url::parse(announce_url)?;
        // Append to any query the announce URL already carries (passkeys).
        let query = match url.query() {
            Some(existing) if !existing.is_empty() => {
                format!("{existing}&{}", request.query_string())
            }
            _ => request.query_string(),
        };
        url.set_query(Some(&query));
        debug!(%url, "announcing");

        let response = self.client.get(url).send().await?;
        let status = response.status();
        let body = response.bytes().await?;
        if !status.is_success() {
            return Err(Error::Tracker(format!("tracker returned HTTP {status}")));
        }

        let decoded = decode(&body).map_err(|err| Error::Tracker(err.to_string()))?;
        let announce = AnnounceResponse::from_bencode(&decoded)?;
        info!(
            peers = announce.peers.len(),
            interval = announce.interval,
            "tracker announce succeeded"
        );
        Ok(announce)
    }
}

impl Default for TrackerClient {
    fn default() -> Self {
        Self::new()
    }
}
