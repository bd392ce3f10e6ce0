//! The top-level client facade: loads a torrent file, runs a session to
//! completion and reacts to Ctrl-C.

use std::path::Path;

use tracing::{error, info, warn};

use crate::error::{Error, Result};
use crate::session::{SessionConfig, TorrentEvent, TorrentSession, TorrentStatus};
use crate::torrent::TorrentDescriptor;

pub struct TorrentClient {
    config: SessionConfig,
}

impl TorrentClient {
    pub fn new(config: SessionConfig) -> Self {
        Self { config }
    }

    /// Download one torrent to completion. Returns once the torrent
    /// completes, fails, or the user interrupts.
    pub async fn download(&self, torrent_path: &Path) -> Result<()> {
        let metainfo = crate::torrent::load_torrent_file(torrent_path).await?;
        let descriptor = TorrentDescriptor::from_metainfo(metainfo);
        info!(
            name = %descriptor.name,
            size = descriptor.total_size,
            pieces = descriptor.piece_count(),
            "loaded torrent"
        );

        let (session, mut events) = TorrentSession::open(descriptor, self.config.clone())?;
        session.start().await?;

        let outcome = loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("interrupted, shutting down");
                    break Ok(());
                }
                event = events.recv() => match event {
                    Some(TorrentEvent::Progress { completed, total, downloaded, uploaded, .. }) => {
                        info!(
                            "progress: {completed}/{total} pieces ({:.1}%), down {downloaded} up {uploaded}",
                            completed as f64 / total as f64 * 100.0,
                        );
                    }
                    Some(TorrentEvent::Status(TorrentStatus::Completed)) => {
                        info!("download complete");
                        break Ok(());
                    }
                    Some(TorrentEvent::Status(TorrentStatus::Failed)) => {
                        error!("download failed");
                        break Err(Error::Io(std::io::Error::other(
                            "download aborted by a storage failure",
                        )));
                    }
                    Some(event) => {
                        info!(?event, "session event");
                    }
                    None => {
                        warn!("session event channel closed");
                        break Ok(());
                    }
                }
            }
        };

        session.stop().await;
        outcome
    }
}
