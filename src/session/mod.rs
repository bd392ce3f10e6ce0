//! The per-torrent session: wires storage, the piece ledger and the swarm
//! together, drives tracker announces, and reports lifecycle events.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::piece::{PieceLedger, PieceStore};
use crate::storage::FileStore;
use crate::swarm::{Swarm, SwarmEvent, TransferStats};
use crate::torrent::TorrentDescriptor;
use crate::tracker::{generate_peer_id, AnnounceEvent, AnnounceRequest, TrackerClient};

/// Upper bound on waiting for in-flight tasks during shutdown.
pub const SHUTDOWN_WAIT: Duration = Duration::from_secs(15);

/// Announce interval used when the tracker sends none or a nonsensical one.
const MIN_ANNOUNCE_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Directory the torrent's files are created under.
    pub download_dir: PathBuf,
    /// Port reported to the tracker.
    pub listen_port: u16,
    /// Maximum simultaneous peer connections.
    pub max_peers: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            download_dir: PathBuf::from("."),
            listen_port: 6881,
            max_peers: 50,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TorrentStatus {
    Starting,
    Downloading,
    Completed,
    Stopped,
    Failed,
}

/// Events a session reports to its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TorrentEvent {
    Status(TorrentStatus),
    Progress {
        piece: u32,
        completed: usize,
        total: u32,
        downloaded: u64,
        uploaded: u64,
    },
}

/// One running torrent.
pub struct TorrentSession {
    descriptor: Arc<TorrentDescriptor>,
    config: SessionConfig,
    peer_id: [u8; 20],
    files: Arc<FileStore>,
    ledger: Arc<PieceLedger>,
    stats: Arc<TransferStats>,
    swarm: Arc<Swarm>,
    tracker: TrackerClient,
    cancel: CancellationToken,
    events: mpsc::UnboundedSender<TorrentEvent>,
    swarm_events: Mutex<Option<mpsc::UnboundedReceiver<SwarmEvent>>>,
    status: Mutex<TorrentStatus>,
}

impl TorrentSession {
    /// Create the backing files and the swarm for a torrent. Nothing
    /// network-facing happens until [`TorrentSession::start`].
    pub fn open(
        descriptor: TorrentDescriptor,
        config: SessionConfig,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<TorrentEvent>)> {
        let descriptor = Arc::new(descriptor);
        let files = Arc::new(FileStore::open(&config.download_dir, &descriptor)?);
        let store = Arc::new(Mutex::new(PieceStore::new(
            Arc::clone(&descriptor),
            Arc::clone(&files),
        )));
        let ledger = Arc::new(PieceLedger::new(descriptor.piece_count()));
        let stats = Arc::new(TransferStats::default());
        let peer_id = generate_peer_id();
        let cancel = CancellationToken::new();

        let (swarm_tx, swarm_rx) = mpsc::unbounded_channel();
        let swarm = Swarm::new(
            Arc::clone(&descriptor),
            peer_id,
            store,
            Arc::clone(&ledger),
            Arc::clone(&stats),
            config.max_peers,
            cancel.clone(),
            swarm_tx,
        );

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let session = Arc::new(Self {
            descriptor,
            config,
            peer_id,
            files,
            ledger,
            stats,
            swarm,
            tracker: TrackerClient::new(),
            cancel,
            events: events_tx,
            swarm_events: Mutex::new(Some(swarm_rx)),
            status: Mutex::new(TorrentStatus::Starting),
        });
        Ok((session, events_rx))
    }

    pub fn descriptor(&self) -> &TorrentDescriptor {
        &self.descriptor
    }

    pub async fn status(&self) -> TorrentStatus {
        *self.status.lock().await
    }

    /// Announce to the tracker, admit the returned peers and spawn the
    /// background loops: re-announce, choke rounds and event handling.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let _ = self.events.send(TorrentEvent::Status(TorrentStatus::Starting));
        info!(
            name = %self.descriptor.name,
            info_hash = %hex::encode(self.descriptor.info_hash),
            pieces = self.descriptor.piece_count(),
            "starting torrent"
        );

        let announce = self
            .tracker
            .announce(
                &self.descriptor.announce,
                &self.request(Some(AnnounceEvent::Started)),
            )
            .await?;
        let interval = Duration::from_secs(announce.interval)
            .max(MIN_ANNOUNCE_INTERVAL);

        self.swarm.add_peers(announce.peers).await;
        self.swarm.spawn_choke_timer();

        let session = Arc::clone(self);
        self.swarm.tasks().spawn(async move {
            session.announce_loop(interval).await;
        });
        let session = Arc::clone(self);
        self.swarm.tasks().spawn(async move {
            session.event_loop().await;
        });

        self.transition(TorrentStatus::Downloading).await;
        Ok(())
    }

    /// Stop the torrent: disconnect peers, wait out in-flight tasks up to
    /// [`SHUTDOWN_WAIT`], tell the tracker goodbye and sync the files.
    pub async fn stop(self: &Arc<Self>) {
        info!(name = %self.descriptor.name, "stopping torrent");
        self.swarm.shutdown().await;
        if timeout(SHUTDOWN_WAIT, self.swarm.tasks().wait())
            .await
            .is_err()
        {
            warn!("shutdown deadline hit with tasks still running");
        }

        if let Err(err) = self
            .tracker
            .announce(
                &self.descriptor.announce,
                &self.request(Some(AnnounceEvent::Stopped)),
            )
            .await
        {
            debug!(%err, "stopped announce failed");
        }
        if let Err(err) = self.files.sync() {
            warn!(%err, "final sync failed");
        }
        self.transition(TorrentStatus::Stopped).await;
    }

    fn request(&self, event: Option<AnnounceEvent>) -> AnnounceRequest {
        AnnounceRequest {
            info_hash: self.descriptor.info_hash,
            peer_id: self.peer_id,
            port: self.config.listen_port,
            uploaded: self.stats.uploaded(),
            downloaded: self.stats.downloaded(),
            left: self.bytes_left(),
            event,
        }
    }

    fn bytes_left(&self) -> u64 {
        let completed = self.ledger.completed();
        let mut have = 0u64;
        for piece in 0..self.descriptor.piece_count() {
            if completed.has(piece as usize) {
                have += u64::from(self.descriptor.piece_len(piece));
            }
        }
        self.descriptor.total_size - have
    }

    /// Periodic re-announce: refreshes the tracker's view of our progress
    /// and feeds newly announced peers into the swarm.
    async fn announce_loop(self: Arc<Self>, mut interval: Duration) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
            match self
                .tracker
                .announce(&self.descriptor.announce, &self.request(None))
                .await
            {
                Ok(announce) => {
                    interval = Duration::from_secs(announce.interval).max(MIN_ANNOUNCE_INTERVAL);
                    self.swarm.add_peers(announce.peers).await;
                }
                Err(err) => {
                    warn!(%err, "re-announce failed, keeping current interval");
                }
            }
        }
    }

    async fn event_loop(self: Arc<Self>) {
        let Some(mut swarm_events) = self.swarm_events.lock().await.take() else {
            return;
        };
        loop {
            let event = tokio::select! {
                _ = self.cancel.cancelled() => {
                    // The swarm cancels the token on storage failure; drain
                    // anything it queued before the cancellation landed.
                    while let Ok(event) = swarm_events.try_recv() {
                        if !self.handle_swarm_event(event).await {
                            break;
                        }
                    }
                    break;
                }
                event = swarm_events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            if !self.handle_swarm_event(event).await {
                break;
            }
        }
    }

    /// Returns false when the event loop should stop.
    async fn handle_swarm_event(&self, event: SwarmEvent) -> bool {
        match event {
            SwarmEvent::PieceCompleted { piece, completed } => {
                let _ = self.events.send(TorrentEvent::Progress {
                    piece,
                    completed,
                    total: self.descriptor.piece_count(),
                    downloaded: self.stats.downloaded(),
                    uploaded: self.stats.uploaded(),
                });
                true
            }
            SwarmEvent::DownloadComplete => {
                if let Err(err) = self.files.sync() {
                    warn!(%err, "sync after completion failed");
                }
                if let Err(err) = self
                    .tracker
                    .announce(
                        &self.descriptor.announce,
                        &self.request(Some(AnnounceEvent::Completed)),
                    )
                    .await
                {
                    debug!(%err, "completed announce failed");
                }
                self.transition(TorrentStatus::Completed).await;
                true
            }
            SwarmEvent::StorageFailure { reason } => {
                warn!(%reason, "torrent failed");
                self.transition(TorrentStatus::Failed).await;
                false
            }
        }
    }

    /// Move to `next` and notify, unless already in a terminal status.
    /// `Completed` and `Failed` are terminal; `Stopped` never overrides them.
    async fn transition(&self, next: TorrentStatus) {
        let mut status = self.status.lock().await;
        let terminal = matches!(*status, TorrentStatus::Completed | TorrentStatus::Failed);
        if *status == next || terminal {
            return;
        }
        *status = next;
        let _ = self.events.send(TorrentEvent::Status(next));
    }
}
