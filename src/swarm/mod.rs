//! Torrent-wide peer coordination: admitting tracker-announced peers,
//! assigning pieces, running the periodic choke rounds and fanning HAVE
//! announcements out to the swarm.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::error::Error;
use crate::peer::{establish, start_link, Peer};
use crate::piece::{PieceLedger, PieceStore};
use crate::torrent::TorrentDescriptor;
use crate::tracker::PeerInfo;
use crate::wire::Message;

/// How often the choke round re-evaluates which peers stay unchoked.
pub const CHOKE_ROUND_INTERVAL: Duration = Duration::from_secs(30);

/// How many unchoke slots the choke round maintains.
pub const UNCHOKE_QUOTA: usize = 4;

/// Outbound message queue depth per peer.
const OUTBOUND_QUEUE: usize = 64;

/// Bytes moved in each direction, shared by every connection of a torrent.
#[derive(Default)]
pub struct TransferStats {
    uploaded: AtomicU64,
    downloaded: AtomicU64,
}

impl TransferStats {
    pub fn add_uploaded(&self, bytes: u64) {
        self.uploaded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_downloaded(&self, bytes: u64) {
        self.downloaded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn uploaded(&self) -> u64 {
        self.uploaded.load(Ordering::Relaxed)
    }

    pub fn downloaded(&self) -> u64 {
        self.downloaded.load(Ordering::Relaxed)
    }
}

/// Notifications the swarm raises towards its session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SwarmEvent {
    PieceCompleted { piece: u32, completed: usize },
    DownloadComplete,
    StorageFailure { reason: String },
}

struct PeerTable {
    connected: HashMap<SocketAddr, Arc<Peer>>,
    /// Addresses currently dialed or connected, for duplicate suppression.
    known_addrs: HashSet<SocketAddr>,
    /// Peer ids seen in completed handshakes.
    known_ids: HashSet<[u8; 20]>,
    /// Peers holding an unchoke slot, carried across choke rounds.
    unchoked: HashSet<SocketAddr>,
}

/// The scheduler for one torrent's swarm.
pub struct Swarm {
    descriptor: Arc<TorrentDescriptor>,
    our_peer_id: [u8; 20],
    store: Arc<Mutex<PieceStore>>,
    ledger: Arc<PieceLedger>,
    stats: Arc<TransferStats>,
    peers: Mutex<PeerTable>,
    connect_permits: Arc<Semaphore>,
    tasks: TaskTracker,
    cancel: CancellationToken,
    events: mpsc::UnboundedSender<SwarmEvent>,
}

impl Swarm {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        descriptor: Arc<TorrentDescriptor>,
        our_peer_id: [u8; 20],
        store: Arc<Mutex<PieceStore>>,
        ledger: Arc<PieceLedger>,
        stats: Arc<TransferStats>,
        max_peers: usize,
        cancel: CancellationToken,
        events: mpsc::UnboundedSender<SwarmEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            descriptor,
            our_peer_id,
            store,
            ledger,
            stats,
            peers: Mutex::new(PeerTable {
                connected: HashMap::new(),
                known_addrs: HashSet::new(),
                known_ids: HashSet::new(),
                unchoked: HashSet::new(),
            }),
            connect_permits: Arc::new(Semaphore::new(max_peers)),
            tasks: TaskTracker::new(),
            cancel,
            events,
        })
    }

    pub fn tasks(&self) -> &TaskTracker {
        &self.tasks
    }

    pub fn ledger(&self) -> &PieceLedger {
        &self.ledger
    }

    pub fn stats(&self) -> &TransferStats {
        &self.stats
    }

    pub async fn connected_count(&self) -> usize {
        self.peers.lock().await.connected.len()
    }

    /// Admit a batch of tracker-announced peers, skipping ourselves and
    /// anything already dialed or connected. Each admitted peer is dialed
    /// on its own task, gated by the connection-limit semaphore.
    pub async fn add_peers(self: &Arc<Self>, announced: Vec<PeerInfo>) {
        for info in announced {
            {
                let mut table = self.peers.lock().await;
                if info.peer_id == Some(self.our_peer_id) {
                    continue;
                }
                if table.known_addrs.contains(&info.addr) {
                    continue;
                }
                if let Some(id) = info.peer_id {
                    if table.known_ids.contains(&id) {
                        continue;
                    }
                }
                table.known_addrs.insert(info.addr);
            }

            let swarm = Arc::clone(self);
            self.tasks.spawn(async move {
                swarm.connect_peer(info).await;
            });
        }
    }

    async fn connect_peer(self: &Arc<Self>, info: PeerInfo) {
        let Ok(permit) = Arc::clone(&self.connect_permits).acquire_owned().await else {
            return;
        };
        if self.cancel.is_cancelled() {
            return;
        }

        let connected = establish(
            info.addr,
            self.descriptor.info_hash,
            self.our_peer_id,
            info.peer_id,
        )
        .await;

        let (stream, peer_id) = match connected {
            Ok(pair) => pair,
            Err(err) => {
                debug!(addr = %info.addr, %err, "connect failed");
                self.peers.lock().await.known_addrs.remove(&info.addr);
                return;
            }
        };

        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE);
        let peer = Arc::new(Peer::new(
            info.addr,
            peer_id,
            Arc::clone(&self.descriptor),
            Arc::clone(&self.store),
            Arc::clone(&self.ledger),
            Arc::clone(&self.stats),
            tx,
            self.cancel.child_token(),
        ));

        {
            let mut table = self.peers.lock().await;
            if peer_id == self.our_peer_id || !table.known_ids.insert(peer_id) {
                debug!(addr = %info.addr, "duplicate peer after handshake, dropping");
                table.known_addrs.remove(&info.addr);
                return;
            }
            table.connected.insert(info.addr, Arc::clone(&peer));
        }

        // The permit lives as long as the connection does.
        let watch = peer.cancel_token().clone();
        self.tasks.spawn(async move {
            watch.cancelled().await;
            drop(permit);
        });

        info!(addr = %info.addr, peer_id = %hex::encode(peer_id), "peer joined the swarm");
        start_link(&self.tasks, stream, Arc::clone(&peer), Arc::clone(self), rx);

        let completed = self.ledger.completed();
        if completed.any() {
            peer.send(Message::Bitfield {
                raw: completed.to_wire(),
            })
            .await;
        }
    }

    /// Called after a peer's BITFIELD arrived: declare interest if it has
    /// anything we still want.
    pub async fn on_peer_bitfield(self: &Arc<Self>, peer: &Arc<Peer>) {
        self.update_interest(peer).await;
    }

    /// Called for each HAVE: the piece may make the peer newly interesting,
    /// and an idle unchoked peer can start on it right away.
    pub async fn on_peer_has_piece(self: &Arc<Self>, peer: &Arc<Peer>, _piece: u32) {
        self.update_interest(peer).await;
        let flags = peer.flags().await;
        if !flags.peer_choking && peer.is_idle().await {
            self.start_next_download(peer).await;
        }
    }

    pub async fn on_peer_unchoked(self: &Arc<Self>, peer: &Arc<Peer>) {
        if peer.is_idle().await {
            self.start_next_download(peer).await;
        }
    }

    /// The peer already cancelled its pipeline and released its claim;
    /// the piece goes back to the pool and other peers pick it up through
    /// normal selection.
    pub async fn on_peer_choked(self: &Arc<Self>, peer: &Arc<Peer>) {
        debug!(addr = %peer.addr(), "download paused by remote choke");
    }

    /// A piece verified and hit the disk: tell every peer that lacks it,
    /// drop interest in peers with nothing left for us, and keep the
    /// delivering peer busy.
    pub async fn on_piece_completed(self: &Arc<Self>, peer: &Arc<Peer>, piece: u32) {
        let _ = self.events.send(SwarmEvent::PieceCompleted {
            piece,
            completed: self.ledger.completed_count(),
        });

        let others: Vec<Arc<Peer>> = self.peers.lock().await.connected.values().cloned().collect();
        for other in others {
            if !other.available().await.has(piece as usize) {
                other.send(Message::Have { piece }).await;
            }
            self.update_interest(&other).await;
        }

        if self.ledger.is_complete() {
            info!("all pieces verified, download complete");
            let _ = self.events.send(SwarmEvent::DownloadComplete);
            return;
        }

        let flags = peer.flags().await;
        if !flags.peer_choking {
            self.start_next_download(peer).await;
        }
    }

    /// The piece came back corrupt; its claim is already released. Let the
    /// same peer try again, most likely on the piece it just failed.
    pub async fn on_piece_failed(self: &Arc<Self>, peer: &Arc<Peer>) {
        let flags = peer.flags().await;
        if !flags.peer_choking && peer.is_connected().await {
            self.start_next_download(peer).await;
        }
    }

    /// Remove a departed peer and, if it abandoned a claimed piece, hand
    /// that piece to an idle peer that can serve it.
    pub async fn on_peer_disconnected(self: &Arc<Self>, peer: &Arc<Peer>, released: Option<u32>) {
        {
            let mut table = self.peers.lock().await;
            table.connected.remove(&peer.addr());
            table.known_addrs.remove(&peer.addr());
            table.known_ids.remove(peer.peer_id());
            table.unchoked.remove(&peer.addr());
        }

        let Some(piece) = released else {
            return;
        };
        let candidates: Vec<Arc<Peer>> =
            self.peers.lock().await.connected.values().cloned().collect();
        for candidate in candidates {
            let flags = candidate.flags().await;
            if flags.peer_choking || !candidate.is_idle().await {
                continue;
            }
            if !candidate.available().await.has(piece as usize) {
                continue;
            }
            self.start_next_download(&candidate).await;
            break;
        }
    }

    /// Disk trouble is fatal to the torrent, not to one connection.
    pub async fn on_storage_failure(&self, err: &Error) {
        error!(%err, "storage failure, aborting torrent");
        let _ = self.events.send(SwarmEvent::StorageFailure {
            reason: err.to_string(),
        });
        self.cancel.cancel();
    }

    /// Claim the lowest wanted piece this peer can serve and start the
    /// download. The claim is returned on any failure to start.
    pub async fn start_next_download(self: &Arc<Self>, peer: &Arc<Peer>) {
        let available = peer.available().await;
        let Some(piece) = self.ledger.claim_next(&available) else {
            return;
        };

        let blocks = self.store.lock().await.unfilled_blocks(piece);
        if blocks.is_empty() {
            warn!(piece, "claimed piece has no blocks left to request");
            self.ledger.release(piece);
            return;
        }
        if let Err(err) = peer.download_piece(piece, blocks).await {
            debug!(addr = %peer.addr(), piece, %err, "could not start download");
            self.ledger.release(piece);
        }
    }

    async fn update_interest(&self, peer: &Arc<Peer>) {
        let available = peer.available().await;
        if self.ledger.wanted(&available).any() {
            peer.start_interested().await;
        } else {
            peer.stop_interested().await;
        }
    }

    /// Spawn the periodic choke round.
    pub fn spawn_choke_timer(self: &Arc<Self>) {
        let swarm = Arc::clone(self);
        self.tasks.spawn(async move {
            let mut ticker = tokio::time::interval(CHOKE_ROUND_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it so peers get a
            // chance to declare interest first.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = swarm.cancel.cancelled() => break,
                    _ = ticker.tick() => swarm.run_choke_round().await,
                }
            }
        });
    }

    /// One choke round, in two steps over the persistent unchoke set.
    /// Revoke: a peer keeps its slot unless it disconnected or is choking
    /// us. Fill: free slots go to interested peers we still choke that have
    /// delivered at least one verified piece, scanned in address order.
    pub async fn run_choke_round(&self) {
        let (connected, mut unchoked) = {
            let table = self.peers.lock().await;
            (table.connected.clone(), table.unchoked.clone())
        };

        unchoked.retain(|addr| connected.contains_key(addr));
        let mut revoked = Vec::new();
        for addr in unchoked.clone() {
            let peer = &connected[&addr];
            if peer.flags().await.peer_choking {
                revoked.push(Arc::clone(peer));
                unchoked.remove(&addr);
            }
        }
        for peer in revoked {
            peer.choke().await;
        }

        let mut candidates: Vec<Arc<Peer>> = connected.values().cloned().collect();
        candidates.sort_by_key(|peer| peer.addr());
        for peer in candidates {
            if unchoked.len() >= UNCHOKE_QUOTA {
                break;
            }
            if unchoked.contains(&peer.addr()) {
                continue;
            }
            let flags = peer.flags().await;
            if flags.peer_interested
                && flags.am_choking
                && peer.contributed_count().await >= 1
            {
                peer.unchoke().await;
                unchoked.insert(peer.addr());
            }
        }

        debug!(
            peers = connected.len(),
            unchoked = unchoked.len(),
            "choke round"
        );
        self.peers.lock().await.unchoked = unchoked;
    }

    /// Orderly shutdown: disconnect every peer, then stop accepting new
    /// tasks. The caller awaits the task tracker with its own deadline.
    pub async fn shutdown(self: &Arc<Self>) {
        let peers: Vec<Arc<Peer>> = self.peers.lock().await.connected.values().cloned().collect();
        for peer in peers {
            peer.disconnect(self).await;
        }
        self.cancel.cancel();
        self.tasks.close();
    }
}
