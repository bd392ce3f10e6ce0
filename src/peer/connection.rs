use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::error::{Error, ProtocolViolation, Result};
use crate::piece::{PieceLedger, PieceStore, WriteOutcome};
use crate::swarm::{Swarm, TransferStats};
use crate::torrent::TorrentDescriptor;
use crate::wire::{Bitfield, BlockInfo, Handshake, Message, HANDSHAKE_LEN};

use super::{PeerFlags, PieceDownload, MAX_REQUEST_SIZE};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Dial a peer and run the blocking handshake phase. Returns the stream,
/// positioned at the start of the framed-message phase, together with the
/// peer id the remote actually presented. Failure here is a failed connect,
/// not a disconnect; the peer was never part of the swarm.
pub async fn establish(
    addr: SocketAddr,
    info_hash: [u8; 20],
    our_peer_id: [u8; 20],
    expected_peer_id: Option<[u8; 20]>,
) -> Result<(TcpStream, [u8; 20])> {
    let mut stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| timed_out("connect"))??;

    let handshake = Handshake::new(info_hash, our_peer_id);
    let received = timeout(HANDSHAKE_TIMEOUT, async {
        stream.write_all(&handshake.to_bytes()).await?;
        let mut buf = [0u8; HANDSHAKE_LEN];
        stream
            .read_exact(&mut buf)
            .await
            .map_err(|err| match err.kind() {
                std::io::ErrorKind::UnexpectedEof => Error::ConnectionClosed,
                _ => Error::Io(err),
            })?;
        Handshake::from_bytes(&buf)
    })
    .await
    .map_err(|_| timed_out("handshake"))??;

    received.validate(&info_hash, expected_peer_id.as_ref())?;
    debug!(%addr, peer_id = %hex::encode(received.peer_id), "handshake complete");
    Ok((stream, received.peer_id))
}

fn timed_out(phase: &str) -> Error {
    Error::Io(std::io::Error::new(
        std::io::ErrorKind::TimedOut,
        format!("{phase} timed out"),
    ))
}

/// Mutable per-connection state, guarded by one async mutex. Handlers lock
/// it, mutate, and drop the guard before calling back into the swarm.
struct State {
    flags: PeerFlags,
    /// Pieces the remote peer has announced via BITFIELD and HAVE.
    available: Bitfield,
    /// Pieces this peer delivered to us and that verified.
    contributed: Bitfield,
    download: Option<PieceDownload>,
    connected: bool,
}

/// One handshaken remote peer. Shared between the reader task, the writer
/// task and the swarm scheduler; all message handling funnels through
/// [`Peer::handle_message`].
pub struct Peer {
    addr: SocketAddr,
    peer_id: [u8; 20],
    descriptor: Arc<TorrentDescriptor>,
    store: Arc<Mutex<PieceStore>>,
    ledger: Arc<PieceLedger>,
    stats: Arc<TransferStats>,
    state: Mutex<State>,
    outbound: mpsc::Sender<Message>,
    cancel: CancellationToken,
}

impl Peer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        addr: SocketAddr,
        peer_id: [u8; 20],
        descriptor: Arc<TorrentDescriptor>,
        store: Arc<Mutex<PieceStore>>,
        ledger: Arc<PieceLedger>,
        stats: Arc<TransferStats>,
        outbound: mpsc::Sender<Message>,
        cancel: CancellationToken,
    ) -> Self {
        let pieces = descriptor.piece_count() as usize;
        Self {
            addr,
            peer_id,
            descriptor,
            store,
            ledger,
            stats,
            state: Mutex::new(State {
                flags: PeerFlags::default(),
                available: Bitfield::new(pieces),
                contributed: Bitfield::new(pieces),
                download: None,
                connected: true,
            }),
            outbound,
            cancel,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn peer_id(&self) -> &[u8; 20] {
        &self.peer_id
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub async fn is_connected(&self) -> bool {
        self.state.lock().await.connected
    }

    pub async fn flags(&self) -> PeerFlags {
        self.state.lock().await.flags
    }

    pub async fn available(&self) -> Bitfield {
        self.state.lock().await.available.clone()
    }

    pub async fn contributed_count(&self) -> usize {
        self.state.lock().await.contributed.count()
    }

    /// Whether the peer has no piece download in progress.
    pub async fn is_idle(&self) -> bool {
        self.state.lock().await.download.is_none()
    }

    /// Queue a message for the writer task. A closed channel means the
    /// writer already exited; the disconnect path handles cleanup.
    pub async fn send(&self, message: Message) {
        if self.outbound.send(message).await.is_err() {
            trace!(addr = %self.addr, "outbound channel closed, message dropped");
        }
    }

    /// Choke the peer. Edge-triggered: a no-op if we already choke them.
    pub async fn choke(&self) {
        let transition = {
            let mut state = self.state.lock().await;
            !std::mem::replace(&mut state.flags.am_choking, true)
        };
        if transition {
            debug!(addr = %self.addr, "choking peer");
            self.send(Message::Choke).await;
        }
    }

    /// Unchoke the peer. Edge-triggered.
    pub async fn unchoke(&self) {
        let transition = {
            let mut state = self.state.lock().await;
            std::mem::replace(&mut state.flags.am_choking, false)
        };
        if transition {
            debug!(addr = %self.addr, "unchoking peer");
            self.send(Message::Unchoke).await;
        }
    }

    /// Declare interest in the peer's pieces. Edge-triggered.
    pub async fn start_interested(&self) {
        let transition = {
            let mut state = self.state.lock().await;
            !std::mem::replace(&mut state.flags.am_interested, true)
        };
        if transition {
            self.send(Message::Interested).await;
        }
    }

    /// Withdraw interest. Edge-triggered.
    pub async fn stop_interested(&self) {
        let transition = {
            let mut state = self.state.lock().await;
            std::mem::replace(&mut state.flags.am_interested, false)
        };
        if transition {
            self.send(Message::NotInterested).await;
        }
    }

    /// Begin downloading `piece` from this peer, requesting the given
    /// blocks through the bounded pipeline. The caller has already claimed
    /// the piece in the ledger.
    pub async fn download_piece(&self, piece: u32, blocks: Vec<BlockInfo>) -> Result<()> {
        let requests = {
            let mut state = self.state.lock().await;
            if !state.connected {
                return Err(Error::NotConnected);
            }
            let mut download = PieceDownload::new(piece, blocks);
            let requests = download.fill();
            state.download = Some(download);
            requests
        };
        info!(addr = %self.addr, piece, requests = requests.len(), "starting piece download");
        for block in requests {
            self.send(Message::Request { block }).await;
        }
        Ok(())
    }

    /// Dispatch one inbound message. A returned error is a protocol
    /// violation or a torrent-fatal storage failure; the reader loop tears
    /// the connection down on any error.
    pub async fn handle_message(self: &Arc<Self>, swarm: &Arc<Swarm>, message: Message) -> Result<()> {
        trace!(addr = %self.addr, ?message, "inbound message");
        match message {
            Message::KeepAlive => Ok(()),
            Message::Choke => self.on_choke(swarm).await,
            Message::Unchoke => self.on_unchoke(swarm).await,
            Message::Interested => self.on_interested().await,
            Message::NotInterested => self.on_not_interested().await,
            Message::Have { piece } => self.on_have(swarm, piece).await,
            Message::Bitfield { raw } => self.on_bitfield(swarm, &raw).await,
            Message::Request { block } => self.on_request(swarm, block).await,
            Message::Piece { piece, begin, data } => {
                self.on_piece(swarm, piece, begin, data).await
            }
            Message::Cancel { block } => {
                // We answer requests inline, so there is nothing queued to cancel.
                trace!(addr = %self.addr, ?block, "ignoring cancel");
                Ok(())
            }
            Message::Port { port } => {
                trace!(addr = %self.addr, port, "ignoring DHT port");
                Ok(())
            }
        }
    }

    async fn on_choke(self: &Arc<Self>, swarm: &Arc<Swarm>) -> Result<()> {
        let (cancels, released) = {
            let mut state = self.state.lock().await;
            if state.flags.peer_choking {
                trace!(addr = %self.addr, "duplicate choke");
                return Ok(());
            }
            state.flags.peer_choking = true;
            match state.download.take() {
                Some(mut download) => (download.drain(), Some(download.piece())),
                None => (Vec::new(), None),
            }
        };

        debug!(addr = %self.addr, released, "peer choked us");
        for block in cancels {
            self.send(Message::Cancel { block }).await;
        }
        if let Some(piece) = released {
            // Buffered bytes stay in the piece store; only the claim is
            // returned so another peer can pick up the remainder.
            self.ledger.release(piece);
        }
        swarm.on_peer_choked(self).await;
        Ok(())
    }

    async fn on_unchoke(self: &Arc<Self>, swarm: &Arc<Swarm>) -> Result<()> {
        let transition = {
            let mut state = self.state.lock().await;
            std::mem::replace(&mut state.flags.peer_choking, false)
        };
        if !transition {
            trace!(addr = %self.addr, "duplicate unchoke");
            return Ok(());
        }
        debug!(addr = %self.addr, "peer unchoked us");
        swarm.on_peer_unchoked(self).await;
        Ok(())
    }

    async fn on_interested(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if !state.flags.peer_interested {
            state.flags.peer_interested = true;
            debug!(addr = %self.addr, "peer is interested");
        }
        Ok(())
    }

    async fn on_not_interested(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.flags.peer_interested {
            state.flags.peer_interested = false;
            debug!(addr = %self.addr, "peer is no longer interested");
        }
        Ok(())
    }

    async fn on_have(self: &Arc<Self>, swarm: &Arc<Swarm>, piece: u32) -> Result<()> {
        if !self.descriptor.in_range(piece) {
            return Err(ProtocolViolation::PieceIndexOutOfRange {
                index: piece,
                pieces: self.descriptor.piece_count(),
            }
            .into());
        }
        {
            let mut state = self.state.lock().await;
            state.available.set(piece as usize);
        }
        swarm.on_peer_has_piece(self, piece).await;
        Ok(())
    }

    async fn on_bitfield(self: &Arc<Self>, swarm: &Arc<Swarm>, raw: &[u8]) -> Result<()> {
        let bits = Bitfield::from_wire(raw, self.descriptor.piece_count() as usize)?;
        {
            let mut state = self.state.lock().await;
            state.available.union_with(&bits);
        }
        debug!(addr = %self.addr, pieces = bits.count(), "peer bitfield received");
        swarm.on_peer_bitfield(self).await;
        Ok(())
    }

    async fn on_request(self: &Arc<Self>, swarm: &Arc<Swarm>, block: BlockInfo) -> Result<()> {
        let am_choking = self.state.lock().await.flags.am_choking;
        if am_choking {
            return Err(ProtocolViolation::RequestWhileChoked.into());
        }
        if !self.descriptor.in_range(block.piece) {
            return Err(ProtocolViolation::PieceIndexOutOfRange {
                index: block.piece,
                pieces: self.descriptor.piece_count(),
            }
            .into());
        }
        if block.length > MAX_REQUEST_SIZE {
            return Err(ProtocolViolation::OversizedRequest {
                length: block.length,
                max: MAX_REQUEST_SIZE,
            }
            .into());
        }
        let piece_len = self.descriptor.piece_len(block.piece);
        if block.begin as u64 + block.length as u64 > piece_len as u64 {
            return Err(ProtocolViolation::BlockOutOfRange {
                index: block.piece,
                begin: block.begin,
                length: block.length,
            }
            .into());
        }

        let read = {
            let store = self.store.lock().await;
            if !store.is_available(block.piece) {
                return Err(ProtocolViolation::RequestUnavailablePiece { index: block.piece }.into());
            }
            store.read_block(block.piece, block.begin, block.length)
        };
        let data = match read {
            Ok(data) => data,
            Err(err) if err.is_storage_failure() => {
                swarm.on_storage_failure(&err).await;
                return Err(err);
            }
            Err(err) => return Err(err),
        };

        trace!(addr = %self.addr, piece = block.piece, begin = block.begin, "serving block");
        self.send(Message::Piece {
            piece: block.piece,
            begin: block.begin,
            data,
        })
        .await;
        self.stats.add_uploaded(block.length as u64);
        Ok(())
    }

    async fn on_piece(
        self: &Arc<Self>,
        swarm: &Arc<Swarm>,
        piece: u32,
        begin: u32,
        data: Vec<u8>,
    ) -> Result<()> {
        if !self.descriptor.in_range(piece) {
            return Err(ProtocolViolation::PieceIndexOutOfRange {
                index: piece,
                pieces: self.descriptor.piece_count(),
            }
            .into());
        }
        let piece_len = self.descriptor.piece_len(piece);
        if begin as u64 + data.len() as u64 > piece_len as u64 {
            return Err(ProtocolViolation::BlockOutOfRange {
                index: piece,
                begin,
                length: data.len() as u32,
            }
            .into());
        }

        let outcome = {
            let mut state = self.state.lock().await;
            let solicited = state
                .download
                .as_mut()
                .is_some_and(|d| d.resolve(piece, begin, data.len() as u32));
            if !solicited {
                trace!(addr = %self.addr, piece, begin, "unsolicited block");
            }
            let mut store = self.store.lock().await;
            store.write_block(piece, begin, &data)
        };

        match outcome {
            Err(err) if err.is_storage_failure() => {
                swarm.on_storage_failure(&err).await;
                Err(err)
            }
            Err(err) => Err(err),
            Ok(WriteOutcome::AlreadyAvailable) => {
                trace!(addr = %self.addr, piece, "late block for a verified piece");
                Ok(())
            }
            Ok(WriteOutcome::Buffered) => {
                let requests = {
                    let mut state = self.state.lock().await;
                    state
                        .download
                        .as_mut()
                        .map(|d| d.fill())
                        .unwrap_or_default()
                };
                for block in requests {
                    self.send(Message::Request { block }).await;
                }
                Ok(())
            }
            Ok(WriteOutcome::Verified) => {
                let cancels = {
                    let mut state = self.state.lock().await;
                    state.contributed.set(piece as usize);
                    if state.download.as_ref().map(PieceDownload::piece) == Some(piece) {
                        state
                            .download
                            .take()
                            .map(|mut d| d.drain())
                            .unwrap_or_default()
                    } else {
                        Vec::new()
                    }
                };
                for block in cancels {
                    self.send(Message::Cancel { block }).await;
                }
                self.ledger.commit(piece);
                self.stats.add_downloaded(piece_len as u64);
                info!(addr = %self.addr, piece, "piece completed");
                swarm.on_piece_completed(self, piece).await;
                Ok(())
            }
            Ok(WriteOutcome::HashMismatch) => {
                {
                    let mut state = self.state.lock().await;
                    if state.download.as_ref().map(PieceDownload::piece) == Some(piece) {
                        state.download = None;
                    }
                }
                warn!(addr = %self.addr, piece, "piece failed verification, releasing claim");
                self.ledger.release(piece);
                swarm.on_piece_failed(self).await;
                Ok(())
            }
        }
    }

    /// Orderly shutdown of this connection: cancel in-flight requests,
    /// withdraw interest, release any claimed piece and leave the swarm.
    /// Idempotent.
    pub async fn disconnect(self: &Arc<Self>, swarm: &Arc<Swarm>) {
        let Some((cancels, withdraw, released)) = self.teardown().await else {
            return;
        };
        for block in cancels {
            self.send(Message::Cancel { block }).await;
        }
        if withdraw {
            self.send(Message::NotInterested).await;
        }
        // Give the writer a chance to flush the farewell messages.
        tokio::task::yield_now().await;
        self.finish(swarm, released).await;
    }

    /// Teardown after an I/O failure or protocol violation. No farewell
    /// messages; the socket is already useless. Idempotent.
    pub async fn abrupt_disconnect(self: &Arc<Self>, swarm: &Arc<Swarm>) {
        let Some((_, _, released)) = self.teardown().await else {
            return;
        };
        self.finish(swarm, released).await;
    }

    async fn teardown(&self) -> Option<(Vec<BlockInfo>, bool, Option<u32>)> {
        let mut state = self.state.lock().await;
        if !state.connected {
            return None;
        }
        state.connected = false;
        let (cancels, released) = match state.download.take() {
            Some(mut download) => (download.drain(), Some(download.piece())),
            None => (Vec::new(), None),
        };
        let withdraw = std::mem::replace(&mut state.flags.am_interested, false);
        Some((cancels, withdraw, released))
    }

    async fn finish(self: &Arc<Self>, swarm: &Arc<Swarm>, released: Option<u32>) {
        if let Some(piece) = released {
            self.ledger.release(piece);
        }
        self.cancel.cancel();
        info!(addr = %self.addr, released, "peer disconnected");
        swarm.on_peer_disconnected(self, released).await;
    }
}
