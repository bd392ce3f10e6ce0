//! The message pump for one peer: a reader task that frames and dispatches
//! inbound messages, and a writer task that drains the outbound queue and
//! keeps an idle link alive.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::task::TaskTracker;
use tracing::{debug, trace, warn};

use crate::error::{Error, ProtocolViolation, Result};
use crate::swarm::Swarm;
use crate::wire::Message;

use super::Peer;

/// A keep-alive goes out whenever the writer has been idle this long.
pub const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(120);

/// Upper bound on a single frame body. The largest legitimate frame is a
/// PIECE message carrying one block; anything near a megabyte is garbage.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Split the stream and spawn the reader and writer tasks on the swarm's
/// task tracker. Both tasks exit on the peer's cancellation token.
pub fn start_link(
    tracker: &TaskTracker,
    stream: TcpStream,
    peer: Arc<Peer>,
    swarm: Arc<Swarm>,
    outbound: mpsc::Receiver<Message>,
) {
    let (read_half, write_half) = stream.into_split();
    tracker.spawn(read_loop(read_half, Arc::clone(&peer), Arc::clone(&swarm)));
    tracker.spawn(write_loop(write_half, peer, swarm, outbound));
}

async fn read_loop(mut stream: OwnedReadHalf, peer: Arc<Peer>, swarm: Arc<Swarm>) {
    let cancel = peer.cancel_token().clone();
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = read_frame(&mut stream) => frame,
        };

        let body = match frame {
            Ok(body) => body,
            Err(Error::ConnectionClosed) => {
                debug!(addr = %peer.addr(), "peer closed the connection");
                peer.abrupt_disconnect(&swarm).await;
                break;
            }
            Err(err) => {
                warn!(addr = %peer.addr(), %err, "read failed, dropping connection");
                peer.abrupt_disconnect(&swarm).await;
                break;
            }
        };

        let message = match Message::decode(&body) {
            Ok(message) => message,
            Err(err) => {
                warn!(addr = %peer.addr(), %err, "undecodable message, dropping connection");
                peer.abrupt_disconnect(&swarm).await;
                break;
            }
        };

        if let Err(err) = peer.handle_message(&swarm, message).await {
            warn!(addr = %peer.addr(), %err, "peer misbehaved, dropping connection");
            peer.abrupt_disconnect(&swarm).await;
            break;
        }
    }
    trace!(addr = %peer.addr(), "reader exiting");
}

/// Read one length-prefixed frame body. A zero length is a keep-alive and
/// comes back as an empty body.
async fn read_frame(stream: &mut OwnedReadHalf) -> Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    stream
        .read_exact(&mut len_buf)
        .await
        .map_err(eof_as_closed)?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(ProtocolViolation::OversizedFrame { length: len }.into());
    }

    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await.map_err(eof_as_closed)?;
    Ok(body)
}

fn eof_as_closed(err: std::io::Error) -> Error {
    match err.kind() {
        std::io::ErrorKind::UnexpectedEof => Error::ConnectionClosed,
        _ => Error::Io(err),
    }
}

async fn write_loop(
    mut stream: tokio::net::tcp::OwnedWriteHalf,
    peer: Arc<Peer>,
    swarm: Arc<Swarm>,
    mut outbound: mpsc::Receiver<Message>,
) {
    let cancel = peer.cancel_token().clone();
    loop {
        let queued = tokio::select! {
            _ = cancel.cancelled() => {
                // Flush whatever is already queued (cancels, not-interested)
                // before the socket goes away.
                while let Ok(message) = outbound.try_recv() {
                    if stream.write_all(&message.encode()).await.is_err() {
                        break;
                    }
                }
                break;
            }
            queued = timeout(KEEP_ALIVE_INTERVAL, outbound.recv()) => queued,
        };

        let message = match queued {
            Ok(Some(message)) => message,
            // All senders dropped; the peer is gone.
            Ok(None) => break,
            // Idle for the whole interval.
            Err(_) => Message::KeepAlive,
        };

        if let Err(err) = stream.write_all(&message.encode()).await {
            warn!(addr = %peer.addr(), %err, "write failed, dropping connection");
            peer.abrupt_disconnect(&swarm).await;
            break;
        }
    }
    trace!(addr = %peer.addr(), "writer exiting");
}
