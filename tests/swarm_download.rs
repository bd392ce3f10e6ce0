//! End-to-end swarm tests against a scripted in-process seeder.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use sha1::{Digest, Sha1};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use bitswarm::piece::{PieceLedger, PieceStore, BLOCK_SIZE};
use bitswarm::storage::FileStore;
use bitswarm::swarm::{Swarm, SwarmEvent, TransferStats};
use bitswarm::torrent::{FileInfo, PieceHashes, TorrentDescriptor};
use bitswarm::tracker::PeerInfo;
use bitswarm::wire::{Bitfield, Handshake, Message, HANDSHAKE_LEN};

const WAIT: Duration = Duration::from_secs(10);

fn descriptor_for(data: &[u8], piece_length: u64) -> TorrentDescriptor {
    let mut raw_hashes = Vec::new();
    for chunk in data.chunks(piece_length as usize) {
        let mut hasher = Sha1::new();
        hasher.update(chunk);
        raw_hashes.extend_from_slice(&hasher.finalize());
    }
    TorrentDescriptor {
        info_hash: [7u8; 20],
        name: "payload".to_string(),
        announce: String::new(),
        piece_length,
        pieces: PieceHashes::from_bytes(&raw_hashes).unwrap(),
        files: vec![FileInfo {
            path: vec!["payload".to_string()],
            length: data.len() as u64,
        }],
        multi_file: false,
        total_size: data.len() as u64,
    }
}

struct Harness {
    swarm: Arc<Swarm>,
    events: mpsc::UnboundedReceiver<SwarmEvent>,
    cancel: CancellationToken,
    dir: tempfile::TempDir,
}

fn harness(descriptor: TorrentDescriptor) -> Harness {
    let descriptor = Arc::new(descriptor);
    let dir = tempfile::tempdir().unwrap();
    let files = Arc::new(FileStore::open(dir.path(), &descriptor).unwrap());
    let store = Arc::new(Mutex::new(PieceStore::new(
        Arc::clone(&descriptor),
        files,
    )));
    let ledger = Arc::new(PieceLedger::new(descriptor.piece_count()));
    let cancel = CancellationToken::new();
    let (tx, rx) = mpsc::unbounded_channel();
    let swarm = Swarm::new(
        Arc::clone(&descriptor),
        *b"-BW0001-AAAAAAAAAAAA",
        store,
        ledger,
        Arc::new(TransferStats::default()),
        10,
        cancel.clone(),
        tx,
    );
    Harness {
        swarm,
        events: rx,
        cancel,
        dir,
    }
}

/// Seeder-side handshake: accept the inbound handshake, verify the info
/// hash and reply with our own.
async fn seeder_handshake(stream: &mut TcpStream, info_hash: [u8; 20]) {
    let mut buf = [0u8; HANDSHAKE_LEN];
    stream.read_exact(&mut buf).await.unwrap();
    let received = Handshake::from_bytes(&buf).unwrap();
    assert_eq!(received.info_hash, info_hash);
    let reply = Handshake::new(info_hash, *b"-SD0001-SSSSSSSSSSSS");
    stream.write_all(&reply.to_bytes()).await.unwrap();
}

async fn send(stream: &mut TcpStream, message: Message) {
    stream.write_all(&message.encode()).await.unwrap();
}

async fn recv(stream: &mut TcpStream) -> Message {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await.unwrap();
    let len = u32::from_be_bytes(len_buf) as usize;
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await.unwrap();
    Message::decode(&body).unwrap()
}

fn full_bitfield(pieces: u32) -> Message {
    let mut bits = Bitfield::new(pieces as usize);
    bits.set_range(0, pieces as usize);
    Message::Bitfield {
        raw: bits.to_wire(),
    }
}

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[tokio::test]
async fn downloads_a_torrent_from_a_single_seeder() {
    let piece_length = u64::from(BLOCK_SIZE) * 2;
    // Two pieces, the second one short.
    let data = payload(piece_length as usize + BLOCK_SIZE as usize / 2);
    let descriptor = descriptor_for(&data, piece_length);
    let info_hash = descriptor.info_hash;

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr: SocketAddr = listener.local_addr().unwrap();

    let seed_data = data.clone();
    let seeder = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        seeder_handshake(&mut stream, info_hash).await;
        send(&mut stream, full_bitfield(2)).await;

        assert_eq!(recv(&mut stream).await, Message::Interested);
        send(&mut stream, Message::Unchoke).await;

        loop {
            match recv(&mut stream).await {
                Message::Request { block } => {
                    let start = block.piece as usize * piece_length as usize
                        + block.begin as usize;
                    let end = start + block.length as usize;
                    send(
                        &mut stream,
                        Message::Piece {
                            piece: block.piece,
                            begin: block.begin,
                            data: seed_data[start..end].to_vec(),
                        },
                    )
                    .await;
                }
                Message::NotInterested | Message::Cancel { .. } => {}
                // HAVE announcements for pieces we already hold.
                Message::Have { .. } => {}
                other => panic!("unexpected message from leecher: {other:?}"),
            }
        }
    });

    let mut harness = harness(descriptor);
    harness
        .swarm
        .add_peers(vec![PeerInfo::new(addr.ip(), addr.port())])
        .await;

    let mut completed_pieces = Vec::new();
    loop {
        match timeout(WAIT, harness.events.recv()).await.unwrap().unwrap() {
            SwarmEvent::PieceCompleted { piece, .. } => completed_pieces.push(piece),
            SwarmEvent::DownloadComplete => break,
            SwarmEvent::StorageFailure { reason } => panic!("storage failure: {reason}"),
        }
    }
    completed_pieces.sort_unstable();
    assert_eq!(completed_pieces, vec![0, 1]);
    assert!(harness.swarm.ledger().is_complete());
    assert_eq!(harness.swarm.stats().downloaded(), data.len() as u64);

    harness.swarm.shutdown().await;
    seeder.abort();

    let written = std::fs::read(harness.dir.path().join("payload")).unwrap();
    assert_eq!(written, data);
}

#[tokio::test]
async fn out_of_range_have_kills_only_that_connection() {
    let data = payload(BLOCK_SIZE as usize);
    let descriptor = descriptor_for(&data, u64::from(BLOCK_SIZE));
    let info_hash = descriptor.info_hash;

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr: SocketAddr = listener.local_addr().unwrap();

    let seeder = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        seeder_handshake(&mut stream, info_hash).await;
        // One piece exists; index 99 is garbage.
        send(&mut stream, Message::Have { piece: 99 }).await;

        // The engine must drop the connection rather than the torrent.
        let mut scratch = [0u8; 64];
        loop {
            match stream.read(&mut scratch).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
        }
    });

    let mut harness = harness(descriptor);
    harness
        .swarm
        .add_peers(vec![PeerInfo::new(addr.ip(), addr.port())])
        .await;

    timeout(WAIT, seeder).await.unwrap().unwrap();
    assert_eq!(harness.swarm.connected_count().await, 0);
    // The torrent itself is still healthy: no events, nothing claimed.
    assert!(harness.events.try_recv().is_err());
    assert!(!harness.swarm.ledger().requested().any());
    harness.cancel.cancel();
}

#[tokio::test]
async fn choke_round_revokes_slots_only_from_departed_or_choking_peers() {
    let data = payload(BLOCK_SIZE as usize);
    let descriptor = descriptor_for(&data, u64::from(BLOCK_SIZE));
    let info_hash = descriptor.info_hash;

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr: SocketAddr = listener.local_addr().unwrap();

    // The seeder reports each stage so the test can drive choke rounds.
    let (stage_tx, mut stage_rx) = mpsc::unbounded_channel::<&'static str>();

    let seed_data = data.clone();
    let seeder = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        seeder_handshake(&mut stream, info_hash).await;
        send(&mut stream, full_bitfield(1)).await;
        // Interested in the leecher, so it qualifies for an unchoke slot
        // once it has contributed a piece.
        send(&mut stream, Message::Interested).await;

        loop {
            match recv(&mut stream).await {
                Message::Interested => {
                    send(&mut stream, Message::Unchoke).await;
                }
                Message::Request { block } => {
                    send(
                        &mut stream,
                        Message::Piece {
                            piece: block.piece,
                            begin: block.begin,
                            data: seed_data[block.begin as usize
                                ..(block.begin + block.length) as usize]
                                .to_vec(),
                        },
                    )
                    .await;
                }
                Message::NotInterested | Message::Have { .. } | Message::Cancel { .. } => {}
                Message::Unchoke => break,
                other => panic!("unexpected message before unchoke: {other:?}"),
            }
        }
        stage_tx.send("unchoked").unwrap();

        // Withdrawing interest must not cost the slot.
        send(&mut stream, Message::NotInterested).await;
        stage_tx.send("not-interested").unwrap();
        match timeout(Duration::from_secs(1), recv(&mut stream)).await {
            Err(_) => {}
            Ok(message) => panic!("slot revoked without cause: {message:?}"),
        }

        // Choking the leecher is a revocation cause.
        send(&mut stream, Message::Choke).await;
        stage_tx.send("choked").unwrap();
        loop {
            match timeout(WAIT, recv(&mut stream)).await.unwrap() {
                Message::Choke => break,
                Message::KeepAlive => {}
                other => panic!("expected choke, got {other:?}"),
            }
        }
    });

    let mut harness = harness(descriptor);
    harness
        .swarm
        .add_peers(vec![PeerInfo::new(addr.ip(), addr.port())])
        .await;

    loop {
        match timeout(WAIT, harness.events.recv()).await.unwrap().unwrap() {
            SwarmEvent::DownloadComplete => break,
            SwarmEvent::PieceCompleted { .. } => {}
            SwarmEvent::StorageFailure { reason } => panic!("storage failure: {reason}"),
        }
    }

    // Round 1: the peer is interested and contributed the piece.
    harness.swarm.run_choke_round().await;
    assert_eq!(
        timeout(WAIT, stage_rx.recv()).await.unwrap(),
        Some("unchoked")
    );

    // Round 2: still connected, still not choking us; the slot holds even
    // though the peer is no longer interested.
    assert_eq!(
        timeout(WAIT, stage_rx.recv()).await.unwrap(),
        Some("not-interested")
    );
    tokio::time::sleep(Duration::from_millis(200)).await;
    harness.swarm.run_choke_round().await;

    // Round 3: the peer now chokes us, which revokes the slot.
    assert_eq!(
        timeout(WAIT, stage_rx.recv()).await.unwrap(),
        Some("choked")
    );
    tokio::time::sleep(Duration::from_millis(200)).await;
    harness.swarm.run_choke_round().await;

    timeout(WAIT, seeder).await.unwrap().unwrap();
    harness.swarm.shutdown().await;
}

#[tokio::test]
async fn choke_cancels_the_pipeline_but_keeps_buffered_blocks() {
    // One piece of three blocks.
    let piece_length = u64::from(BLOCK_SIZE) * 3;
    let data = payload(piece_length as usize);
    let descriptor = descriptor_for(&data, piece_length);
    let info_hash = descriptor.info_hash;

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr: SocketAddr = listener.local_addr().unwrap();

    let seed_data = data.clone();
    let seeder = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        seeder_handshake(&mut stream, info_hash).await;
        send(&mut stream, full_bitfield(1)).await;

        assert_eq!(recv(&mut stream).await, Message::Interested);
        send(&mut stream, Message::Unchoke).await;

        // All three requests arrive pipelined.
        let mut first_round = Vec::new();
        for _ in 0..3 {
            match recv(&mut stream).await {
                Message::Request { block } => first_round.push(block),
                other => panic!("expected request, got {other:?}"),
            }
        }

        // Serve only the first block, then choke.
        let first = first_round[0];
        send(
            &mut stream,
            Message::Piece {
                piece: first.piece,
                begin: first.begin,
                data: seed_data[first.begin as usize..(first.begin + first.length) as usize]
                    .to_vec(),
            },
        )
        .await;
        send(&mut stream, Message::Choke).await;

        // The two unanswered requests come back as cancels.
        let mut cancelled = Vec::new();
        for _ in 0..2 {
            match recv(&mut stream).await {
                Message::Cancel { block } => cancelled.push(block.begin),
                other => panic!("expected cancel, got {other:?}"),
            }
        }
        cancelled.sort_unstable();
        assert_eq!(cancelled, vec![BLOCK_SIZE, BLOCK_SIZE * 2]);

        // Unchoke: the engine resumes from the remaining blocks only.
        send(&mut stream, Message::Unchoke).await;
        let mut second_round = Vec::new();
        for _ in 0..2 {
            match recv(&mut stream).await {
                Message::Request { block } => second_round.push(block),
                other => panic!("expected request, got {other:?}"),
            }
        }
        second_round.sort_by_key(|b| b.begin);
        // Block 0 survived the choke and is never re-requested.
        assert_eq!(second_round[0].begin, BLOCK_SIZE);
        assert_eq!(second_round[1].begin, BLOCK_SIZE * 2);

        for block in second_round {
            let start = block.begin as usize;
            send(
                &mut stream,
                Message::Piece {
                    piece: block.piece,
                    begin: block.begin,
                    data: seed_data[start..start + block.length as usize].to_vec(),
                },
            )
            .await;
        }

        loop {
            match recv(&mut stream).await {
                Message::Have { .. } | Message::NotInterested | Message::Cancel { .. } => {}
                other => panic!("unexpected message from leecher: {other:?}"),
            }
        }
    });

    let mut harness = harness(descriptor);
    harness
        .swarm
        .add_peers(vec![PeerInfo::new(addr.ip(), addr.port())])
        .await;

    loop {
        match timeout(WAIT, harness.events.recv()).await.unwrap().unwrap() {
            SwarmEvent::PieceCompleted { piece, .. } => assert_eq!(piece, 0),
            SwarmEvent::DownloadComplete => break,
            SwarmEvent::StorageFailure { reason } => panic!("storage failure: {reason}"),
        }
    }
    assert!(harness.swarm.ledger().is_complete());

    harness.swarm.shutdown().await;
    seeder.abort();

    let written = std::fs::read(harness.dir.path().join("payload")).unwrap();
    assert_eq!(written, data);
}
