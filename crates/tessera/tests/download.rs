use std::{
    net::SocketAddr,
    path::PathBuf,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use futures::{SinkExt, StreamExt};
use rand::{distributions::Alphanumeric, Rng};
use tessera::{
    bencode::{encode, Dict, Value},
    bitfield::{Bitfield, BitfieldExt},
    config::Config,
    disk::Disk,
    error::Error,
    metainfo::{InfoHash, MetaInfo},
    peer::PeerId,
    tcp_wire::{Block, Core, CoreCodec, Handshake, HandshakeCodec},
    torrent::Torrent,
};
use tokio::{
    io::AsyncWriteExt,
    net::{TcpListener, TcpStream},
    spawn,
    time::{sleep, timeout},
};
use tokio_util::codec::{Framed, FramedParts};
use tracing_subscriber::EnvFilter;

const PIECE_LENGTH: u32 = 16384;

/// How a fake seeder behaves once a leecher connects.
#[derive(Clone, Copy, Default)]
struct Behavior {
    /// Wait this long before unchoking.
    unchoke_delay: Duration,
    /// Answer requests with flipped bytes.
    corrupt: bool,
    /// Close the socket on the first request instead of answering.
    drop_on_request: bool,
    /// Answer the handshake with another info-hash.
    wrong_info_hash: bool,
    /// Send an unchoke frame with a payload, which is invalid.
    malformed_unchoke: bool,
    /// Choke right after the first unchoke, then unchoke again later.
    choke_after_unchoke: bool,
    /// Never send anything after the bitfield.
    silent: bool,
}

struct Seeder {
    addr: SocketAddr,
    /// Connections accepted so far.
    connections: Arc<AtomicUsize>,
    /// Requests received so far, over every connection.
    requests: Arc<AtomicUsize>,
}

fn random_data(len: usize) -> Vec<u8> {
    let mut rng = rand::thread_rng();
    (0..len).map(|_| rng.gen()).collect()
}

fn temp_path() -> PathBuf {
    let name: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(16)
        .map(char::from)
        .collect();
    std::env::temp_dir().join(format!("tessera-{name}")).join("file.bin")
}

fn meta_info(data: &[u8]) -> MetaInfo {
    let mut pieces = Vec::new();
    for chunk in data.chunks(PIECE_LENGTH as usize) {
        pieces.extend_from_slice(&InfoHash::digest(chunk).0);
    }

    let mut info = Dict::new();
    info.insert("length", data.len() as i64);
    info.insert("name", "file.bin");
    info.insert("piece length", PIECE_LENGTH as i64);
    info.insert("pieces", pieces);

    let mut root = Dict::new();
    root.insert("announce", "http://127.0.0.1:1/announce");
    root.insert("info", info);

    MetaInfo::from_bytes(&encode(&Value::from(root))).unwrap()
}

fn config() -> Config {
    Config {
        connect_attempts: 1,
        connect_timeout_secs: 2,
        handshake_timeout_secs: 2,
        ..Default::default()
    }
}

async fn spawn_seeder(
    info_hash: InfoHash,
    data: Arc<Vec<u8>>,
    has: Vec<usize>,
    behavior: Behavior,
) -> Seeder {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let connections = Arc::new(AtomicUsize::new(0));
    let requests = Arc::new(AtomicUsize::new(0));

    let seeder = Seeder {
        addr,
        connections: connections.clone(),
        requests: requests.clone(),
    };

    spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            connections.fetch_add(1, Ordering::SeqCst);
            spawn(serve(
                socket,
                info_hash,
                data.clone(),
                has.clone(),
                behavior,
                requests.clone(),
            ));
        }
    });

    seeder
}

/// Talk the wire protocol as a seeder that has the pieces in `has`.
async fn serve(
    socket: TcpStream,
    info_hash: InfoHash,
    data: Arc<Vec<u8>>,
    has: Vec<usize>,
    behavior: Behavior,
    requests: Arc<AtomicUsize>,
) {
    let mut socket = Framed::new(socket, HandshakeCodec);

    let Some(Ok(theirs)) = socket.next().await else { return };
    assert_eq!(theirs.info_hash, info_hash);
    let ours = if behavior.wrong_info_hash {
        InfoHash::digest(b"another torrent")
    } else {
        info_hash
    };
    if socket.send(Handshake::new(ours, PeerId::generate())).await.is_err() {
        return;
    }

    let old_parts = socket.into_parts();
    let mut new_parts = FramedParts::new(old_parts.io, CoreCodec);
    new_parts.read_buf = old_parts.read_buf;
    new_parts.write_buf = old_parts.write_buf;
    let mut socket = Framed::from_parts(new_parts);

    let pieces = data.len().div_ceil(PIECE_LENGTH as usize);
    let mut bitfield = Bitfield::from_piece(pieces);
    for index in &has {
        bitfield.set(*index, true);
    }
    if socket.send(Core::Bitfield(bitfield)).await.is_err() {
        return;
    }

    if behavior.silent {
        while let Some(Ok(_)) = socket.next().await {}
        return;
    }

    if behavior.malformed_unchoke {
        // unchoke has no payload, a length of 2 is a violation
        let frame = [0, 0, 0, 2, 1, 0];
        if socket.get_mut().write_all(&frame).await.is_err() {
            return;
        }
        while let Some(Ok(_)) = socket.next().await {}
        return;
    }

    sleep(behavior.unchoke_delay).await;
    if socket.send(Core::Unchoke).await.is_err() {
        return;
    }

    if behavior.choke_after_unchoke {
        if socket.send(Core::Choke).await.is_err() {
            return;
        }
        sleep(Duration::from_millis(300)).await;
        if socket.send(Core::Unchoke).await.is_err() {
            return;
        }
    }

    while let Some(Ok(msg)) = socket.next().await {
        let Core::Request(block_info) = msg else { continue };
        requests.fetch_add(1, Ordering::SeqCst);

        if behavior.drop_on_request {
            return;
        }

        let start = block_info.index as usize * PIECE_LENGTH as usize
            + block_info.begin as usize;
        let mut block = data[start..start + block_info.len as usize].to_vec();
        if behavior.corrupt {
            block.iter_mut().for_each(|b| *b = !*b);
        }

        let piece = Core::Piece(Block {
            index: block_info.index as usize,
            begin: block_info.begin,
            block,
        });
        if socket.send(piece).await.is_err() {
            return;
        }
    }
}

/// Download `data` from `peers` into a temp file, and return its content.
async fn download(
    data: &[u8],
    peers: Vec<SocketAddr>,
    config: Config,
) -> Result<Vec<u8>, Error> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .without_time()
        .try_init();

    let meta_info = meta_info(data);
    let path = temp_path();

    let mut disk = Disk::new(&path, &meta_info.info);
    let disk_tx = disk.tx.clone();
    let disk_handle = spawn(async move { disk.run().await });

    let torrent = Torrent::new(meta_info, config, disk_tx);
    let mut torrent = torrent.start_with_peers(peers, None);

    timeout(Duration::from_secs(20), torrent.run())
        .await
        .expect("download took too long")?;

    disk_handle.await.unwrap()?;

    let content = tokio::fs::read(&path).await?;
    if let Some(dir) = path.parent() {
        let _ = tokio::fs::remove_dir_all(dir).await;
    }

    Ok(content)
}

#[tokio::test]
async fn download_from_two_seeders() {
    let data = Arc::new(random_data(2 * PIECE_LENGTH as usize));
    let info_hash = meta_info(&data).info_hash;

    let first =
        spawn_seeder(info_hash, data.clone(), vec![0], Behavior::default()).await;
    let second =
        spawn_seeder(info_hash, data.clone(), vec![1], Behavior::default()).await;

    let content = download(&data, vec![first.addr, second.addr], config())
        .await
        .unwrap();

    assert_eq!(content, *data);
    assert_eq!(first.requests.load(Ordering::SeqCst), 1);
    assert_eq!(second.requests.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn last_piece_is_shorter() {
    let data = Arc::new(random_data(PIECE_LENGTH as usize + 100));
    let info_hash = meta_info(&data).info_hash;

    let seeder =
        spawn_seeder(info_hash, data.clone(), vec![0, 1], Behavior::default())
            .await;

    let content = download(&data, vec![seeder.addr], config()).await.unwrap();

    assert_eq!(content, *data);
}

#[tokio::test]
async fn corrupt_peer_is_banned() {
    let data = Arc::new(random_data(2 * PIECE_LENGTH as usize));
    let info_hash = meta_info(&data).info_hash;

    let corrupt = spawn_seeder(
        info_hash,
        data.clone(),
        vec![0, 1],
        Behavior { corrupt: true, ..Default::default() },
    )
    .await;

    // unchokes late, so the corrupt peer gets the first requests
    let honest = spawn_seeder(
        info_hash,
        data.clone(),
        vec![0, 1],
        Behavior {
            unchoke_delay: Duration::from_millis(500),
            ..Default::default()
        },
    )
    .await;

    let config = Config { max_peer_failures: 1, ..config() };
    let content = download(&data, vec![corrupt.addr, honest.addr], config)
        .await
        .unwrap();

    assert_eq!(content, *data);
    assert!(corrupt.requests.load(Ordering::SeqCst) >= 1);
    assert_eq!(corrupt.connections.load(Ordering::SeqCst), 1);
    assert_eq!(honest.requests.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn blocks_of_a_gone_peer_are_requested_again() {
    let data = Arc::new(random_data(2 * PIECE_LENGTH as usize));
    let info_hash = meta_info(&data).info_hash;

    let leaving = spawn_seeder(
        info_hash,
        data.clone(),
        vec![0, 1],
        Behavior { drop_on_request: true, ..Default::default() },
    )
    .await;

    let staying = spawn_seeder(
        info_hash,
        data.clone(),
        vec![0, 1],
        Behavior {
            unchoke_delay: Duration::from_millis(500),
            ..Default::default()
        },
    )
    .await;

    let content = download(&data, vec![leaving.addr, staying.addr], config())
        .await
        .unwrap();

    assert_eq!(content, *data);
    assert_eq!(leaving.requests.load(Ordering::SeqCst), 1);
    assert_eq!(staying.requests.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn unreachable_peers() {
    // bind and drop, so nothing listens on the port
    let addr = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };

    let data = random_data(PIECE_LENGTH as usize);
    let r = download(&data, vec![addr], config()).await;

    assert!(matches!(r, Err(Error::NoReachablePeers)));
}

#[tokio::test]
async fn zero_timeouts_are_usable() {
    let data = Arc::new(random_data(2 * PIECE_LENGTH as usize));
    let info_hash = meta_info(&data).info_hash;

    let seeder =
        spawn_seeder(info_hash, data.clone(), vec![0, 1], Behavior::default())
            .await;

    let config = Config {
        keep_alive_secs: 0,
        idle_timeout_secs: 0,
        request_timeout_secs: 0,
        max_pending_requests: 0,
        ..config()
    };
    let content = download(&data, vec![seeder.addr], config).await.unwrap();

    assert_eq!(content, *data);
}

#[tokio::test]
async fn wrong_info_hash_is_rejected() {
    let data = Arc::new(random_data(PIECE_LENGTH as usize));
    let info_hash = meta_info(&data).info_hash;

    let wrong = spawn_seeder(
        info_hash,
        data.clone(),
        vec![0],
        Behavior { wrong_info_hash: true, ..Default::default() },
    )
    .await;

    let r = download(&data, vec![wrong.addr], config()).await;

    assert!(matches!(r, Err(Error::NoReachablePeers)));
    assert_eq!(wrong.connections.load(Ordering::SeqCst), 1);
    assert_eq!(wrong.requests.load(Ordering::SeqCst), 0);

    let wrong = spawn_seeder(
        info_hash,
        data.clone(),
        vec![0],
        Behavior { wrong_info_hash: true, ..Default::default() },
    )
    .await;
    let honest =
        spawn_seeder(info_hash, data.clone(), vec![0], Behavior::default())
            .await;

    let content = download(&data, vec![wrong.addr, honest.addr], config())
        .await
        .unwrap();

    assert_eq!(content, *data);
    assert_eq!(wrong.requests.load(Ordering::SeqCst), 0);
    assert_eq!(honest.requests.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn malformed_frame_closes_the_peer() {
    let data = Arc::new(random_data(2 * PIECE_LENGTH as usize));
    let info_hash = meta_info(&data).info_hash;

    let malformed = spawn_seeder(
        info_hash,
        data.clone(),
        vec![0, 1],
        Behavior { malformed_unchoke: true, ..Default::default() },
    )
    .await;

    let honest = spawn_seeder(
        info_hash,
        data.clone(),
        vec![0, 1],
        Behavior {
            unchoke_delay: Duration::from_millis(500),
            ..Default::default()
        },
    )
    .await;

    let content = download(&data, vec![malformed.addr, honest.addr], config())
        .await
        .unwrap();

    assert_eq!(content, *data);
    assert_eq!(malformed.connections.load(Ordering::SeqCst), 1);
    assert_eq!(malformed.requests.load(Ordering::SeqCst), 0);
    assert_eq!(honest.requests.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn choked_requests_are_retried() {
    let data = Arc::new(random_data(2 * PIECE_LENGTH as usize));
    let info_hash = meta_info(&data).info_hash;

    let seeder = spawn_seeder(
        info_hash,
        data.clone(),
        vec![0, 1],
        Behavior { choke_after_unchoke: true, ..Default::default() },
    )
    .await;

    let content = download(&data, vec![seeder.addr], config()).await.unwrap();

    assert_eq!(content, *data);
    assert!(seeder.requests.load(Ordering::SeqCst) >= 2);
}

#[tokio::test]
async fn silent_peer_times_out() {
    let data = Arc::new(random_data(PIECE_LENGTH as usize));
    let info_hash = meta_info(&data).info_hash;

    let silent = spawn_seeder(
        info_hash,
        data.clone(),
        vec![0],
        Behavior { silent: true, ..Default::default() },
    )
    .await;

    let config = Config { idle_timeout_secs: 1, ..config() };
    let r = download(&data, vec![silent.addr], config).await;

    assert!(matches!(r, Err(Error::PeersExhausted)));
    assert_eq!(silent.connections.load(Ordering::SeqCst), 1);
    assert_eq!(silent.requests.load(Ordering::SeqCst), 0);
}
