//! End-to-end download tests against scripted peers on the loopback.
//!
//! These drive the real controller loop: announces over real HTTP, peer
//! connections over real TCP sockets, and verification against real files
//! on disk. The remote side is a hand-rolled seeder that speaks just
//! enough of the protocol to serve a complete torrent.
use riptide::bencode;
use riptide::bencode::BencodeValue;
use riptide::config::Config;
use riptide::metainfo::Metainfo;
use riptide::strategy::RarestFirst;
use riptide::torrent::Input;
use riptide::torrent::Torrent;
use riptide::wire::Handshake;
use riptide::wire::Message;

use bytes::BytesMut;
use sha1::Digest;
use sha1::Sha1;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::net::TcpStream;

const PIECE_LENGTH: usize = 16;

fn sha1_of(data: &[u8]) -> [u8; 20] {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Builds a real single-file metainfo document for `data`.
fn build_metainfo(announce: &str, name: &str, data: &[u8]) -> Metainfo {
    let mut pieces = Vec::new();
    for chunk in data.chunks(PIECE_LENGTH) {
        pieces.extend_from_slice(&sha1_of(chunk));
    }

    let mut info = BTreeMap::new();
    info.insert(b"length".to_vec(), BencodeValue::Integer(data.len() as i64));
    info.insert(b"name".to_vec(), BencodeValue::String(name.as_bytes().to_vec()));
    info.insert(
        b"piece length".to_vec(),
        BencodeValue::Integer(PIECE_LENGTH as i64),
    );
    info.insert(b"pieces".to_vec(), BencodeValue::String(pieces));

    let mut root = BTreeMap::new();
    root.insert(
        b"announce".to_vec(),
        BencodeValue::String(announce.as_bytes().to_vec()),
    );
    root.insert(b"info".to_vec(), BencodeValue::Dict(info));

    let bytes = bencode::encode_to_vec(&BencodeValue::Dict(root)).unwrap();
    Metainfo::from_bytes(&bytes).unwrap()
}

/// A minimal HTTP tracker: every announce gets `interval 1800` and the
/// given compact peer list.
async fn fake_tracker(listener: TcpListener, compact_peers: Vec<u8>) {
    loop {
        let Ok((mut socket, _)) = listener.accept().await else {
            return;
        };
        let compact_peers = compact_peers.clone();
        tokio::spawn(async move {
            let mut request = vec![0u8; 4096];
            let mut read = 0;
            loop {
                let Ok(n) = socket.read(&mut request[read..]).await else {
                    return;
                };
                if n == 0 {
                    return;
                }
                read += n;
                if request[..read].windows(4).any(|w| w == b"\r\n\r\n") {
                    break;
                }
            }

            let mut body = format!("d8:intervali1800e5:peers{}:", compact_peers.len()).into_bytes();
            body.extend_from_slice(&compact_peers);
            body.push(b'e');
            let header = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                body.len()
            );
            let _ = socket.write_all(header.as_bytes()).await;
            let _ = socket.write_all(&body).await;
            let _ = socket.flush().await;
        });
    }
}

/// Drives the seeding half of the wire protocol over an established
/// socket: handshake already exchanged, bitfield sent by the caller.
/// Unchokes on Interested and serves every Request from `data`.
async fn serve_blocks(mut socket: TcpStream, data: Vec<u8>) {
    let mut buf = BytesMut::new();
    let mut chunk = vec![0u8; 4096];
    loop {
        let Ok(n) = socket.read(&mut chunk).await else {
            return;
        };
        if n == 0 {
            return;
        }
        buf.extend_from_slice(&chunk[..n]);

        while let Ok(Some(message)) = Message::parse(&mut buf) {
            match message {
                Message::Interested => {
                    let mut out = BytesMut::new();
                    Message::Unchoke.encode(&mut out);
                    if socket.write_all(&out).await.is_err() {
                        return;
                    }
                }
                Message::Request { index, begin, length } => {
                    let start = index as usize * PIECE_LENGTH + begin as usize;
                    let block = data[start..start + length as usize].to_vec();
                    let mut out = BytesMut::new();
                    Message::Piece { index, begin, block }.encode(&mut out);
                    if socket.write_all(&out).await.is_err() {
                        return;
                    }
                }
                _ => {}
            }
        }
    }
}

/// A seeder that accepts one connection, answers the handshake, claims
/// every piece, and serves blocks.
async fn scripted_seeder(listener: TcpListener, info_hash: [u8; 20], data: Vec<u8>) {
    let Ok((mut socket, _)) = listener.accept().await else {
        return;
    };

    let mut handshake_bytes = [0u8; 68];
    if socket.read_exact(&mut handshake_bytes).await.is_err() {
        return;
    }
    assert_eq!(&handshake_bytes[28..48], &info_hash);

    let num_pieces = data.len().div_ceil(PIECE_LENGTH);
    let mut bits = vec![0u8; num_pieces.div_ceil(8)];
    for i in 0..num_pieces {
        bits[i / 8] |= 0x80 >> (i % 8);
    }
    let mut out = BytesMut::new();
    Handshake::new(info_hash, *b"-SEED001-scripted  x").encode(&mut out);
    Message::Bitfield(bits).encode(&mut out);
    if socket.write_all(&out).await.is_err() {
        return;
    }

    serve_blocks(socket, data).await;
}

fn fast_config(dir: &std::path::Path, port: u16) -> Config {
    Config {
        port,
        download_root: dir.to_path_buf(),
        tick_interval: Duration::from_millis(10),
        ..Config::default()
    }
}

#[tokio::test]
async fn leeches_a_whole_torrent_via_tracker_discovery() {
    // 28 bytes: one full piece and one short one.
    let data: Vec<u8> = (0u8..28).map(|i| i.wrapping_mul(7)).collect();

    let seeder_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let seeder_addr = seeder_listener.local_addr().unwrap();
    let tracker_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let tracker_port = tracker_listener.local_addr().unwrap().port();

    let announce = format!("http://127.0.0.1:{}/announce", tracker_port);
    let metainfo = build_metainfo(&announce, "e2e data", &data);
    let info_hash = metainfo.info_hash;
    assert_eq!(metainfo.num_pieces(), 2);
    assert_eq!(metainfo.piece_size(1), 12);

    // Compact peer record pointing at the seeder.
    let mut compact = Vec::new();
    compact.extend_from_slice(&[127, 0, 0, 1]);
    compact.extend_from_slice(&seeder_addr.port().to_be_bytes());

    tokio::spawn(fake_tracker(tracker_listener, compact));
    tokio::spawn(scripted_seeder(seeder_listener, info_hash, data.clone()));

    let dir = tempfile::tempdir().unwrap();
    let mut torrent = Torrent::new(
        metainfo,
        fast_config(dir.path(), 6885),
        *b"-RP0010-e2e-test-01x",
        Box::new(RarestFirst::default()),
    )
    .unwrap();

    tokio::time::timeout(Duration::from_secs(30), torrent.run())
        .await
        .expect("download timed out")
        .expect("torrent failed");

    let stats = torrent.stats();
    assert_eq!(stats.pieces_have, 2);
    assert_eq!(stats.bytes_left, 0);
    assert_eq!(stats.downloaded, 28);

    let on_disk = std::fs::read(dir.path().join("e2e_data").join("e2e_data")).unwrap();
    assert_eq!(on_disk, data);
}

#[tokio::test]
async fn leeches_from_an_inbound_peer_when_every_tracker_fails() {
    let data: Vec<u8> = (0u8..28).map(|i| i.wrapping_add(100)).collect();

    // Nothing listens here; every announce fails, the torrent keeps
    // going with peers it learns of by other means.
    let metainfo = build_metainfo("http://127.0.0.1:1/announce", "resilient", &data);
    let info_hash = metainfo.info_hash;

    let dir = tempfile::tempdir().unwrap();
    let torrent = Torrent::new(
        metainfo,
        fast_config(dir.path(), 6886),
        *b"-RP0010-e2e-test-02x",
        Box::new(RarestFirst::default()),
    )
    .unwrap();
    let input = torrent.input_sender();

    // The "inbound" connection: a loopback pair where the far end is a
    // seeder that leads with its handshake, as a connecting peer would.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let connect = TcpStream::connect(listener.local_addr().unwrap());
    let (outbound, accepted) = tokio::join!(connect, listener.accept());
    let mut seeder_side = outbound.unwrap();
    let (mut our_side, peer_addr) = accepted.unwrap();

    let seeder_data = data.clone();
    tokio::spawn(async move {
        let mut out = BytesMut::new();
        Handshake::new(info_hash, *b"-SEED001-inbound   x").encode(&mut out);
        seeder_side.write_all(&out).await.unwrap();

        // Our handshake comes back, then the bitfield claiming piece
        // ownership goes out before normal traffic.
        let mut reply = [0u8; 68];
        seeder_side.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply[28..48], &info_hash);

        let mut out = BytesMut::new();
        Message::Bitfield(vec![0b1100_0000]).encode(&mut out);
        seeder_side.write_all(&out).await.unwrap();

        serve_blocks(seeder_side, seeder_data).await;
    });

    // Play the accept loop's part: consume the handshake, hand the
    // socket to the controller.
    let mut handshake_buf = BytesMut::new();
    let remote = loop {
        if let Some(handshake) = Handshake::parse(&mut handshake_buf).unwrap() {
            break handshake;
        }
        let mut chunk = vec![0u8; 256];
        let n = our_side.read(&mut chunk).await.unwrap();
        assert!(n > 0, "seeder hung up during handshake");
        handshake_buf.extend_from_slice(&chunk[..n]);
    };
    input
        .send(Input::Inbound {
            addr: peer_addr,
            stream: our_side,
            remote,
            leftover: handshake_buf.freeze(),
        })
        .await
        .unwrap();

    let mut torrent = torrent;
    tokio::time::timeout(Duration::from_secs(30), torrent.run())
        .await
        .expect("download timed out")
        .expect("torrent failed");

    assert_eq!(torrent.stats().bytes_left, 0);
    let on_disk = std::fs::read(dir.path().join("resilient").join("resilient")).unwrap();
    assert_eq!(on_disk, data);
}
