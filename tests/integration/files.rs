use std::time::Duration;

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use sha2::{Digest, Sha256};

use cmdchat_core::config::ServerConfig;
use cmdchat_core::envelope::{Envelope, FILE_CHUNK_SIZE, FILE_MAX_BYTES};

use crate::*;

/// Config for a relay sized for bulk file traffic: the protocol's chat
/// limiter defaults would throttle hundreds of chunks.
fn bulk_config() -> ServerConfig {
    let mut config = ServerConfig::default();
    config.rate_max_events = 100_000;
    config.send_queue_bound = 1024;
    config
}

async fn send_transfer(client: &mut TestClient, transfer_id: &str, name: &str, data: &[u8]) {
    let total_chunks = data.len().div_ceil(FILE_CHUNK_SIZE).max(1) as u32;
    client
        .send(&Envelope::FileStart {
            sender: String::new(),
            transfer_id: transfer_id.into(),
            filename: name.into(),
            size: data.len() as u64,
            total_chunks,
        })
        .await
        .unwrap();
    for (index, chunk) in data.chunks(FILE_CHUNK_SIZE).enumerate() {
        client
            .send(&Envelope::FileChunk {
                sender: String::new(),
                transfer_id: transfer_id.into(),
                index: index as u32,
                data: B64.encode(chunk),
            })
            .await
            .unwrap();
    }
}

/// An 8 MiB transfer arrives as file-start, exactly 256 chunks in index
/// order, then file-end, and reassembles to the same SHA-256.
#[tokio::test]
async fn eight_mib_transfer_reassembles_exactly() {
    let server = start_server(bulk_config()).await;
    let mut alice = connect(server.addr, "alice", "lobby", None).await.unwrap();
    let bob = connect(server.addr, "bob", "lobby", None).await.unwrap();
    assert_system(&alice.recv().await.unwrap(), "bob joined");

    let mut data = vec![0u8; 8 * 1024 * 1024];
    use rand::RngCore;
    rand::thread_rng().fill_bytes(&mut data);
    let sent_digest = Sha256::digest(&data);

    // Bob collects concurrently so the relay never has to buffer the whole
    // transfer for him.
    let collector = tokio::spawn(async move {
        let mut bob = bob;
        match bob.recv_timeout(Duration::from_secs(30)).await.unwrap() {
            Some(Envelope::FileStart { sender, filename, size, total_chunks, .. }) => {
                assert_eq!(sender, "alice");
                assert_eq!(filename, "blob.bin");
                assert_eq!(size, 8 * 1024 * 1024);
                assert_eq!(total_chunks, 256);
            }
            other => panic!("expected file-start, got {other:?}"),
        }

        let mut bytes = Vec::with_capacity(8 * 1024 * 1024);
        let mut chunks = 0u32;
        loop {
            match bob.recv_timeout(Duration::from_secs(30)).await.unwrap() {
                Some(Envelope::FileChunk { index, data, .. }) => {
                    assert_eq!(index, chunks, "chunks must arrive in index order");
                    bytes.extend_from_slice(&B64.decode(&data).unwrap());
                    chunks += 1;
                }
                Some(Envelope::FileEnd { transfer_id, .. }) => {
                    assert_eq!(transfer_id, "t-8mib");
                    break;
                }
                other => panic!("expected chunk or end, got {other:?}"),
            }
        }
        assert_eq!(chunks, 256, "ceil(8 MiB / 32 KiB) chunks expected");
        bytes
    });

    send_transfer(&mut alice, "t-8mib", "blob.bin", &data).await;

    let received = collector.await.unwrap();
    assert_eq!(received.len(), data.len());
    assert_eq!(Sha256::digest(&received), sent_digest);

    server.stop().await;
}

/// The sender does not get its own chunks echoed back.
#[tokio::test]
async fn sender_does_not_hear_its_own_transfer() {
    let server = start_server(bulk_config()).await;
    let mut alice = connect(server.addr, "alice", "lobby", None).await.unwrap();

    send_transfer(&mut alice, "t-solo", "solo.bin", &[7u8; 1000]).await;
    assert!(alice
        .recv_timeout(Duration::from_millis(300))
        .await
        .unwrap()
        .is_none());
}

/// A declared size over 10 MiB ends the offending session.
#[tokio::test]
async fn oversize_declaration_is_fatal() {
    let server = start_server(bulk_config()).await;
    let mut alice = connect(server.addr, "alice", "lobby", None).await.unwrap();
    let mut bob = connect(server.addr, "bob", "lobby", None).await.unwrap();
    assert_system(&alice.recv().await.unwrap(), "bob joined");

    alice
        .send(&Envelope::FileStart {
            sender: String::new(),
            transfer_id: "t-big".into(),
            filename: "big.bin".into(),
            size: FILE_MAX_BYTES + 1,
            total_chunks: 400,
        })
        .await
        .unwrap();

    assert_system(
        &bob.recv_timeout(Duration::from_secs(5)).await.unwrap().expect("left notice"),
        "alice left",
    );
}

/// Out-of-order chunk indices end the offending session.
#[tokio::test]
async fn out_of_order_chunk_is_fatal() {
    let server = start_server(bulk_config()).await;
    let mut alice = connect(server.addr, "alice", "lobby", None).await.unwrap();
    let mut bob = connect(server.addr, "bob", "lobby", None).await.unwrap();
    assert_system(&alice.recv().await.unwrap(), "bob joined");

    alice
        .send(&Envelope::FileStart {
            sender: String::new(),
            transfer_id: "t-ooo".into(),
            filename: "f.bin".into(),
            size: (FILE_CHUNK_SIZE * 2) as u64,
            total_chunks: 2,
        })
        .await
        .unwrap();
    alice
        .send(&Envelope::FileChunk {
            sender: String::new(),
            transfer_id: "t-ooo".into(),
            index: 1,
            data: B64.encode([0u8; 16]),
        })
        .await
        .unwrap();

    // Bob hears the start, then the departure.
    match bob.recv_timeout(Duration::from_secs(5)).await.unwrap() {
        Some(Envelope::FileStart { .. }) => {}
        other => panic!("expected file-start, got {other:?}"),
    }
    assert_system(
        &bob.recv_timeout(Duration::from_secs(5)).await.unwrap().expect("left notice"),
        "alice left",
    );
}

/// A small transfer works under default (chat-sized) rate limits.
#[tokio::test]
async fn small_transfer_under_default_limits() {
    let server = start_server(ServerConfig::default()).await;
    let mut alice = connect(server.addr, "alice", "lobby", None).await.unwrap();
    let mut bob = connect(server.addr, "bob", "lobby", None).await.unwrap();
    assert_system(&alice.recv().await.unwrap(), "bob joined");

    let data = vec![0xA5u8; FILE_CHUNK_SIZE + 17];
    send_transfer(&mut alice, "t-small", "small.bin", &data).await;

    let mut received = Vec::new();
    loop {
        match bob.recv_timeout(Duration::from_secs(5)).await.unwrap() {
            Some(Envelope::FileStart { .. }) => {}
            Some(Envelope::FileChunk { data, .. }) => {
                received.extend_from_slice(&B64.decode(&data).unwrap());
            }
            Some(Envelope::FileEnd { .. }) => break,
            other => panic!("unexpected {other:?}"),
        }
    }
    assert_eq!(received, data);
}
