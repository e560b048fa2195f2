use std::time::Duration;

use cmdchat_core::config::ServerConfig;
use cmdchat_core::envelope::Envelope;

use crate::*;

/// 15 back-to-back messages under the default 12-per-5s limit: exactly 12
/// are broadcast and 3 come back to the sender as rate errors.
#[tokio::test]
async fn burst_is_limited_to_twelve() {
    let server = start_server(ServerConfig::default()).await;
    let mut alice = connect(server.addr, "alice", "lobby", None).await.unwrap();
    let mut bob = connect(server.addr, "bob", "lobby", None).await.unwrap();
    assert_system(&alice.recv().await.unwrap(), "bob joined");

    for i in 0..15 {
        alice.send(&chat(&format!("{i}"))).await.unwrap();
    }

    // Bob sees exactly the 12 accepted chats, in seq order, then silence.
    let mut bob_chats = Vec::new();
    for _ in 0..12 {
        match bob.recv_timeout(Duration::from_secs(5)).await.unwrap() {
            Some(Envelope::Chat { seq, text, .. }) => bob_chats.push((seq, text)),
            other => panic!("expected chat, got {other:?}"),
        }
    }
    assert_eq!(
        bob_chats.iter().map(|(s, _)| *s).collect::<Vec<_>>(),
        (0..12).collect::<Vec<_>>()
    );
    assert!(bob
        .recv_timeout(Duration::from_millis(300))
        .await
        .unwrap()
        .is_none());

    // Alice sees her 12 echoes plus 3 rate errors.
    let mut echoes = 0;
    let mut rate_errors = 0;
    for _ in 0..15 {
        match alice.recv_timeout(Duration::from_secs(5)).await.unwrap() {
            Some(Envelope::Chat { .. }) => echoes += 1,
            Some(Envelope::Error { code, .. }) => {
                assert_eq!(code, "rate");
                rate_errors += 1;
            }
            other => panic!("expected chat or error, got {other:?}"),
        }
    }
    assert_eq!(echoes, 12);
    assert_eq!(rate_errors, 3);
}

/// Rate rejections are not fatal: the session keeps working afterwards.
#[tokio::test]
async fn rate_rejection_is_not_fatal() {
    let mut config = ServerConfig::default();
    config.rate_max_events = 2;
    config.rate_window_ms = 300;
    let server = start_server(config).await;
    let mut alice = connect(server.addr, "alice", "lobby", None).await.unwrap();

    for i in 0..3 {
        alice.send(&chat(&format!("{i}"))).await.unwrap();
    }
    let mut kinds = Vec::new();
    for _ in 0..3 {
        let envelope = alice.recv().await.unwrap();
        kinds.push(envelope.kind());
    }
    assert_eq!(kinds.iter().filter(|k| **k == "chat").count(), 2);
    assert_eq!(kinds.iter().filter(|k| **k == "error").count(), 1);

    // Once the window slides, sends work again.
    tokio::time::sleep(Duration::from_millis(400)).await;
    alice.send(&chat("after the window")).await.unwrap();
    match alice.recv_timeout(Duration::from_secs(5)).await.unwrap() {
        Some(Envelope::Chat { text, .. }) => assert_eq!(text, "after the window"),
        other => panic!("expected chat, got {other:?}"),
    }
}

/// The limiter counts file chunks too.
#[tokio::test]
async fn file_chunks_count_against_the_limit() {
    let mut config = ServerConfig::default();
    config.rate_max_events = 2;
    let server = start_server(config).await;
    let mut alice = connect(server.addr, "alice", "lobby", None).await.unwrap();

    use base64::Engine;
    let b64 = base64::engine::general_purpose::STANDARD.encode([0u8; 100]);
    alice
        .send(&Envelope::FileStart {
            sender: String::new(),
            transfer_id: "t".into(),
            filename: "f.bin".into(),
            size: 300,
            total_chunks: 1,
        })
        .await
        .unwrap();
    // file-start is not rate-counted; the chunks are.
    alice.send(&chat("one")).await.unwrap();
    alice.send(&chat("two")).await.unwrap();
    alice
        .send(&Envelope::FileChunk {
            sender: String::new(),
            transfer_id: "t".into(),
            index: 0,
            data: b64,
        })
        .await
        .unwrap();

    let mut rate_errors = 0;
    for _ in 0..3 {
        if let Some(Envelope::Error { code, .. }) =
            alice.recv_timeout(Duration::from_secs(5)).await.unwrap()
        {
            assert_eq!(code, "rate");
            rate_errors += 1;
        }
    }
    assert_eq!(rate_errors, 1);
}
