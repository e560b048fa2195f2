use std::time::Duration;

use cmdchat_core::config::ServerConfig;
use cmdchat_core::envelope::Envelope;

use crate::*;

/// A session that stops answering pings is reaped after the heartbeat
/// timeout and its room hears the departure. Uses sub-second heartbeat
/// settings; the mechanism is identical at the protocol's 15s/45s.
#[tokio::test]
async fn silent_session_is_reaped() {
    let mut config = ServerConfig::default();
    config.heartbeat_interval_ms = 100;
    config.heartbeat_timeout_ms = 400;
    let server = start_server(config).await;

    let mut alice = connect(server.addr, "alice", "lobby", None).await.unwrap();
    let mut bob = connect(server.addr, "bob", "lobby", None).await.unwrap();
    assert_system(&alice.recv().await.unwrap(), "bob joined");

    // Alice goes silent: never reads, never pongs. Bob stays live by
    // answering pings until the reaper announces the departure.
    let _parked_alice = alice;
    let deadline = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match bob.recv_answering_pings().await.unwrap() {
                Envelope::System { text } if text == "alice left" => break,
                other => panic!("unexpected envelope before reap: {other:?}"),
            }
        }
    })
    .await;
    assert!(deadline.is_ok(), "reap did not happen within the deadline");
}

/// Pings keep flowing on the configured cadence and carry fresh nonces.
#[tokio::test]
async fn pings_arrive_with_fresh_nonces() {
    let mut config = ServerConfig::default();
    config.heartbeat_interval_ms = 100;
    config.heartbeat_timeout_ms = 2_000;
    let server = start_server(config).await;
    let mut alice = connect(server.addr, "alice", "lobby", None).await.unwrap();

    let mut nonces = Vec::new();
    while nonces.len() < 3 {
        match alice.recv_timeout(Duration::from_secs(5)).await.unwrap() {
            Some(Envelope::Ping { nonce }) => {
                nonces.push(nonce);
                alice.send(&Envelope::Pong { nonce }).await.unwrap();
            }
            Some(other) => panic!("expected ping, got {other:?}"),
            None => panic!("no ping within the deadline"),
        }
    }
    nonces.dedup();
    assert_eq!(nonces.len(), 3, "nonces should be fresh per ping");
}

/// A session that answers pings is never reaped.
#[tokio::test]
async fn live_session_survives_many_intervals() {
    let mut config = ServerConfig::default();
    config.heartbeat_interval_ms = 50;
    config.heartbeat_timeout_ms = 200;
    let server = start_server(config).await;
    let mut alice = connect(server.addr, "alice", "lobby", None).await.unwrap();

    // Stay connected across many timeout windows.
    let alive = tokio::time::timeout(Duration::from_secs(1), async {
        loop {
            if let Envelope::Ping { nonce } = alice.recv().await.unwrap() {
                alice.send(&Envelope::Pong { nonce }).await.unwrap();
            }
        }
    })
    .await;
    assert!(alive.is_err(), "loop should still be running at the deadline");

    // Still a functioning session after all that.
    alice.send(&chat("still here")).await.unwrap();
    loop {
        match alice.recv_answering_pings().await.unwrap() {
            Envelope::Chat { text, .. } => {
                assert_eq!(text, "still here");
                break;
            }
            other => panic!("expected chat, got {other:?}"),
        }
    }
}
