use std::time::Duration;

use cmdchat_core::config::ServerConfig;
use cmdchat_core::envelope::Envelope;

use crate::*;

/// Rooms are isolated: a chat in `lobby` never reaches `other`.
#[tokio::test]
async fn room_isolation() {
    let server = start_server(ServerConfig::default()).await;
    let mut alice = connect(server.addr, "alice", "lobby", None).await.unwrap();
    let mut bob = connect(server.addr, "bob", "other", None).await.unwrap();

    alice.send(&chat("ping-chat")).await.unwrap();

    // Alice gets her own echo; Bob hears nothing.
    match alice.recv().await.unwrap() {
        Envelope::Chat { text, room, .. } => {
            assert_eq!(text, "ping-chat");
            assert_eq!(room, "lobby");
        }
        other => panic!("expected chat, got {other:?}"),
    }
    assert!(bob
        .recv_timeout(Duration::from_millis(500))
        .await
        .unwrap()
        .is_none());
}

/// `/join` relocates a session: departure announced to the old room,
/// arrival to the new one, and chat follows the member.
#[tokio::test]
async fn join_moves_between_rooms() {
    let server = start_server(ServerConfig::default()).await;
    let mut alice = connect(server.addr, "alice", "lobby", None).await.unwrap();
    let mut bob = connect(server.addr, "bob", "lobby", None).await.unwrap();
    let mut carol = connect(server.addr, "carol", "den", None).await.unwrap();
    assert_system(&alice.recv().await.unwrap(), "bob joined");

    alice.send(&Envelope::CmdJoin { room: "den".into() }).await.unwrap();
    assert_system(&bob.recv().await.unwrap(), "alice left");
    assert_system(&carol.recv().await.unwrap(), "alice joined");

    alice.send(&chat("hi den")).await.unwrap();
    match carol.recv().await.unwrap() {
        Envelope::Chat { sender, room, text, .. } => {
            assert_eq!(sender, "alice");
            assert_eq!(room, "den");
            assert_eq!(text, "hi den");
        }
        other => panic!("expected chat, got {other:?}"),
    }
    assert!(bob
        .recv_timeout(Duration::from_millis(300))
        .await
        .unwrap()
        .is_none());
}

/// Room names are sanitized on join; a hostile name lands in a clean room.
#[tokio::test]
async fn join_sanitizes_the_room_name() {
    let server = start_server(ServerConfig::default()).await;
    let mut alice = connect(server.addr, "alice", "lobby", None).await.unwrap();
    // "Dev Talk!" sanitizes to "devtalk"
    let mut bob = connect(server.addr, "bob", "devtalk", None).await.unwrap();

    alice.send(&Envelope::CmdJoin { room: "Dev Talk!".into() }).await.unwrap();
    assert_system(&bob.recv().await.unwrap(), "alice joined");

    alice.send(&chat("made it")).await.unwrap();
    match bob.recv().await.unwrap() {
        Envelope::Chat { room, .. } => assert_eq!(room, "devtalk"),
        other => panic!("expected chat, got {other:?}"),
    }
}

/// `/nick` announces the change and later chats carry the new name.
#[tokio::test]
async fn nick_change_announces_and_sticks() {
    let server = start_server(ServerConfig::default()).await;
    let mut alice = connect(server.addr, "alice", "lobby", None).await.unwrap();
    let mut bob = connect(server.addr, "bob", "lobby", None).await.unwrap();
    assert_system(&alice.recv().await.unwrap(), "bob joined");

    alice.send(&Envelope::CmdNick { name: "Alicia".into() }).await.unwrap();
    assert_system(&bob.recv().await.unwrap(), "alice is now alicia");
    assert_system(&alice.recv().await.unwrap(), "alice is now alicia");

    alice.send(&chat("new me")).await.unwrap();
    match bob.recv().await.unwrap() {
        Envelope::Chat { sender, .. } => assert_eq!(sender, "alicia"),
        other => panic!("expected chat, got {other:?}"),
    }
}

/// Name collisions are allowed; the name is a display hint.
#[tokio::test]
async fn duplicate_names_are_allowed() {
    let server = start_server(ServerConfig::default()).await;
    let mut first = connect(server.addr, "sam", "lobby", None).await.unwrap();
    let second = connect(server.addr, "sam", "lobby", None).await.unwrap();
    assert_system(&first.recv().await.unwrap(), "sam joined");
    assert!(first.client_id != second.client_id);
}

/// A clean quit announces the departure to the room.
#[tokio::test]
async fn quit_announces_departure() {
    let server = start_server(ServerConfig::default()).await;
    let mut alice = connect(server.addr, "alice", "lobby", None).await.unwrap();
    let mut bob = connect(server.addr, "bob", "lobby", None).await.unwrap();
    assert_system(&alice.recv().await.unwrap(), "bob joined");

    bob.send(&Envelope::CmdQuit).await.unwrap();
    assert_system(
        &alice.recv_timeout(Duration::from_secs(5)).await.unwrap().expect("left notice"),
        "bob left",
    );
}

/// An abrupt disconnect (no quit) also announces the departure.
#[tokio::test]
async fn disconnect_announces_departure() {
    let server = start_server(ServerConfig::default()).await;
    let mut alice = connect(server.addr, "alice", "lobby", None).await.unwrap();
    let bob = connect(server.addr, "bob", "lobby", None).await.unwrap();
    assert_system(&alice.recv().await.unwrap(), "bob joined");

    drop(bob);
    assert_system(
        &alice.recv_timeout(Duration::from_secs(5)).await.unwrap().expect("left notice"),
        "bob left",
    );
}
