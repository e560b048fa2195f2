use cmdchat_core::config::ServerConfig;

use crate::*;

fn gated_config() -> ServerConfig {
    let mut config = ServerConfig::default();
    config.tokens = ["t1".to_string()].into_iter().collect();
    config
}

/// With CMDCHAT_TOKENS configured, a client without a token is refused
/// with `error{code:"auth"}` and the stream closes.
#[tokio::test]
async fn missing_token_is_rejected() {
    let server = start_server(gated_config()).await;
    match try_connect(server.addr, "alice", "lobby", None).await.unwrap() {
        ConnectOutcome::Rejected { code } => assert_eq!(code, "auth"),
        ConnectOutcome::Established(_) => panic!("handshake should have been refused"),
    }
}

#[tokio::test]
async fn wrong_token_is_rejected() {
    let server = start_server(gated_config()).await;
    match try_connect(server.addr, "alice", "lobby", Some("nope")).await.unwrap() {
        ConnectOutcome::Rejected { code } => assert_eq!(code, "auth"),
        ConnectOutcome::Established(_) => panic!("handshake should have been refused"),
    }
}

/// A matching token completes the handshake and the session works.
#[tokio::test]
async fn matching_token_is_accepted() {
    let server = start_server(gated_config()).await;
    let mut alice = connect(server.addr, "alice", "lobby", Some("t1")).await.unwrap();

    alice.send(&chat("authed")).await.unwrap();
    match alice.recv().await.unwrap() {
        cmdchat_core::envelope::Envelope::Chat { text, .. } => assert_eq!(text, "authed"),
        other => panic!("expected chat, got {other:?}"),
    }
}

/// Several accepted tokens can coexist.
#[tokio::test]
async fn any_listed_token_works() {
    let mut config = ServerConfig::default();
    config.tokens = ["t1".to_string(), "t2".to_string()].into_iter().collect();
    let server = start_server(config).await;
    connect(server.addr, "a", "lobby", Some("t1")).await.unwrap();
    connect(server.addr, "b", "lobby", Some("t2")).await.unwrap();
}

/// An empty token set disables the gate entirely.
#[tokio::test]
async fn no_tokens_means_no_gate() {
    let server = start_server(ServerConfig::default()).await;
    connect(server.addr, "alice", "lobby", None).await.unwrap();
    connect(server.addr, "bob", "lobby", Some("ignored")).await.unwrap();
}

/// A garbage public key in the hello is refused with a handshake error.
#[tokio::test]
async fn bad_public_key_is_rejected() {
    use cmdchat_core::envelope::Envelope;
    use cmdchat_core::frame::{read_frame, write_frame};

    let server = start_server(ServerConfig::default()).await;
    let mut stream = tokio::net::TcpStream::connect(server.addr).await.unwrap();
    let hello = Envelope::Hello {
        public_key: "bm90IGEga2V5".into(),
        name: "alice".into(),
        room: "lobby".into(),
        token: None,
    };
    write_frame(&mut stream, &hello.encode()).await.unwrap();

    let reply = read_frame(&mut stream).await.unwrap().expect("error reply");
    match Envelope::decode(&reply).unwrap() {
        Envelope::Error { code, .. } => assert_eq!(code, "handshake"),
        other => panic!("expected handshake error, got {other:?}"),
    }
}
