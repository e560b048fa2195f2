//! End-to-end scenarios against an in-process server on loopback.
//!
//! `start_server` binds a `cmdchatd::Server` on an ephemeral port and runs
//! it on the test runtime; `TestClient` speaks the real wire protocol
//! (frames, kv envelopes, key-wrap handshake, sealed traffic) over TCP.

mod auth;
mod files;
mod heartbeat;
mod rate;
mod rooms;

use std::net::SocketAddr;
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::net::TcpStream;
use tokio::sync::broadcast;

use cmdchat_core::config::ServerConfig;
use cmdchat_core::crypto::{SealedCipher, WrapKeypair};
use cmdchat_core::envelope::Envelope;
use cmdchat_core::frame::{read_frame, write_frame};
use cmdchatd::Server;

/// One RSA keypair for the whole test binary; generation is the slow part
/// and the server wraps a fresh session key per connection regardless.
fn test_keypair() -> &'static WrapKeypair {
    static KEYPAIR: OnceLock<WrapKeypair> = OnceLock::new();
    KEYPAIR.get_or_init(|| WrapKeypair::generate().expect("keypair generation"))
}

pub struct TestServer {
    pub addr: SocketAddr,
    shutdown: broadcast::Sender<()>,
    handle: tokio::task::JoinHandle<()>,
}

/// Bind on an ephemeral loopback port and run the server as a task.
pub async fn start_server(mut config: ServerConfig) -> TestServer {
    config.host = "127.0.0.1".to_string();
    config.port = 0;
    let server = Server::bind(config).await.expect("server bind");
    let addr = server.local_addr().expect("local addr");
    let shutdown = server.shutdown_handle();
    let handle = tokio::spawn(async move {
        server.run().await.expect("server run");
    });
    TestServer { addr, shutdown, handle }
}

impl TestServer {
    /// Graceful shutdown; waits for the accept loop and sessions to finish.
    pub async fn stop(self) {
        let _ = self.shutdown.send(());
        let _ = self.handle.await;
    }
}

pub enum ConnectOutcome {
    Established(TestClient),
    /// The server answered with an error envelope and closed the stream.
    Rejected { code: String },
}

pub struct TestClient {
    stream: TcpStream,
    cipher: SealedCipher,
    pub client_id: u64,
}

/// Full handshake; panics on rejection. Most tests want this.
pub async fn connect(
    addr: SocketAddr,
    name: &str,
    room: &str,
    token: Option<&str>,
) -> Result<TestClient> {
    match try_connect(addr, name, room, token).await? {
        ConnectOutcome::Established(client) => Ok(client),
        ConnectOutcome::Rejected { code } => bail!("handshake rejected: {code}"),
    }
}

/// Full handshake, surfacing a server rejection instead of failing.
pub async fn try_connect(
    addr: SocketAddr,
    name: &str,
    room: &str,
    token: Option<&str>,
) -> Result<ConnectOutcome> {
    let mut stream = TcpStream::connect(addr).await.context("tcp connect")?;
    stream.set_nodelay(true).ok();

    let keypair = test_keypair();
    let hello = Envelope::Hello {
        public_key: keypair.public_b64()?,
        name: name.to_string(),
        room: room.to_string(),
        token: token.map(str::to_string),
    };
    write_frame(&mut stream, &hello.encode()).await?;

    let reply = read_frame(&mut stream)
        .await?
        .context("server closed before replying to hello")?;
    match Envelope::decode(&reply)? {
        Envelope::SessionInit { wrapped_key, client_id, .. } => {
            let key = keypair.unwrap_key(&wrapped_key)?;
            Ok(ConnectOutcome::Established(TestClient {
                stream,
                cipher: SealedCipher::new(&key),
                client_id,
            }))
        }
        Envelope::Error { code, .. } => {
            // The server closes after a handshake error.
            let next = tokio::time::timeout(Duration::from_secs(2), read_frame(&mut stream)).await;
            match next {
                Ok(Ok(None)) | Ok(Err(_)) => {}
                Ok(Ok(Some(_))) => bail!("server kept talking after rejecting the handshake"),
                Err(_) => bail!("server left the stream open after rejecting the handshake"),
            }
            Ok(ConnectOutcome::Rejected { code })
        }
        other => bail!("unexpected {} during handshake", other.kind()),
    }
}

impl TestClient {
    pub async fn send(&mut self, envelope: &Envelope) -> Result<()> {
        let sealed = self
            .cipher
            .seal(&envelope.encode())
            .map_err(|e| anyhow::anyhow!("seal: {e}"))?;
        write_frame(&mut self.stream, &sealed).await?;
        Ok(())
    }

    /// Next envelope, however long it takes.
    pub async fn recv(&mut self) -> Result<Envelope> {
        let frame = read_frame(&mut self.stream)
            .await?
            .context("server closed the stream")?;
        let plain = self
            .cipher
            .open(&frame)
            .map_err(|e| anyhow::anyhow!("open: {e}"))?;
        Ok(Envelope::decode(&plain)?)
    }

    /// Next envelope, or `None` if the deadline passes first.
    pub async fn recv_timeout(&mut self, deadline: Duration) -> Result<Option<Envelope>> {
        match tokio::time::timeout(deadline, self.recv()).await {
            Ok(result) => result.map(Some),
            Err(_) => Ok(None),
        }
    }

    /// Next envelope that is not a ping, answering pings along the way.
    pub async fn recv_answering_pings(&mut self) -> Result<Envelope> {
        loop {
            match self.recv().await? {
                Envelope::Ping { nonce } => {
                    self.send(&Envelope::Pong { nonce }).await?;
                }
                other => return Ok(other),
            }
        }
    }
}

/// A client-side chat envelope; the server fills the other fields.
pub fn chat(text: &str) -> Envelope {
    Envelope::Chat {
        sender: String::new(),
        room: String::new(),
        text: text.to_string(),
        ts: 0,
        seq: 0,
    }
}

/// Assert the envelope is a system notice with exactly this text.
pub fn assert_system(envelope: &Envelope, expected: &str) {
    match envelope {
        Envelope::System { text } => assert_eq!(text, expected),
        other => panic!("expected system {expected:?}, got {other:?}"),
    }
}
