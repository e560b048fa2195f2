//! The client loop: connect, handshake, then relay between the terminal
//! and the server until the stream drops or the user quits.
//!
//! One stdin thread feeds a channel that survives reconnects; each
//! connection attempt generates a fresh keypair, handshakes, and then
//! selects between terminal input and server frames. Any stream error
//! falls back to the backoff loop.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use cmdchat_core::crypto::{SealedCipher, WrapKeypair};
use cmdchat_core::envelope::{Envelope, EnvelopeError, FILE_CHUNK_SIZE, FILE_MAX_BYTES};
use cmdchat_core::frame::{read_frame, write_frame};

use crate::backoff::Backoff;
use crate::history::{HistoryRecord, HistoryWriter};
use crate::input::{self, InputAction};
use crate::render::{self, Renderer, RendererKind};
use crate::tls;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct ClientOpts {
    pub host: String,
    pub port: u16,
    pub name: String,
    pub room: String,
    pub token: Option<String>,
    pub renderer: RendererKind,
    pub buffer_size: usize,
    pub tls: bool,
    pub tls_insecure: bool,
    pub ca_file: Option<PathBuf>,
    pub history_file: Option<PathBuf>,
    pub history_passphrase: Option<String>,
    pub quiet_reconnect: bool,
}

enum SessionEnd {
    Quit,
    Disconnected,
}

trait Conn: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Conn for T {}

/// Run until the user quits. Reconnects with backoff on any stream error.
pub async fn run(opts: ClientOpts) -> Result<()> {
    let mut renderer = render::make(opts.renderer);
    let mut history = match (&opts.history_file, &opts.history_passphrase) {
        (Some(path), Some(passphrase)) => Some(
            HistoryWriter::open(path, passphrase)
                .with_context(|| format!("cannot open history file {}", path.display()))?,
        ),
        _ => None,
    };

    // Blocking stdin reader; the channel outlives individual connections so
    // typed-ahead lines survive a reconnect.
    let (line_tx, mut line_rx) = mpsc::channel::<String>(opts.buffer_size);
    std::thread::spawn(move || stdin_loop(line_tx));

    let mut backoff = Backoff::new();
    loop {
        let end = connect_and_run(
            &opts,
            renderer.as_mut(),
            history.as_mut(),
            &mut line_rx,
            &mut backoff,
        )
        .await;

        match end {
            Ok(SessionEnd::Quit) => {
                renderer.status("bye");
                return Ok(());
            }
            Ok(SessionEnd::Disconnected) => {
                if !opts.quiet_reconnect {
                    renderer.status("server closed the connection");
                }
            }
            Err(e) => {
                if !opts.quiet_reconnect {
                    renderer.status(&format!("connection lost: {e:#}"));
                }
            }
        }

        let delay = backoff.next_delay();
        if !opts.quiet_reconnect {
            renderer.status(&format!("reconnecting in {:.1}s", delay.as_secs_f64()));
        }
        tokio::time::sleep(delay).await;
    }
}

fn stdin_loop(line_tx: mpsc::Sender<String>) {
    use std::io::BufRead;
    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let Ok(line) = line else { break };
        if line_tx.blocking_send(line).is_err() {
            break;
        }
    }
    // EOF: dropping the sender tells the loop to quit cleanly.
}

async fn connect_and_run(
    opts: &ClientOpts,
    renderer: &mut dyn Renderer,
    mut history: Option<&mut HistoryWriter>,
    line_rx: &mut mpsc::Receiver<String>,
    backoff: &mut Backoff,
) -> Result<SessionEnd> {
    let tcp = tokio::time::timeout(
        CONNECT_TIMEOUT,
        TcpStream::connect((opts.host.as_str(), opts.port)),
    )
    .await
    .context("connect timed out")?
    .with_context(|| format!("cannot connect to {}:{}", opts.host, opts.port))?;
    tcp.set_nodelay(true).ok();

    let mut stream: Box<dyn Conn> = if opts.tls {
        Box::new(tls::connect(tcp, &opts.host, opts.tls_insecure, opts.ca_file.as_deref()).await?)
    } else {
        Box::new(tcp)
    };

    // Fresh keypair every attempt; keygen is CPU-bound, keep it off the
    // runtime threads.
    let keypair = tokio::task::spawn_blocking(WrapKeypair::generate)
        .await
        .context("keygen task failed")?
        .context("keypair generation failed")?;

    let hello = Envelope::Hello {
        public_key: keypair.public_b64().context("public key encoding failed")?,
        name: opts.name.clone(),
        room: opts.room.clone(),
        token: opts.token.clone(),
    };
    write_frame(&mut stream, &hello.encode()).await?;

    let reply = tokio::time::timeout(HANDSHAKE_TIMEOUT, read_frame(&mut stream))
        .await
        .context("handshake timed out")??
        .context("server closed during handshake")?;

    let cipher = match Envelope::decode(&reply).context("bad handshake reply")? {
        Envelope::SessionInit { wrapped_key, client_id, .. } => {
            tracing::debug!(client_id, "session established");
            SealedCipher::new(&keypair.unwrap_key(&wrapped_key).context("session key unwrap failed")?)
        }
        Envelope::Error { code, message } => {
            bail!("server rejected handshake ({code}): {message}")
        }
        other => bail!("unexpected {} during handshake", other.kind()),
    };

    backoff.reset();
    renderer.status(&format!(
        "connected to {}:{} as {} in {}",
        opts.host, opts.port, opts.name, opts.room
    ));

    let (mut read_half, mut write_half) = tokio::io::split(stream);
    let mut inbound = InboundFiles::default();

    loop {
        tokio::select! {
            line = line_rx.recv() => {
                let Some(line) = line else {
                    // stdin closed
                    send_sealed(&mut write_half, &cipher, &Envelope::CmdQuit).await.ok();
                    return Ok(SessionEnd::Quit);
                };
                match input::parse_line(&line) {
                    InputAction::Send(envelope) => {
                        send_sealed(&mut write_half, &cipher, &envelope).await?;
                    }
                    InputAction::SendFile(path) => {
                        send_file(&mut write_half, &cipher, &path, renderer).await?;
                    }
                    InputAction::Clear => renderer.clear(),
                    InputAction::Help => renderer.status(input::HELP),
                    InputAction::Quit => {
                        send_sealed(&mut write_half, &cipher, &Envelope::CmdQuit).await.ok();
                        return Ok(SessionEnd::Quit);
                    }
                    InputAction::Invalid(message) => renderer.status(&message),
                    InputAction::Nothing => {}
                }
            }

            frame = read_frame(&mut read_half) => {
                let Some(frame) = frame? else {
                    return Ok(SessionEnd::Disconnected);
                };
                let plain = cipher.open(&frame).context("server frame failed authentication")?;
                let envelope = match Envelope::decode(&plain) {
                    Ok(envelope) => envelope,
                    Err(EnvelopeError::UnknownType(kind)) => {
                        tracing::debug!(kind = %kind, "ignoring unknown envelope type");
                        continue;
                    }
                    Err(e) => return Err(anyhow!(e).context("malformed server envelope")),
                };

                match &envelope {
                    Envelope::Ping { nonce } => {
                        send_sealed(&mut write_half, &cipher, &Envelope::Pong { nonce: *nonce }).await?;
                        continue;
                    }
                    Envelope::Chat { sender, room, text, ts, .. } => {
                        if let Some(history) = history.as_deref_mut() {
                            let record = HistoryRecord {
                                timestamp: *ts,
                                room: room.clone(),
                                sender: sender.clone(),
                                text: text.clone(),
                            };
                            if let Err(e) = history.append(&record) {
                                tracing::warn!(error = %e, "history append failed");
                            }
                        }
                    }
                    Envelope::FileStart { .. } | Envelope::FileChunk { .. } | Envelope::FileEnd { .. } => {
                        inbound.handle(&envelope, renderer);
                    }
                    _ => {}
                }
                renderer.render(&envelope);
            }
        }
    }
}

async fn send_sealed<W: AsyncWrite + Unpin>(
    write: &mut W,
    cipher: &SealedCipher,
    envelope: &Envelope,
) -> Result<()> {
    let sealed = cipher
        .seal(&envelope.encode())
        .map_err(|e| anyhow!("seal failed: {e}"))?;
    write_frame(write, &sealed).await?;
    Ok(())
}

/// Relay a local file to the room: `file-start`, then 32 KiB chunks in
/// order. The server emits the closing `file-end` to the other members.
async fn send_file<W: AsyncWrite + Unpin>(
    write: &mut W,
    cipher: &SealedCipher,
    path: &Path,
    renderer: &mut dyn Renderer,
) -> Result<()> {
    let data = match tokio::fs::read(path).await {
        Ok(data) => data,
        Err(e) => {
            renderer.status(&format!("cannot read {}: {e}", path.display()));
            return Ok(());
        }
    };
    if data.len() as u64 > FILE_MAX_BYTES {
        renderer.status(&format!(
            "{} is {} bytes; the limit is {FILE_MAX_BYTES}",
            path.display(),
            data.len()
        ));
        return Ok(());
    }

    let filename = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("file.bin")
        .to_string();
    let total_chunks = data.len().div_ceil(FILE_CHUNK_SIZE).max(1) as u32;
    let transfer_id = {
        let mut id = [0u8; 8];
        use rand::RngCore;
        rand::thread_rng().fill_bytes(&mut id);
        hex::encode(id)
    };

    send_sealed(
        write,
        cipher,
        &Envelope::FileStart {
            sender: String::new(),
            transfer_id: transfer_id.clone(),
            filename: filename.clone(),
            size: data.len() as u64,
            total_chunks,
        },
    )
    .await?;

    if data.is_empty() {
        let chunk = Envelope::FileChunk {
            sender: String::new(),
            transfer_id,
            index: 0,
            data: String::new(),
        };
        send_sealed(write, cipher, &chunk).await?;
    } else {
        for (index, chunk) in data.chunks(FILE_CHUNK_SIZE).enumerate() {
            let envelope = Envelope::FileChunk {
                sender: String::new(),
                transfer_id: transfer_id.clone(),
                index: index as u32,
                data: B64.encode(chunk),
            };
            send_sealed(write, cipher, &envelope).await?;
        }
    }

    renderer.status(&format!("sent {filename} ({total_chunks} chunks)"));
    Ok(())
}

// ── Inbound file reassembly ───────────────────────────────────────────────────

#[derive(Default)]
struct InboundFiles {
    active: HashMap<String, InboundFile>,
}

struct InboundFile {
    filename: String,
    size: u64,
    data: Vec<u8>,
}

impl InboundFiles {
    fn handle(&mut self, envelope: &Envelope, renderer: &mut dyn Renderer) {
        match envelope {
            Envelope::FileStart { transfer_id, filename, size, .. } => {
                if *size > FILE_MAX_BYTES {
                    renderer.status(&format!("ignoring oversized transfer {transfer_id}"));
                    return;
                }
                self.active.insert(
                    transfer_id.clone(),
                    InboundFile {
                        filename: sanitize_filename(filename),
                        size: *size,
                        data: Vec::new(),
                    },
                );
            }
            Envelope::FileChunk { transfer_id, data, .. } => {
                let Some(file) = self.active.get_mut(transfer_id) else { return };
                let Ok(bytes) = B64.decode(data) else {
                    renderer.status(&format!("transfer {transfer_id}: undecodable chunk, dropping"));
                    self.active.remove(transfer_id);
                    return;
                };
                if (file.data.len() + bytes.len()) as u64 > file.size {
                    renderer.status(&format!("transfer {transfer_id} overran its size, dropping"));
                    self.active.remove(transfer_id);
                    return;
                }
                file.data.extend_from_slice(&bytes);
            }
            Envelope::FileEnd { transfer_id, .. } => {
                let Some(file) = self.active.remove(transfer_id) else { return };
                let path = save_path(&file.filename);
                match std::fs::write(&path, &file.data) {
                    Ok(()) => renderer.status(&format!(
                        "saved {} ({} bytes)",
                        path.display(),
                        file.data.len()
                    )),
                    Err(e) => renderer.status(&format!("could not save {}: {e}", path.display())),
                }
            }
            _ => {}
        }
    }
}

/// Keep only the final path component and printable characters.
fn sanitize_filename(raw: &str) -> String {
    let base = raw.rsplit(['/', '\\']).next().unwrap_or(raw);
    let cleaned: String = base
        .chars()
        .filter(|c| !c.is_control() && *c != '/' && *c != '\\')
        .collect();
    let cleaned = cleaned.trim_matches(['.', ' ']).to_string();
    if cleaned.is_empty() {
        "received.bin".to_string()
    } else {
        cleaned
    }
}

/// Non-clobbering save location in the working directory.
fn save_path(filename: &str) -> PathBuf {
    let first = PathBuf::from(format!("recv_{filename}"));
    if !first.exists() {
        return first;
    }
    for n in 1..1000 {
        let candidate = PathBuf::from(format!("recv_{n}_{filename}"));
        if !candidate.exists() {
            return candidate;
        }
    }
    first
}
