//! Per-session lifecycle: handshake, the three cooperative loops, and
//! termination.
//!
//! Each connection gets one supervisor task. It drives the handshake, then
//! runs the reader and heartbeat loops inside a `select!` alongside the
//! spawned writer task; whichever finishes first decides the session's fate
//! and the others are cancelled. Termination removes the session from the
//! registry, announces the departure, and lets the writer drain its queue
//! for a bounded time before the stream is dropped.

mod handshake;
mod heartbeat;
mod reader;
mod writer;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::broadcast;

use cmdchat_core::envelope::Envelope;
use cmdchat_core::frame::FrameError;

use crate::registry::{Enqueue, OutboundQueue};
use crate::server::ServerCtx;
use crate::transfer::TransferError;

/// A connection stream as handed over by the accept path. Plain TCP and TLS
/// both erase to this.
pub trait Conn: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Conn for T {}

/// Why a session ended, when it ended in error.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("authenticated decryption failed")]
    Decrypt,

    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error("authentication rejected")]
    Auth,

    #[error("heartbeat or handshake deadline passed")]
    Timeout,

    #[error("send queue overflowed past recovery")]
    Backpressure,
}

/// Clean ways a session can end.
#[derive(Debug)]
enum SessionEnd {
    PeerClosed,
    Quit,
    ServerShutdown,
}

/// State shared between the reader (writes `last_pong`) and the heartbeat
/// loop (reads it).
pub(crate) struct SessionShared {
    started: Instant,
    last_pong_ms: AtomicU64,
}

impl SessionShared {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            last_pong_ms: AtomicU64::new(0),
        }
    }

    fn record_pong(&self) {
        let elapsed = self.started.elapsed().as_millis() as u64;
        self.last_pong_ms.store(elapsed, Ordering::Relaxed);
    }

    fn since_last_pong(&self) -> Duration {
        let elapsed = self.started.elapsed().as_millis() as u64;
        let last = self.last_pong_ms.load(Ordering::Relaxed);
        Duration::from_millis(elapsed.saturating_sub(last))
    }
}

/// Current UTC time as unix milliseconds; the server-assigned `ts`.
pub(crate) fn unix_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Drive one connection from accept to close.
pub async fn run_connection(
    mut stream: Box<dyn Conn>,
    ctx: Arc<ServerCtx>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let client_id = ctx.allocate_client_id();

    let hs = match handshake::perform(&mut stream, &ctx, client_id).await {
        Ok(hs) => hs,
        Err(e) => {
            tracing::warn!(client_id, error = %e, "handshake failed");
            return;
        }
    };

    let queue = OutboundQueue::new(ctx.config.send_queue_bound);
    ctx.registry.insert(client_id, &hs.name, &hs.room, queue.clone());
    ctx.metrics.sessions_opened.fetch_add(1, Ordering::Relaxed);
    tracing::info!(client_id, name = %hs.name, room = %hs.room, "session established");
    broadcast_system(&ctx, &hs.room, Some(client_id), format!("{} joined", hs.name));

    let shared = Arc::new(SessionShared::new());
    shared.record_pong(); // the handshake counts as liveness

    let (read_half, write_half) = tokio::io::split(stream);
    let mut writer_task = tokio::spawn(writer::run(
        write_half,
        hs.cipher.clone(),
        queue.clone(),
        ctx.clone(),
    ));

    let reader = reader::ReaderTask::new(
        ctx.clone(),
        client_id,
        hs.cipher,
        shared.clone(),
        queue.clone(),
        hs.name,
        hs.room,
    );

    let mut writer_finished = false;
    let outcome = tokio::select! {
        r = reader.run(read_half) => r,
        e = heartbeat::run(queue.clone(), shared.clone(), &ctx.config) => Err(e),
        r = &mut writer_task => {
            writer_finished = true;
            match r {
                Ok(Ok(())) => Err(SessionError::Backpressure),
                Ok(Err(e)) => Err(e),
                Err(join) => Err(SessionError::Protocol(format!("writer task failed: {join}"))),
            }
        }
        _ = shutdown.recv() => Ok(SessionEnd::ServerShutdown),
    };

    match &outcome {
        Ok(end) => tracing::info!(client_id, ?end, "session closing"),
        Err(e) => tracing::warn!(client_id, error = %e, "session terminated"),
    }

    // Termination: drop from the registry first so no new broadcasts target
    // this session, then announce, then let the writer drain.
    let entry = ctx.registry.remove(client_id);
    queue.close();
    if let Some(entry) = entry {
        broadcast_system(&ctx, &entry.room, None, format!("{} left", entry.name));
    }

    if !writer_finished
        && tokio::time::timeout(ctx.config.drain_deadline(), &mut writer_task)
            .await
            .is_err()
    {
        tracing::debug!(client_id, "drain deadline passed, aborting writer");
        writer_task.abort();
    }
    ctx.metrics.sessions_closed.fetch_add(1, Ordering::Relaxed);
}

/// Enqueue a `system` notice to every member of `room` except `exclude`.
pub(crate) fn broadcast_system(ctx: &ServerCtx, room: &str, exclude: Option<u64>, text: String) {
    deliver(ctx, &ctx.registry.by_room(room), exclude, &Envelope::System { text });
}

/// Snapshot-then-enqueue delivery. Sessions that vanished between snapshot
/// and lookup are skipped; a session whose queue refuses even the overflow
/// policy is closed so its supervisor tears it down.
pub(crate) fn deliver(ctx: &ServerCtx, members: &[u64], exclude: Option<u64>, envelope: &Envelope) {
    for &id in members {
        if Some(id) == exclude {
            continue;
        }
        let Some(queue) = ctx.registry.queue(id) else {
            continue;
        };
        match queue.push(envelope.clone()) {
            Enqueue::Queued | Enqueue::Closed => {}
            Enqueue::DroppedOldest => {
                tracing::debug!(client_id = id, "send queue overflow, dropped oldest");
            }
            Enqueue::Refused => {
                tracing::warn!(client_id = id, "send queue stuck full, closing session");
                queue.close();
            }
        }
    }
}
