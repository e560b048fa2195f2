//! Relay counters and the periodic metrics snapshot task.
//!
//! Counters are plain atomics bumped from the session loops; the snapshot
//! task logs them through `tracing` at the configured interval. Disabled
//! entirely when the interval is zero (or `CMDCHAT_METRICS=0`).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use crate::server::ServerCtx;

#[derive(Debug, Default)]
pub struct Metrics {
    pub sessions_opened: AtomicU64,
    pub sessions_closed: AtomicU64,
    pub frames_in: AtomicU64,
    pub frames_out: AtomicU64,
    pub chats_relayed: AtomicU64,
    pub chunks_relayed: AtomicU64,
    pub rate_drops: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Log a counter snapshot every `metrics_interval_secs` until shutdown.
pub async fn report_loop(ctx: Arc<ServerCtx>, mut shutdown: broadcast::Receiver<()>) {
    let interval = Duration::from_secs(ctx.config.metrics_interval_secs);
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.recv() => return,
            _ = ticker.tick() => {
                let m = &ctx.metrics;
                tracing::info!(
                    sessions = ctx.registry.session_count(),
                    rooms = ctx.registry.room_count(),
                    sessions_opened = m.sessions_opened.load(Ordering::Relaxed),
                    sessions_closed = m.sessions_closed.load(Ordering::Relaxed),
                    frames_in = m.frames_in.load(Ordering::Relaxed),
                    frames_out = m.frames_out.load(Ordering::Relaxed),
                    chats_relayed = m.chats_relayed.load(Ordering::Relaxed),
                    chunks_relayed = m.chunks_relayed.load(Ordering::Relaxed),
                    rate_drops = m.rate_drops.load(Ordering::Relaxed),
                    "metrics snapshot"
                );
            }
        }
    }
}
