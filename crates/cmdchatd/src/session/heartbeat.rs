//! The heartbeat loop — periodic pings and the liveness watchdog.

use std::sync::Arc;

use cmdchat_core::config::ServerConfig;
use cmdchat_core::envelope::Envelope;

use super::{SessionError, SessionShared};
use crate::registry::OutboundQueue;

/// Runs until the session goes stale; the returned error ends the session.
pub(super) async fn run(
    queue: Arc<OutboundQueue>,
    shared: Arc<SessionShared>,
    config: &ServerConfig,
) -> SessionError {
    let mut ticker = tokio::time::interval(config.heartbeat_interval());
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await; // the immediate first tick; the handshake just ran

    loop {
        ticker.tick().await;
        if shared.since_last_pong() > config.heartbeat_timeout() {
            return SessionError::Timeout;
        }
        queue.push(Envelope::Ping { nonce: rand::random::<u64>() });
    }
}
