//! The writer loop — the single producer of a session's outbound frames.
//!
//! Pops envelopes from the session's queue, seals them, writes frames.
//! When the queue is closed it drains what remains and shuts the stream
//! down; the supervisor bounds that drain with the configured deadline.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::io::{AsyncWrite, AsyncWriteExt};

use cmdchat_core::crypto::SealedCipher;
use cmdchat_core::frame::write_frame;

use super::SessionError;
use crate::registry::OutboundQueue;
use crate::server::ServerCtx;

pub(super) async fn run<W: AsyncWrite + Unpin>(
    mut write: W,
    cipher: SealedCipher,
    queue: Arc<OutboundQueue>,
    ctx: Arc<ServerCtx>,
) -> Result<(), SessionError> {
    while let Some(envelope) = queue.pop().await {
        let sealed = cipher
            .seal(&envelope.encode())
            .map_err(|e| SessionError::Protocol(format!("seal failed: {e}")))?;
        write_frame(&mut write, &sealed).await?;
        ctx.metrics.frames_out.fetch_add(1, Ordering::Relaxed);
    }
    let _ = write.shutdown().await;
    Ok(())
}
