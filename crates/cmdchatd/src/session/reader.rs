//! The reader loop — decrypt, decode, dispatch.
//!
//! Owns all of the session's mutable state except the send queue: current
//! name and room (mirrored into the registry under its lock), the rate
//! window, and the in-progress transfer table. Protocol violations end the
//! session; rate rejections only cost the offending envelope.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use tokio::io::AsyncRead;

use cmdchat_core::crypto::SealedCipher;
use cmdchat_core::envelope::{Envelope, EnvelopeError};
use cmdchat_core::frame::read_frame;
use cmdchat_core::sanitize;

use super::{broadcast_system, deliver, unix_ms, SessionEnd, SessionError, SessionShared};
use crate::rate::RateLimiter;
use crate::registry::OutboundQueue;
use crate::server::ServerCtx;
use crate::transfer::{ChunkOutcome, TransferTable, CHUNK_SIZE};

pub(super) struct ReaderTask {
    ctx: Arc<ServerCtx>,
    client_id: u64,
    cipher: SealedCipher,
    shared: Arc<SessionShared>,
    queue: Arc<OutboundQueue>,
    name: String,
    room: String,
    rate: RateLimiter,
    transfers: TransferTable,
}

impl ReaderTask {
    pub(super) fn new(
        ctx: Arc<ServerCtx>,
        client_id: u64,
        cipher: SealedCipher,
        shared: Arc<SessionShared>,
        queue: Arc<OutboundQueue>,
        name: String,
        room: String,
    ) -> Self {
        let rate = RateLimiter::new(ctx.config.rate_window(), ctx.config.rate_max_events);
        Self {
            ctx,
            client_id,
            cipher,
            shared,
            queue,
            name,
            room,
            rate,
            transfers: TransferTable::new(),
        }
    }

    pub(super) async fn run<R: AsyncRead + Unpin>(
        mut self,
        mut read: R,
    ) -> Result<SessionEnd, SessionError> {
        loop {
            let frame = match read_frame(&mut read).await? {
                Some(frame) => frame,
                None => return Ok(SessionEnd::PeerClosed),
            };
            self.ctx.metrics.frames_in.fetch_add(1, Ordering::Relaxed);

            let plain = self.cipher.open(&frame).map_err(|_| SessionError::Decrypt)?;
            let envelope = match Envelope::decode(&plain) {
                Ok(envelope) => envelope,
                Err(EnvelopeError::UnknownType(kind)) => {
                    tracing::debug!(client_id = self.client_id, kind = %kind, "ignoring unknown envelope type");
                    continue;
                }
                Err(e) => return Err(SessionError::Protocol(e.to_string())),
            };

            match envelope {
                Envelope::Chat { text, .. } => self.on_chat(text)?,
                Envelope::CmdNick { name } => self.on_nick(&name),
                Envelope::CmdJoin { room } => self.on_join(&room),
                Envelope::CmdQuit => return Ok(SessionEnd::Quit),
                Envelope::FileStart { transfer_id, filename, size, total_chunks, .. } => {
                    self.on_file_start(transfer_id, filename, size, total_chunks)?
                }
                Envelope::FileChunk { transfer_id, index, data, .. } => {
                    self.on_file_chunk(transfer_id, index, data)?
                }
                Envelope::Pong { .. } => self.shared.record_pong(),
                Envelope::Ping { nonce } => {
                    self.queue.push(Envelope::Pong { nonce });
                }
                other => {
                    // Known kind in the wrong direction; harmless, drop it.
                    tracing::debug!(
                        client_id = self.client_id,
                        kind = other.kind(),
                        "ignoring unexpected envelope"
                    );
                }
            }
        }
    }

    fn on_chat(&mut self, text: String) -> Result<(), SessionError> {
        let text =
            sanitize::message(&text).map_err(|e| SessionError::Protocol(e.to_string()))?;
        if !self.allow_send() {
            return Ok(());
        }

        let (members, seq) = self.ctx.registry.room_snapshot(&self.room);
        let envelope = Envelope::Chat {
            sender: self.name.clone(),
            room: self.room.clone(),
            text,
            ts: unix_ms(),
            seq,
        };
        self.ctx.metrics.chats_relayed.fetch_add(1, Ordering::Relaxed);
        // Chat echoes back to the sender as well; everyone shares the order.
        deliver(&self.ctx, &members, None, &envelope);
        Ok(())
    }

    fn on_nick(&mut self, raw: &str) {
        let new = sanitize::name(raw);
        if new == self.name {
            return;
        }
        let Some(old) = self.ctx.registry.set_name(self.client_id, &new) else {
            return;
        };
        tracing::debug!(client_id = self.client_id, from = %old, to = %new, "nick change");
        self.name = new.clone();
        broadcast_system(&self.ctx, &self.room, None, format!("{old} is now {new}"));
    }

    fn on_join(&mut self, raw: &str) {
        let new = sanitize::room(raw);
        if new == self.room {
            return;
        }
        broadcast_system(
            &self.ctx,
            &self.room,
            Some(self.client_id),
            format!("{} left", self.name),
        );
        if self.ctx.registry.rename_room(self.client_id, &new).is_none() {
            return;
        }
        tracing::debug!(client_id = self.client_id, from = %self.room, to = %new, "room change");
        self.room = new;
        broadcast_system(
            &self.ctx,
            &self.room,
            Some(self.client_id),
            format!("{} joined", self.name),
        );
    }

    fn on_file_start(
        &mut self,
        transfer_id: String,
        filename: String,
        size: u64,
        total_chunks: u32,
    ) -> Result<(), SessionError> {
        self.transfers.begin(&transfer_id, &filename, size, total_chunks)?;
        tracing::info!(
            client_id = self.client_id,
            transfer_id = %transfer_id,
            size,
            total_chunks,
            "inbound transfer started"
        );
        let envelope = Envelope::FileStart {
            sender: self.name.clone(),
            transfer_id,
            filename,
            size,
            total_chunks,
        };
        let members = self.ctx.registry.by_room(&self.room);
        deliver(&self.ctx, &members, Some(self.client_id), &envelope);
        Ok(())
    }

    fn on_file_chunk(
        &mut self,
        transfer_id: String,
        index: u32,
        data: String,
    ) -> Result<(), SessionError> {
        let bytes = B64
            .decode(&data)
            .map_err(|_| SessionError::Protocol("file-chunk data is not base64".into()))?;
        if bytes.len() > CHUNK_SIZE {
            return Err(SessionError::Protocol(format!(
                "file chunk of {} bytes exceeds {CHUNK_SIZE}",
                bytes.len()
            )));
        }
        // Rate gate before accounting: a rejected chunk must not advance the
        // transfer, or the sender could never legally resend that index and
        // the room would never see the chunk or its file-end.
        if !self.allow_send() {
            return Ok(());
        }
        let outcome = self.transfers.accept_chunk(&transfer_id, index, bytes.len())?;

        let members = self.ctx.registry.by_room(&self.room);
        let envelope = Envelope::FileChunk {
            sender: self.name.clone(),
            transfer_id: transfer_id.clone(),
            index,
            data,
        };
        self.ctx.metrics.chunks_relayed.fetch_add(1, Ordering::Relaxed);
        deliver(&self.ctx, &members, Some(self.client_id), &envelope);

        if outcome == ChunkOutcome::Complete {
            tracing::info!(client_id = self.client_id, transfer_id = %transfer_id, "transfer complete");
            let end = Envelope::FileEnd {
                sender: self.name.clone(),
                transfer_id,
            };
            deliver(&self.ctx, &members, Some(self.client_id), &end);
        }
        Ok(())
    }

    /// Shared rate gate for chat and file-chunk sends. On rejection the
    /// sender gets an error envelope and the send is dropped.
    fn allow_send(&mut self) -> bool {
        if self.rate.allow(Instant::now()) {
            return true;
        }
        self.ctx.metrics.rate_drops.fetch_add(1, Ordering::Relaxed);
        self.queue.push(Envelope::Error {
            code: "rate".into(),
            message: "rate limit exceeded, message dropped".into(),
        });
        false
    }
}
