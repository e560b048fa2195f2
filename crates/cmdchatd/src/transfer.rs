//! Inbound file-transfer tracking — bounds enforcement, not storage.
//!
//! The server forwards chunks as they arrive and never keeps reassembled
//! content; a [`Transfer`] only counts bytes so the declared size can be
//! enforced. Chunk indices must be strictly monotonic from zero; a gap or a
//! duplicate is fatal to the session that sent it.

use std::collections::HashMap;

pub use cmdchat_core::envelope::{FILE_CHUNK_SIZE as CHUNK_SIZE, FILE_MAX_BYTES as MAX_TRANSFER_BYTES};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransferError {
    #[error("declared size {0} exceeds maximum {MAX_TRANSFER_BYTES}")]
    Oversize(u64),

    #[error("transfer id already active")]
    DuplicateTransfer,

    #[error("chunk count {total_chunks} does not cover declared size {size}")]
    BadChunkCount { size: u64, total_chunks: u32 },

    #[error("chunk for unknown transfer")]
    UnknownTransfer,

    #[error("out-of-order chunk: expected index {expected}, got {got}")]
    OutOfOrder { expected: u32, got: u32 },

    #[error("received bytes exceed declared size {0}")]
    ByteOverflow(u64),
}

/// One in-progress inbound transfer.
#[derive(Debug)]
pub struct Transfer {
    pub filename: String,
    pub total_size: u64,
    pub total_chunks: u32,
    next_index: u32,
    received_bytes: u64,
}

/// Whether a chunk finished its transfer.
#[derive(Debug, PartialEq, Eq)]
pub enum ChunkOutcome {
    More,
    Complete,
}

/// All in-progress transfers for one session. Owned by the session's reader
/// task; discarded wholesale when the session ends.
#[derive(Debug, Default)]
pub struct TransferTable {
    active: HashMap<String, Transfer>,
}

impl TransferTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a transfer announced by `file-start`.
    pub fn begin(
        &mut self,
        transfer_id: &str,
        filename: &str,
        size: u64,
        total_chunks: u32,
    ) -> Result<(), TransferError> {
        if size > MAX_TRANSFER_BYTES {
            return Err(TransferError::Oversize(size));
        }
        let needed = size.div_ceil(CHUNK_SIZE as u64);
        if u64::from(total_chunks) != needed.max(1) {
            return Err(TransferError::BadChunkCount { size, total_chunks });
        }
        if self.active.contains_key(transfer_id) {
            return Err(TransferError::DuplicateTransfer);
        }
        self.active.insert(
            transfer_id.to_string(),
            Transfer {
                filename: filename.to_string(),
                total_size: size,
                total_chunks,
                next_index: 0,
                received_bytes: 0,
            },
        );
        Ok(())
    }

    /// Account one chunk. `data_len` is the decoded payload length.
    /// A completed transfer is removed from the table.
    pub fn accept_chunk(
        &mut self,
        transfer_id: &str,
        index: u32,
        data_len: usize,
    ) -> Result<ChunkOutcome, TransferError> {
        let transfer = self
            .active
            .get_mut(transfer_id)
            .ok_or(TransferError::UnknownTransfer)?;

        if index != transfer.next_index {
            return Err(TransferError::OutOfOrder {
                expected: transfer.next_index,
                got: index,
            });
        }
        transfer.received_bytes += data_len as u64;
        if transfer.received_bytes > transfer.total_size {
            return Err(TransferError::ByteOverflow(transfer.total_size));
        }
        transfer.next_index += 1;

        if transfer.next_index == transfer.total_chunks {
            self.active.remove(transfer_id);
            Ok(ChunkOutcome::Complete)
        } else {
            Ok(ChunkOutcome::More)
        }
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }
}
