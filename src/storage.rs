//! Persistence collaborator boundary.
//!
//! The engine does not touch disks. Verified pieces are handed over as
//! `(piece, buffer, offset, length)` — the offset/length pair narrows
//! boundary pieces to their wanted extent — and the buffer comes back with
//! the acknowledgement so the pool can reuse it. [`MemoryStorage`] is the
//! in-process implementation used by tests and examples; real deployments
//! put a disk actor behind the same handle.

use std::collections::HashMap;

use bytes::{Bytes, BytesMut};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

#[derive(Debug)]
pub enum StorageMessage {
    Persist {
        piece: u32,
        buffer: BytesMut,
        /// First wanted byte within the piece.
        offset: u32,
        /// Wanted byte count starting at `offset`.
        length: u32,
    },
    Retrieve {
        piece: u32,
    },
}

#[derive(Debug)]
pub enum StorageFeedback {
    Persisted {
        piece: u32,
        buffer: BytesMut,
    },
    PersistFailed {
        piece: u32,
        buffer: BytesMut,
        reason: String,
    },
    Data {
        piece: u32,
        bytes: Option<Bytes>,
    },
}

#[derive(Debug, Clone)]
pub struct StorageHandle {
    message_tx: mpsc::Sender<StorageMessage>,
}

impl StorageHandle {
    pub fn new(message_tx: mpsc::Sender<StorageMessage>) -> Self {
        Self { message_tx }
    }

    /// Queues a persist. A saturated channel hands the message back so the
    /// caller keeps ownership of the buffer and can retry.
    pub fn try_persist(
        &self,
        piece: u32,
        buffer: BytesMut,
        offset: u32,
        length: u32,
    ) -> Result<(), StorageMessage> {
        self.message_tx
            .try_send(StorageMessage::Persist {
                piece,
                buffer,
                offset,
                length,
            })
            .map_err(|e| e.into_inner())
    }

    pub fn try_retrieve(&self, piece: u32) -> anyhow::Result<()> {
        self.message_tx
            .try_send(StorageMessage::Retrieve { piece })?;
        Ok(())
    }
}

/// Keeps persisted extents in memory.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    pieces: HashMap<u32, StoredPiece>,
}

#[derive(Debug)]
struct StoredPiece {
    offset: u32,
    piece_length: u32,
    bytes: Bytes,
}

impl MemoryStorage {
    pub fn spawn(
        task_tracker: &TaskTracker,
        cancellation_token: CancellationToken,
    ) -> (StorageHandle, mpsc::Receiver<StorageFeedback>) {
        let (message_tx, mut message_rx) = mpsc::channel(128);
        let (feedback_tx, feedback_rx) = mpsc::channel(128);
        let mut storage = Self::default();
        task_tracker.spawn(async move {
            loop {
                tokio::select! {
                    Some(message) = message_rx.recv() => {
                        let feedback = storage.handle_message(message);
                        if feedback_tx.send(feedback).await.is_err() {
                            break;
                        }
                    }
                    _ = cancellation_token.cancelled() => break,
                }
            }
        });
        (StorageHandle::new(message_tx), feedback_rx)
    }

    fn handle_message(&mut self, message: StorageMessage) -> StorageFeedback {
        match message {
            StorageMessage::Persist {
                piece,
                buffer,
                offset,
                length,
            } => {
                let start = offset as usize;
                let end = start + length as usize;
                if end > buffer.len() {
                    let buffer_len = buffer.len();
                    return StorageFeedback::PersistFailed {
                        piece,
                        buffer,
                        reason: format!(
                            "extent {start}..{end} exceeds the {buffer_len} byte piece"
                        ),
                    };
                }
                self.pieces.insert(
                    piece,
                    StoredPiece {
                        offset,
                        piece_length: buffer.len() as u32,
                        bytes: Bytes::copy_from_slice(&buffer[start..end]),
                    },
                );
                StorageFeedback::Persisted { piece, buffer }
            }
            StorageMessage::Retrieve { piece } => {
                let bytes = self.pieces.get(&piece).and_then(|stored| {
                    // only fully persisted pieces can be served back
                    (stored.offset == 0 && stored.bytes.len() as u32 == stored.piece_length)
                        .then(|| stored.bytes.clone())
                });
                StorageFeedback::Data { piece, bytes }
            }
        }
    }
}
