//! Serves blocks to leeching peers out of verified pieces.
//!
//! Piece bytes come back from the persistence collaborator asynchronously,
//! so requests queue per piece until the data arrives; a small cache keeps
//! the hot pieces around since peers usually stream a piece block by block.

use std::collections::{BTreeMap, HashMap};

use bytes::Bytes;

use crate::download::{Block, DataBlock, PeerKey};
use crate::storage::StorageHandle;

const CACHE_SIZE: usize = 8;

#[derive(Debug, Default)]
pub struct Seeder {
    pending: HashMap<u32, Vec<(PeerKey, Block)>>,
    cache: BTreeMap<u32, Bytes>,
}

impl Seeder {
    /// Answers from cache or queues a retrieve. The caller has already
    /// validated the requested range against the piece we own.
    pub fn request_block(
        &mut self,
        peer: PeerKey,
        block: Block,
        storage: &StorageHandle,
    ) -> Option<DataBlock> {
        if let Some(piece_bytes) = self.cache.get(&block.piece) {
            return Some(DataBlock {
                piece: block.piece,
                offset: block.offset,
                data: piece_bytes.slice(block.range()),
            });
        }
        let waiters = self.pending.entry(block.piece).or_default();
        let first_for_piece = waiters.is_empty();
        waiters.push((peer, block));
        if first_for_piece {
            if let Err(e) = storage.try_retrieve(block.piece) {
                tracing::warn!(piece = block.piece, "Dropping upload, storage is saturated: {e}");
                self.pending.remove(&block.piece);
            }
        }
        None
    }

    /// The peer sent CANCEL for an upload we have not produced yet.
    pub fn cancel(&mut self, peer: PeerKey, block: Block) {
        if let Some(waiters) = self.pending.get_mut(&block.piece) {
            waiters.retain(|(p, b)| !(*p == peer && *b == block));
        }
    }

    pub fn peer_gone(&mut self, peer: PeerKey) {
        for waiters in self.pending.values_mut() {
            waiters.retain(|(p, _)| *p != peer);
        }
    }

    /// Piece bytes arrived (or did not). Returns the uploads now ready to
    /// go out.
    pub fn handle_retrieved(
        &mut self,
        piece: u32,
        bytes: Option<Bytes>,
    ) -> Vec<(PeerKey, DataBlock)> {
        let waiters = self.pending.remove(&piece).unwrap_or_default();
        let Some(piece_bytes) = bytes else {
            if !waiters.is_empty() {
                tracing::warn!(piece, "Dropping {} uploads, piece is unavailable", waiters.len());
            }
            return Vec::new();
        };
        if self.cache.len() == CACHE_SIZE {
            self.cache.pop_first();
        }
        self.cache.insert(piece, piece_bytes.clone());
        waiters
            .into_iter()
            .filter(|(_, block)| block.range().end <= piece_bytes.len())
            .map(|(peer, block)| {
                (
                    peer,
                    DataBlock {
                        piece,
                        offset: block.offset,
                        data: piece_bytes.slice(block.range()),
                    },
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use tokio::sync::mpsc;

    use super::Seeder;
    use crate::download::{Block, PeerKey};
    use crate::storage::{StorageHandle, StorageMessage};

    fn handle() -> (StorageHandle, mpsc::Receiver<StorageMessage>) {
        let (tx, rx) = mpsc::channel(8);
        (StorageHandle::new(tx), rx)
    }

    #[tokio::test]
    async fn queues_one_retrieve_per_piece() {
        let (storage, mut rx) = handle();
        let mut seeder = Seeder::default();
        let block = |offset| Block {
            piece: 2,
            offset,
            length: 4,
        };
        assert!(seeder
            .request_block(PeerKey(1), block(0), &storage)
            .is_none());
        assert!(seeder
            .request_block(PeerKey(2), block(4), &storage)
            .is_none());
        assert!(matches!(
            rx.try_recv().unwrap(),
            StorageMessage::Retrieve { piece: 2 }
        ));
        assert!(rx.try_recv().is_err());

        let ready = seeder.handle_retrieved(2, Some(Bytes::from_static(b"0123456789")));
        assert_eq!(ready.len(), 2);
        assert_eq!(&ready[0].1.data[..], b"0123");
        assert_eq!(&ready[1].1.data[..], b"4567");

        // next request for the same piece hits the cache
        let hit = seeder.request_block(PeerKey(3), block(8), &storage);
        assert_eq!(&hit.unwrap().data[..], b"89");
    }

    #[tokio::test]
    async fn cancelled_and_departed_waiters_drop_out() {
        let (storage, _rx) = handle();
        let mut seeder = Seeder::default();
        let block = Block {
            piece: 0,
            offset: 0,
            length: 2,
        };
        seeder.request_block(PeerKey(1), block, &storage);
        seeder.request_block(PeerKey(2), block, &storage);
        seeder.cancel(PeerKey(1), block);
        seeder.peer_gone(PeerKey(2));
        assert!(seeder
            .handle_retrieved(0, Some(Bytes::from_static(b"xy")))
            .is_empty());
    }

    #[tokio::test]
    async fn unavailable_piece_drops_waiters() {
        let (storage, _rx) = handle();
        let mut seeder = Seeder::default();
        let block = Block {
            piece: 7,
            offset: 0,
            length: 1,
        };
        seeder.request_block(PeerKey(1), block, &storage);
        assert!(seeder.handle_retrieved(7, None).is_empty());
    }
}
