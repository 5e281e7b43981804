use std::collections::HashMap;

use bytes::BytesMut;

use super::{active_piece::ActivePiece, PeerKey};

/// Reuses piece buffers across activations.
///
/// A torrent has at most two piece sizes (regular and last), so the pool is
/// two stacks. Returned buffers keep their bytes; the next piece overwrites
/// every block before it can be read. When a stack is empty we fall through
/// to a fresh zeroed allocation.
#[derive(Debug)]
pub struct BufferPool {
    regular_length: u32,
    last_length: u32,
    regular: Vec<BytesMut>,
    last: Vec<BytesMut>,
    max_pooled: usize,
}

impl BufferPool {
    pub fn new(regular_length: u32, last_length: u32, max_pooled: usize) -> Self {
        Self {
            regular_length,
            last_length,
            regular: Vec::new(),
            last: Vec::new(),
            max_pooled,
        }
    }

    pub fn acquire(&mut self, length: u32) -> BytesMut {
        debug_assert!(length == self.regular_length || length == self.last_length);
        let stack = if length == self.regular_length {
            &mut self.regular
        } else {
            &mut self.last
        };
        stack
            .pop()
            .unwrap_or_else(|| BytesMut::zeroed(length as usize))
    }

    pub fn release(&mut self, buffer: BytesMut) {
        let stack = if buffer.len() == self.regular_length as usize {
            &mut self.regular
        } else if buffer.len() == self.last_length as usize {
            &mut self.last
        } else {
            debug_assert!(false, "foreign buffer of {} bytes", buffer.len());
            return;
        };
        if stack.len() < self.max_pooled {
            stack.push(buffer);
        }
    }
}

/// Pieces currently being downloaded, keyed by index.
///
/// The surrounding scheduler keeps the map under `max_active`; exceeding it
/// is a configuration error, not a runtime condition.
#[derive(Debug)]
pub struct PieceStore {
    active: HashMap<u32, ActivePiece>,
    pool: BufferPool,
    max_active: usize,
}

impl PieceStore {
    pub fn new(regular_length: u32, last_length: u32, max_active: usize) -> Self {
        Self {
            active: HashMap::new(),
            pool: BufferPool::new(regular_length, last_length, max_active),
            max_active,
        }
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    pub fn is_at_cap(&self) -> bool {
        self.active.len() >= self.max_active
    }

    pub fn contains(&self, index: u32) -> bool {
        self.active.contains_key(&index)
    }

    pub fn get(&self, index: u32) -> Option<&ActivePiece> {
        self.active.get(&index)
    }

    pub fn get_mut(&mut self, index: u32) -> Option<&mut ActivePiece> {
        self.active.get_mut(&index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ActivePiece> {
        self.active.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ActivePiece> {
        self.active.values_mut()
    }

    pub fn indexes(&self) -> Vec<u32> {
        let mut out: Vec<u32> = self.active.keys().copied().collect();
        out.sort_unstable();
        out
    }

    pub fn activate(&mut self, index: u32, length: u32, now_ms: u64) -> &mut ActivePiece {
        assert!(
            !self.active.contains_key(&index),
            "piece {index} is already active"
        );
        assert!(
            self.active.len() < self.max_active,
            "active piece cap of {} exceeded",
            self.max_active
        );
        let buffer = self.pool.acquire(length);
        self.active
            .entry(index)
            .or_insert(ActivePiece::new(index, length, buffer, now_ms))
    }

    /// Detaches a piece, e.g. for verification. The buffer travels with it.
    pub fn remove(&mut self, index: u32) -> Option<ActivePiece> {
        self.active.remove(&index)
    }

    /// Drops a piece and recycles its buffer immediately (abandonment).
    pub fn retire(&mut self, index: u32) {
        if let Some(piece) = self.active.remove(&index) {
            self.pool.release(piece.into_buffer());
        }
    }

    /// Returns a buffer that finished its journey through verification and
    /// persistence.
    pub fn release_buffer(&mut self, buffer: BytesMut) {
        self.pool.release(buffer);
    }

    /// Disconnect cleanup across every active piece. Returns how many blocks
    /// went back to the unrequested set.
    pub fn clear_requests_for_peer(&mut self, peer: PeerKey) -> usize {
        self.active
            .values_mut()
            .map(|p| p.clear_requests_for_peer(peer))
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;

    use super::{BufferPool, PieceStore};
    use crate::download::PeerKey;
    use crate::BLOCK_LENGTH;

    #[test]
    fn pool_reuses_buffers_unzeroed() {
        let mut pool = BufferPool::new(64, 10, 4);
        let mut buffer = pool.acquire(64);
        assert_eq!(buffer.len(), 64);
        buffer[0] = 0xee;
        pool.release(buffer);
        let reused = pool.acquire(64);
        assert_eq!(reused[0], 0xee);
        // distinct stack for the short last piece
        assert_eq!(pool.acquire(10).len(), 10);
    }

    #[test]
    fn pool_falls_through_when_empty() {
        let mut pool = BufferPool::new(64, 64, 2);
        let a = pool.acquire(64);
        let b = pool.acquire(64);
        let c = pool.acquire(64);
        assert_eq!(c.len(), 64);
        drop((a, b));
    }

    #[test]
    fn pool_caps_retained_buffers() {
        let mut pool = BufferPool::new(8, 8, 1);
        pool.release(BytesMut::zeroed(8));
        pool.release(BytesMut::zeroed(8));
        assert_eq!(pool.regular.len() + pool.last.len(), 1);
    }

    #[test]
    fn store_lifecycle() {
        let mut store = PieceStore::new(BLOCK_LENGTH, 100, 2);
        store.activate(0, BLOCK_LENGTH, 0);
        store.activate(5, 100, 0);
        assert!(store.is_at_cap());
        assert_eq!(store.indexes(), vec![0, 5]);

        store.get_mut(0).unwrap().add_request(0, PeerKey(1), 0);
        assert_eq!(store.clear_requests_for_peer(PeerKey(1)), 1);

        store.retire(5);
        assert!(!store.contains(5));
        let piece = store.remove(0).unwrap();
        store.release_buffer(piece.into_buffer());
        assert!(store.is_empty());
    }

    #[test]
    #[should_panic]
    fn double_activation_is_a_bug() {
        let mut store = PieceStore::new(64, 64, 4);
        store.activate(1, 64, 0);
        store.activate(1, 64, 0);
    }
}
