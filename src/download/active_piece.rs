use std::collections::HashSet;

use bytes::BytesMut;

use super::{BlockPosition, PeerKey};
use crate::BLOCK_LENGTH;

#[derive(Debug, Clone, Copy)]
struct RequestRecord {
    peer: PeerKey,
    requested_at: u64,
}

/// Download state of one piece currently in flight.
///
/// Owns the piece buffer for its whole lifetime; blocks are written in place
/// at `block_index * BLOCK_LENGTH`. Two counters are maintained incrementally
/// so the scheduler's hot queries stay O(1): `received_count` mirrors the
/// `received` flags and `unrequested_count` mirrors the number of blocks with
/// no received data and no pending request. Every mutation below must keep
/// both in sync.
#[derive(Debug)]
pub struct ActivePiece {
    index: u32,
    length: u32,
    buffer: BytesMut,
    received: Box<[bool]>,
    requests: Box<[Vec<RequestRecord>]>,
    senders: Box<[Option<PeerKey>]>,
    received_count: usize,
    unrequested_count: usize,
    exclusive: Option<PeerKey>,
    activated_at: u64,
    last_activity: u64,
}

impl ActivePiece {
    /// The buffer comes from the pool and is not zeroed; every byte handed
    /// out later is overwritten by `add_block` first.
    pub fn new(index: u32, length: u32, buffer: BytesMut, now_ms: u64) -> Self {
        debug_assert_eq!(buffer.len(), length as usize);
        let blocks = (length as usize).div_ceil(BLOCK_LENGTH as usize);
        Self {
            index,
            length,
            buffer,
            received: vec![false; blocks].into_boxed_slice(),
            requests: vec![Vec::new(); blocks].into_boxed_slice(),
            senders: vec![None; blocks].into_boxed_slice(),
            received_count: 0,
            unrequested_count: blocks,
            exclusive: None,
            activated_at: now_ms,
            last_activity: now_ms,
        }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn length(&self) -> u32 {
        self.length
    }

    pub fn block_count(&self) -> usize {
        self.received.len()
    }

    pub fn block_position(&self, block: usize) -> BlockPosition {
        debug_assert!(block < self.block_count());
        let offset = block as u32 * BLOCK_LENGTH;
        BlockPosition {
            offset,
            length: (self.length - offset).min(BLOCK_LENGTH),
        }
    }

    /// Maps a wire `begin` offset to a block index. `None` for offsets that
    /// are not on a block boundary or beyond the piece.
    pub fn block_at(&self, begin: u32) -> Option<usize> {
        if begin % BLOCK_LENGTH != 0 || begin >= self.length {
            return None;
        }
        Some((begin / BLOCK_LENGTH) as usize)
    }

    pub fn is_received(&self, block: usize) -> bool {
        self.received[block]
    }

    pub fn has_pending_request(&self, block: usize, peer: PeerKey) -> bool {
        self.requests[block].iter().any(|r| r.peer == peer)
    }

    /// Records an outstanding request. A repeated request from the same peer
    /// collapses into the existing record so its timeout clock keeps running.
    pub fn add_request(&mut self, block: usize, peer: PeerKey, now_ms: u64) {
        let records = &mut self.requests[block];
        if records.iter().any(|r| r.peer == peer) {
            return;
        }
        if records.is_empty() && !self.received[block] {
            self.unrequested_count -= 1;
        }
        records.push(RequestRecord {
            peer,
            requested_at: now_ms,
        });
    }

    /// Accepts block data. Returns `false` for a duplicate, which is the
    /// benign race after an advisory CANCEL, not an error.
    pub fn add_block(&mut self, block: usize, data: &[u8], peer: PeerKey, now_ms: u64) -> bool {
        if self.received[block] {
            return false;
        }
        let position = self.block_position(block);
        debug_assert_eq!(data.len(), position.length as usize);
        let start = position.offset as usize;
        self.buffer[start..start + data.len()].copy_from_slice(data);

        let had_requests = !self.requests[block].is_empty();
        self.requests[block].clear();
        self.received[block] = true;
        self.received_count += 1;
        self.senders[block] = Some(peer);
        if !had_requests {
            // the block was sitting in the unrequested set (e.g. after a
            // timeout) and an already-cancelled transfer still delivered it
            self.unrequested_count -= 1;
        }
        self.last_activity = now_ms;
        true
    }

    /// Removes one peer's request for a block. Clears exclusivity when the
    /// owner backs out.
    pub fn cancel_request(&mut self, block: usize, peer: PeerKey) {
        let records = &mut self.requests[block];
        let Some(at) = records.iter().position(|r| r.peer == peer) else {
            return;
        };
        records.swap_remove(at);
        if records.is_empty() && !self.received[block] {
            self.unrequested_count += 1;
        }
        if self.exclusive == Some(peer) {
            self.exclusive = None;
        }
    }

    /// Drops every request a departing peer held, returning how many blocks
    /// went back to the unrequested set. Ownership is released even when the
    /// peer had no outstanding request left.
    pub fn clear_requests_for_peer(&mut self, peer: PeerKey) -> usize {
        let mut freed = 0;
        for block in 0..self.requests.len() {
            let records = &mut self.requests[block];
            let before = records.len();
            records.retain(|r| r.peer != peer);
            if before != records.len() {
                freed += 1;
                if records.is_empty() && !self.received[block] {
                    self.unrequested_count += 1;
                }
            }
        }
        if self.exclusive == Some(peer) {
            self.exclusive = None;
        }
        freed
    }

    /// Removes every request older than `timeout_ms` and returns the
    /// `(block, peer)` pairs so the caller can emit CANCELs and count
    /// strikes. Ownership follows the single-cancel rule.
    pub fn take_stale_requests(&mut self, timeout_ms: u64, now_ms: u64) -> Vec<(usize, PeerKey)> {
        let mut stale = Vec::new();
        for block in 0..self.requests.len() {
            let records = &mut self.requests[block];
            let before = records.len();
            records.retain(|r| {
                if now_ms.saturating_sub(r.requested_at) >= timeout_ms {
                    stale.push((block, r.peer));
                    false
                } else {
                    true
                }
            });
            if before != records.len() && records.is_empty() && !self.received[block] {
                self.unrequested_count += 1;
            }
        }
        for (_, peer) in &stale {
            if self.exclusive == Some(*peer) {
                self.exclusive = None;
            }
        }
        stale
    }

    /// Blocks that nobody has requested yet, in ascending order.
    pub fn needed_blocks(&self, max: usize) -> Vec<BlockPosition> {
        let mut out = Vec::new();
        for block in 0..self.block_count() {
            if out.len() == max {
                break;
            }
            if !self.received[block] && self.requests[block].is_empty() {
                out.push(self.block_position(block));
            }
        }
        out
    }

    /// Endgame traversal: a block already requested from *someone else* is
    /// still offered, so the fastest responder wins. `duplicate_cap` bounds
    /// the concurrent requests per block (0 means unlimited).
    pub fn needed_blocks_endgame(
        &self,
        peer: PeerKey,
        max: usize,
        duplicate_cap: usize,
    ) -> Vec<BlockPosition> {
        let mut out = Vec::new();
        for block in 0..self.block_count() {
            if out.len() == max {
                break;
            }
            if self.received[block] {
                continue;
            }
            let records = &self.requests[block];
            if records.iter().any(|r| r.peer == peer) {
                continue;
            }
            if duplicate_cap != 0 && records.len() >= duplicate_cap {
                continue;
            }
            out.push(self.block_position(block));
        }
        out
    }

    /// Peers holding a pending request for the block, minus `exclude`.
    /// These are the CANCEL targets once the block arrives elsewhere.
    pub fn other_requesters(&self, block: usize, exclude: PeerKey) -> Vec<PeerKey> {
        self.requests[block]
            .iter()
            .filter(|r| r.peer != exclude)
            .map(|r| r.peer)
            .collect()
    }

    /// Speed affinity gate: a fast owner shuts slow peers out of the piece,
    /// while other fast peers may still co-download it.
    pub fn can_request_from(&self, peer: PeerKey, peer_is_fast: bool) -> bool {
        match self.exclusive {
            None => true,
            Some(owner) => owner == peer || peer_is_fast,
        }
    }

    pub fn exclusive(&self) -> Option<PeerKey> {
        self.exclusive
    }

    pub fn set_exclusive(&mut self, peer: PeerKey) {
        self.exclusive = Some(peer);
    }

    pub fn clear_exclusive(&mut self) {
        self.exclusive = None;
    }

    pub fn has_all_blocks(&self) -> bool {
        self.received_count == self.block_count()
    }

    pub fn has_unrequested_blocks(&self) -> bool {
        self.unrequested_count > 0
    }

    pub fn received_count(&self) -> usize {
        self.received_count
    }

    pub fn progress(&self) -> f64 {
        self.received_count as f64 / self.block_count() as f64
    }

    pub fn activated_at(&self) -> u64 {
        self.activated_at
    }

    pub fn last_activity(&self) -> u64 {
        self.last_activity
    }

    /// A piece is stuck when it has been quiet past the deadline while under
    /// the progress bar that would justify keeping its partial data.
    pub fn should_abandon(&self, stall_timeout_ms: u64, min_progress: f64, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.last_activity) >= stall_timeout_ms
            && self.progress() < min_progress
    }

    /// Peers credited with at least one accepted block. Consulted for blame
    /// when the digest does not match.
    pub fn contributing_peers(&self) -> HashSet<PeerKey> {
        self.senders.iter().flatten().copied().collect()
    }

    /// Hands the filled buffer out without copying. Calling this with blocks
    /// still missing is a bug in the caller.
    pub fn assemble(self) -> BytesMut {
        assert!(
            self.has_all_blocks(),
            "assembling piece {} with {}/{} blocks",
            self.index,
            self.received_count,
            self.block_count(),
        );
        self.buffer
    }

    /// Releases the buffer of an abandoned piece for reuse.
    pub fn into_buffer(self) -> BytesMut {
        self.buffer
    }

    #[cfg(test)]
    fn assert_counters(&self) {
        let received = self.received.iter().filter(|r| **r).count();
        assert_eq!(self.received_count, received);
        let unrequested = (0..self.block_count())
            .filter(|b| !self.received[*b] && self.requests[*b].is_empty())
            .count();
        assert_eq!(self.unrequested_count, unrequested);
        for block in 0..self.block_count() {
            if self.received[block] {
                assert!(self.requests[block].is_empty());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;

    use super::ActivePiece;
    use crate::download::PeerKey;
    use crate::BLOCK_LENGTH;

    const A: PeerKey = PeerKey(1);
    const B: PeerKey = PeerKey(2);
    const C: PeerKey = PeerKey(3);

    fn piece(length: u32) -> ActivePiece {
        ActivePiece::new(0, length, BytesMut::zeroed(length as usize), 0)
    }

    fn four_blocks() -> ActivePiece {
        piece(4 * BLOCK_LENGTH)
    }

    #[test]
    fn request_then_cancel_is_idempotent() {
        let mut p = four_blocks();
        assert!(p.has_unrequested_blocks());
        p.add_request(0, A, 10);
        p.assert_counters();
        p.cancel_request(0, A);
        p.assert_counters();
        assert_eq!(p.needed_blocks(16).len(), 4);
    }

    #[test]
    fn same_peer_request_collapses() {
        let mut p = four_blocks();
        p.add_request(0, A, 10);
        p.add_request(0, A, 500);
        p.assert_counters();
        // the original timestamp stands, so the request goes stale at 10+30s
        let stale = p.take_stale_requests(30_000, 30_010);
        assert_eq!(stale, vec![(0, A)]);
        p.assert_counters();
    }

    #[test]
    fn block_acceptance_clears_requests_once() {
        let mut p = four_blocks();
        p.add_request(1, A, 0);
        p.add_request(1, B, 0);
        let data = vec![7u8; BLOCK_LENGTH as usize];
        assert!(p.add_block(1, &data, B, 50));
        p.assert_counters();
        assert!(p.is_received(1));
        assert_eq!(p.contributing_peers().len(), 1);
        // duplicate delivery from the slower peer
        assert!(!p.add_block(1, &data, A, 60));
        p.assert_counters();
        assert_eq!(p.received_count(), 1);
    }

    #[test]
    fn unsolicited_block_is_accepted_when_useful() {
        let mut p = four_blocks();
        let data = vec![1u8; BLOCK_LENGTH as usize];
        assert!(p.add_block(2, &data, C, 5));
        p.assert_counters();
        assert!(!p.needed_blocks(16).iter().any(|b| b.offset == 2 * BLOCK_LENGTH));
    }

    #[test]
    fn disconnect_returns_blocks_to_unrequested() {
        let mut p = four_blocks();
        p.add_request(0, A, 0);
        p.add_request(1, A, 0);
        p.add_request(2, B, 0);
        assert_eq!(p.needed_blocks(16).len(), 1);
        assert_eq!(p.clear_requests_for_peer(A), 2);
        p.assert_counters();
        assert_eq!(p.needed_blocks(16).len(), 3);
    }

    #[test]
    fn selective_timeout_spares_fresh_requests() {
        let mut p = four_blocks();
        p.add_request(0, A, 0);
        p.add_request(1, B, 25_000);
        let stale = p.take_stale_requests(30_000, 31_000);
        assert_eq!(stale, vec![(0, A)]);
        p.assert_counters();
        assert!(p.needed_blocks(16).iter().any(|b| b.offset == 0));
        assert!(!p.needed_blocks(16).iter().any(|b| b.offset == BLOCK_LENGTH));
    }

    #[test]
    fn endgame_offers_foreign_requests_up_to_cap() {
        let mut p = four_blocks();
        let data = vec![0u8; BLOCK_LENGTH as usize];
        for block in 0..3 {
            p.add_block(block, &data, A, 1);
        }
        p.add_request(3, A, 2);
        assert!(p.needed_blocks(16).is_empty());
        // B may double-request the final block
        assert_eq!(p.needed_blocks_endgame(B, 16, 3).len(), 1);
        // but A may not re-request its own
        assert!(p.needed_blocks_endgame(A, 16, 3).is_empty());
        p.add_request(3, B, 2);
        p.add_request(3, C, 2);
        // cap of 3 concurrent requests reached
        assert!(p.needed_blocks_endgame(PeerKey(9), 16, 3).is_empty());
        assert_eq!(p.needed_blocks_endgame(PeerKey(9), 16, 0).len(), 1);
        p.assert_counters();
    }

    #[test]
    fn duplicate_winner_cancels_the_rest() {
        let mut p = four_blocks();
        p.add_request(3, A, 0);
        p.add_request(3, B, 1);
        let data = vec![9u8; BLOCK_LENGTH as usize];
        assert!(p.add_block(3, &data, B, 10));
        assert_eq!(p.other_requesters(3, B), vec![]);
        // requesters are captured before acceptance in the real flow
        let mut p = four_blocks();
        p.add_request(3, A, 0);
        p.add_request(3, B, 1);
        assert_eq!(p.other_requesters(3, B), vec![A]);
    }

    #[test]
    fn speed_affinity_gate() {
        let mut p = four_blocks();
        assert!(p.can_request_from(A, false));
        p.set_exclusive(A);
        assert!(p.can_request_from(A, true));
        assert!(!p.can_request_from(B, false));
        assert!(p.can_request_from(C, true));
        p.clear_requests_for_peer(A);
        assert_eq!(p.exclusive(), None);
        assert!(p.can_request_from(B, false));
    }

    #[test]
    fn owner_timeout_releases_ownership() {
        let mut p = four_blocks();
        p.set_exclusive(A);
        p.add_request(0, A, 0);
        p.take_stale_requests(30_000, 40_000);
        assert_eq!(p.exclusive(), None);
    }

    #[test]
    fn short_last_block() {
        let length = 2 * BLOCK_LENGTH + 100;
        let mut p = piece(length);
        assert_eq!(p.block_count(), 3);
        let needed = p.needed_blocks(16);
        assert_eq!(needed[2].length, 100);
        assert_eq!(needed[2].offset, 2 * BLOCK_LENGTH);
        assert!(p.block_at(2 * BLOCK_LENGTH).is_some());
        assert!(p.block_at(2 * BLOCK_LENGTH + 100).is_none());
        assert!(p.block_at(5).is_none());
        p.add_block(0, &vec![1; BLOCK_LENGTH as usize], A, 0);
        p.add_block(1, &vec![2; BLOCK_LENGTH as usize], A, 0);
        p.add_block(2, &vec![3; 100], B, 0);
        assert!(p.has_all_blocks());
        let buffer = p.assemble();
        assert_eq!(buffer.len(), length as usize);
        assert_eq!(buffer[buffer.len() - 1], 3);
    }

    #[test]
    fn tiny_piece_has_one_block() {
        let p = piece(512);
        assert_eq!(p.block_count(), 1);
        assert_eq!(p.needed_blocks(16), vec![p.block_position(0)]);
    }

    #[test]
    fn stall_detection_respects_progress() {
        let mut p = four_blocks();
        assert!(p.should_abandon(120_000, 0.5, 120_000));
        let data = vec![0u8; BLOCK_LENGTH as usize];
        p.add_block(0, &data, A, 100_000);
        p.add_block(1, &data, A, 100_000);
        // at 50% progress the piece is kept
        assert!(!p.should_abandon(120_000, 0.5, 500_000));
        assert!(!p.should_abandon(120_000, 0.9, 100_001));
    }
}
