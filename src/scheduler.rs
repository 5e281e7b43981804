//! Decides which pieces to activate and which blocks each peer requests.
//!
//! Selection never hands out a verified, blacklisted or unadvertised piece;
//! within that, the rarest piece wins. A fast peer activating a piece
//! claims it, which keeps slow peers from fragmenting the pieces it is
//! about to finish. Endgame flips the block traversal into duplicate mode
//! once the only work left is already in flight somewhere.

use std::collections::HashSet;

use anyhow::bail;

use crate::bitfield::BitField;
use crate::download::peer::ActivePeer;
use crate::download::piece_store::PieceStore;
use crate::download::Block;
use crate::info::TorrentInfo;
use crate::piece_picker::{PieceClass, PiecePicker, Priority};
use crate::Config;

#[derive(Debug)]
pub struct Scheduler {
    info: TorrentInfo,
    /// Verified pieces.
    pub bitfield: BitField,
    picker: PiecePicker,
    file_priorities: Vec<Priority>,
    /// Pieces detached from the store while a digest worker owns them.
    verifying: HashSet<u32>,
    endgame: bool,
}

impl Scheduler {
    pub fn new(info: &TorrentInfo, file_priorities: Vec<Priority>, bitfield: BitField) -> Self {
        debug_assert_eq!(bitfield.len(), info.piece_count());
        let picker = PiecePicker::new(info, &file_priorities);
        Self {
            info: info.clone(),
            bitfield,
            picker,
            file_priorities,
            verifying: HashSet::new(),
            endgame: false,
        }
    }

    pub fn is_endgame(&self) -> bool {
        self.endgame
    }

    /// Everything wanted is verified; boundary pieces count, blacklisted
    /// pieces do not.
    pub fn is_complete(&self) -> bool {
        self.bitfield
            .missing_pieces()
            .all(|p| self.picker.class(p) == PieceClass::Blacklisted)
    }

    pub fn downloaded_percent(&self) -> f32 {
        if self.bitfield.len() == 0 {
            return 100.0;
        }
        self.bitfield.count() as f32 / self.bitfield.len() as f32 * 100.0
    }

    /// Fills the peer's free pipeline slots. Requests are recorded on the
    /// pieces here; the caller only transmits them.
    pub fn schedule_for_peer(
        &mut self,
        peer: &mut ActivePeer,
        store: &mut PieceStore,
        cfg: &Config,
        now_ms: u64,
    ) -> Vec<Block> {
        let mut out = Vec::new();
        let mut slots = peer.free_pipeline_slots(cfg.pipeline_depth);

        // already-active pieces first, index order
        for index in store.indexes() {
            if slots == 0 {
                break;
            }
            if !peer.bitfield.has(index as usize) {
                continue;
            }
            let piece = store.get_mut(index).expect("index just listed");
            if piece.has_all_blocks() || !piece.can_request_from(peer.key, peer.fast) {
                continue;
            }
            let positions = if self.endgame {
                piece.needed_blocks_endgame(peer.key, slots, cfg.endgame_duplicate_cap)
            } else {
                piece.needed_blocks(slots)
            };
            for position in positions {
                let block = Block::from_position(index, position);
                piece.add_request(
                    piece.block_at(position.offset).expect("aligned offset"),
                    peer.key,
                    now_ms,
                );
                out.push(block);
                slots -= 1;
            }
        }

        // then activate fresh pieces while the cap allows
        while slots > 0 && !store.is_at_cap() {
            let Some(index) = self.picker.next_for_peer(&self.bitfield, &peer.bitfield, |p| {
                store.contains(p) || self.verifying.contains(&p)
            }) else {
                break;
            };
            let length = self.info.piece_size(index as usize);
            let piece = store.activate(index, length, now_ms);
            if peer.fast {
                piece.set_exclusive(peer.key);
            }
            tracing::debug!(
                piece = index,
                availability = self.picker.availability(index as usize),
                exclusive = peer.fast,
                "Activated piece"
            );
            for position in piece.needed_blocks(slots) {
                let block = Block::from_position(index, position);
                piece.add_request(
                    piece.block_at(position.offset).expect("aligned offset"),
                    peer.key,
                    now_ms,
                );
                out.push(block);
                slots -= 1;
            }
        }

        out
    }

    /// Recomputes the endgame flag: on when every still-missing piece is
    /// already in flight and none of them has unrequested work left.
    /// Returns the new state on an edge so the core can emit the event.
    pub fn update_endgame(&mut self, store: &PieceStore) -> Option<bool> {
        let all_missing_in_flight = self.bitfield.missing_pieces().all(|p| {
            self.picker.class(p) == PieceClass::Blacklisted
                || self.verifying.contains(&(p as u32))
                || store.contains(p as u32)
        });
        let no_unrequested = store.iter().all(|p| !p.has_unrequested_blocks());
        let next = all_missing_in_flight && no_unrequested && !self.is_complete();
        if next == self.endgame {
            return None;
        }
        self.endgame = next;
        if next {
            tracing::info!("Entering endgame");
        } else {
            tracing::info!("Leaving endgame");
        }
        Some(next)
    }

    /// The piece left the store for a digest worker.
    pub fn begin_verification(&mut self, piece: u32) {
        self.verifying.insert(piece);
    }

    /// Digest matched; the piece may never be selected again.
    pub fn mark_verified(&mut self, piece: u32) {
        self.verifying.remove(&piece);
        self.bitfield.set(piece as usize);
    }

    /// Digest mismatch; the piece becomes eligible for re-activation.
    pub fn verification_failed(&mut self, piece: u32) {
        self.verifying.remove(&piece);
    }

    pub fn peer_joined(&mut self, bitfield: &BitField) {
        self.picker.peer_joined(bitfield);
    }

    pub fn peer_left(&mut self, bitfield: &BitField) {
        self.picker.peer_left(bitfield);
    }

    pub fn peer_has_piece(&mut self, piece: usize) {
        self.picker.peer_has_piece(piece);
    }

    pub fn peer_is_useful(&self, peer_bitfield: &BitField) -> bool {
        self.picker.peer_is_useful(&self.bitfield, peer_bitfield)
    }

    pub fn piece_size(&self, piece: u32) -> u32 {
        self.info.piece_size(piece as usize)
    }

    /// `(offset, length)` to persist for a verified piece. `None` means the
    /// piece serves no wanted file and skips persistence entirely.
    pub fn persist_extent(&self, piece: u32) -> Option<(u32, u32)> {
        self.picker
            .wanted_extent(&self.info, &self.file_priorities, piece as usize)
    }

    /// Applies a priority change and returns the active pieces that became
    /// pointless (blacklisted with zero progress); the caller abandons
    /// them. Active blacklisted pieces with progress are left to finish.
    pub fn set_file_priority(
        &mut self,
        file: usize,
        priority: Priority,
        store: &PieceStore,
    ) -> anyhow::Result<Vec<u32>> {
        if file >= self.file_priorities.len() {
            bail!("file {file} does not exist");
        }
        if self.file_priorities[file] == priority {
            return Ok(Vec::new());
        }
        if priority.is_skip() && self.is_file_complete(file) {
            bail!("file {file} is already complete and cannot be skipped");
        }
        self.file_priorities[file] = priority;
        self.picker.reclassify(&self.info, &self.file_priorities);
        let mut abandoned = Vec::new();
        for index in store.indexes() {
            if self.picker.class(index as usize) != PieceClass::Blacklisted {
                continue;
            }
            let piece = store.get(index).expect("index just listed");
            if piece.received_count() == 0 {
                abandoned.push(index);
            }
        }
        Ok(abandoned)
    }

    fn is_file_complete(&self, file: usize) -> bool {
        let span = &self.info.files[file];
        if span.length == 0 {
            return true;
        }
        (span.start_piece(self.info.piece_length)..=span.end_piece(self.info.piece_length))
            .all(|p| self.bitfield.has(p))
    }
}
