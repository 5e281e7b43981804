//! Rarest-first piece selection.
//!
//! Among the pieces a peer can contribute to, the one fewest peers
//! advertise wins; higher file priority trumps rarity and the piece index
//! breaks remaining ties so the pick is deterministic.

use std::cmp::Reverse;

use crate::bitfield::BitField;

use super::{PieceClass, PiecePicker, Priority};

impl PiecePicker {
    /// Picks the next piece to activate for a peer. `is_active` filters
    /// pieces that already have a buffer; the cap on those is enforced by
    /// the caller.
    pub fn next_for_peer(
        &self,
        verified: &BitField,
        peer_bitfield: &BitField,
        mut is_active: impl FnMut(u32) -> bool,
    ) -> Option<u32> {
        let mut best: Option<(Reverse<Priority>, u32, u32)> = None;
        for piece in verified.missing_pieces() {
            if self.class(piece) == PieceClass::Blacklisted
                || !peer_bitfield.has(piece)
                || is_active(piece as u32)
            {
                continue;
            }
            let key = (
                Reverse(self.priority(piece)),
                self.availability(piece),
                piece as u32,
            );
            if best.map_or(true, |b| key < b) {
                best = Some(key);
            }
        }
        best.map(|(_, _, piece)| piece)
    }

    /// Whether the peer advertises anything we still want, i.e. whether we
    /// should be interested in it.
    pub fn peer_is_useful(&self, verified: &BitField, peer_bitfield: &BitField) -> bool {
        verified.missing_pieces().any(|piece| {
            self.class(piece) != PieceClass::Blacklisted && peer_bitfield.has(piece)
        })
    }
}
