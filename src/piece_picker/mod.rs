//! Piece selection inputs: per-piece classification derived from file
//! priorities, and swarm-wide availability counts. The actual pick lives in
//! [`rare_first`].

use crate::bitfield::BitField;
use crate::info::TorrentInfo;

pub mod rare_first;

/// Per-file download priority. `Skip` excludes a file's bytes from
/// selection entirely; the remaining levels order piece picking before
/// rarity is considered.
#[derive(Debug, Clone, Copy, Default, Eq, Ord, PartialEq, PartialOrd)]
pub enum Priority {
    Skip,
    Low,
    #[default]
    Normal,
    High,
}

impl Priority {
    pub fn is_skip(&self) -> bool {
        matches!(self, Priority::Skip)
    }
}

/// How a piece relates to the wanted file set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PieceClass {
    /// Every overlapping file is wanted.
    Wanted,
    /// Overlaps wanted and skipped files; downloaded in full, persisted
    /// only across its wanted extent.
    Boundary,
    /// Every overlapping file is skipped; never selected.
    Blacklisted,
}

#[derive(Debug)]
pub struct PiecePicker {
    classes: Vec<PieceClass>,
    piece_priority: Vec<Priority>,
    availability: Vec<u32>,
}

impl PiecePicker {
    pub fn new(info: &TorrentInfo, file_priorities: &[Priority]) -> Self {
        let mut this = Self {
            classes: Vec::new(),
            piece_priority: Vec::new(),
            availability: vec![0; info.piece_count()],
        };
        this.reclassify(info, file_priorities);
        this
    }

    /// Recomputes every piece's class after a priority change. A torrent
    /// without file metadata is treated as one wanted file.
    pub fn reclassify(&mut self, info: &TorrentInfo, file_priorities: &[Priority]) {
        debug_assert_eq!(info.files.len(), file_priorities.len());
        let piece_count = info.piece_count();
        self.classes = vec![PieceClass::Wanted; piece_count];
        self.piece_priority = vec![Priority::default(); piece_count];
        if info.files.is_empty() {
            return;
        }
        for piece in 0..piece_count {
            let span = info.piece_span(piece);
            let mut wanted: Option<Priority> = None;
            let mut skipped = false;
            for (file, file_priority) in info.files.iter().zip(file_priorities) {
                if file.offset >= span.end || file.end() <= span.start {
                    continue;
                }
                if file_priority.is_skip() {
                    skipped = true;
                } else {
                    wanted = Some(wanted.map_or(*file_priority, |w| w.max(*file_priority)));
                }
            }
            self.classes[piece] = match (wanted, skipped) {
                (Some(_), false) => PieceClass::Wanted,
                (Some(_), true) => PieceClass::Boundary,
                (None, _) => PieceClass::Blacklisted,
            };
            self.piece_priority[piece] = wanted.unwrap_or_default();
        }
    }

    pub fn class(&self, piece: usize) -> PieceClass {
        self.classes[piece]
    }

    pub fn priority(&self, piece: usize) -> Priority {
        self.piece_priority[piece]
    }

    pub fn availability(&self, piece: usize) -> u32 {
        self.availability[piece]
    }

    /// The byte range of the piece that must reach persistence, relative to
    /// the piece start. `None` when nothing in it is wanted.
    pub fn wanted_extent(
        &self,
        info: &TorrentInfo,
        file_priorities: &[Priority],
        piece: usize,
    ) -> Option<(u32, u32)> {
        match self.classes[piece] {
            PieceClass::Wanted => Some((0, info.piece_size(piece))),
            PieceClass::Blacklisted => None,
            PieceClass::Boundary => {
                let span = info.piece_span(piece);
                let mut first = u64::MAX;
                let mut last = 0u64;
                for (file, file_priority) in info.files.iter().zip(file_priorities) {
                    if file_priority.is_skip()
                        || file.offset >= span.end
                        || file.end() <= span.start
                    {
                        continue;
                    }
                    first = first.min(file.offset.max(span.start));
                    last = last.max(file.end().min(span.end));
                }
                debug_assert!(first < last);
                Some(((first - span.start) as u32, (last - first) as u32))
            }
        }
    }

    pub fn peer_has_piece(&mut self, piece: usize) {
        if piece < self.availability.len() {
            self.availability[piece] += 1;
        }
    }

    pub fn peer_joined(&mut self, bitfield: &BitField) {
        for piece in bitfield.set_pieces() {
            self.peer_has_piece(piece);
        }
    }

    pub fn peer_left(&mut self, bitfield: &BitField) {
        for piece in bitfield.set_pieces() {
            if piece < self.availability.len() {
                self.availability[piece] = self.availability[piece].saturating_sub(1);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{PieceClass, PiecePicker, Priority};
    use crate::bitfield::BitField;
    use crate::info::{FileSpan, TorrentInfo};

    fn two_file_info() -> TorrentInfo {
        // 4 pieces of 1024; file A covers [0, 1500), file B covers [1500, 4096)
        TorrentInfo::new(
            [0; 20],
            "t",
            1024,
            4096,
            vec![[0; 20]; 4],
            vec![
                FileSpan {
                    path: "a".into(),
                    offset: 0,
                    length: 1500,
                },
                FileSpan {
                    path: "b".into(),
                    offset: 1500,
                    length: 2596,
                },
            ],
        )
        .unwrap()
    }

    #[test]
    fn classification_with_skipped_file() {
        let info = two_file_info();
        let priorities = [Priority::Normal, Priority::Skip];
        let picker = PiecePicker::new(&info, &priorities);
        assert_eq!(picker.class(0), PieceClass::Wanted);
        // piece 1 spans the end of file A and the start of file B
        assert_eq!(picker.class(1), PieceClass::Boundary);
        assert_eq!(picker.class(2), PieceClass::Blacklisted);
        assert_eq!(picker.class(3), PieceClass::Blacklisted);
    }

    #[test]
    fn boundary_extent_covers_only_wanted_bytes() {
        let info = two_file_info();
        let priorities = [Priority::Normal, Priority::Skip];
        let picker = PiecePicker::new(&info, &priorities);
        assert_eq!(
            picker.wanted_extent(&info, &priorities, 0),
            Some((0, 1024))
        );
        // file A's tail inside piece 1: bytes [1024, 1500)
        assert_eq!(
            picker.wanted_extent(&info, &priorities, 1),
            Some((0, 476))
        );
        assert_eq!(picker.wanted_extent(&info, &priorities, 2), None);
    }

    #[test]
    fn extent_when_skipped_file_leads() {
        let info = two_file_info();
        let priorities = [Priority::Skip, Priority::Normal];
        let picker = PiecePicker::new(&info, &priorities);
        assert_eq!(picker.class(1), PieceClass::Boundary);
        // file B starts at byte 1500, i.e. offset 476 into piece 1
        assert_eq!(
            picker.wanted_extent(&info, &priorities, 1),
            Some((476, 548))
        );
    }

    #[test]
    fn priority_takes_the_max_of_overlapping_files() {
        let info = two_file_info();
        let priorities = [Priority::Low, Priority::High];
        let picker = PiecePicker::new(&info, &priorities);
        assert_eq!(picker.priority(0), Priority::Low);
        assert_eq!(picker.priority(1), Priority::High);
    }

    #[test]
    fn availability_bookkeeping() {
        let info = two_file_info();
        let mut picker = PiecePicker::new(&info, &[Priority::Normal, Priority::Normal]);
        let mut bf = BitField::new(4);
        bf.set(0);
        bf.set(2);
        picker.peer_joined(&bf);
        picker.peer_has_piece(2);
        assert_eq!(picker.availability(0), 1);
        assert_eq!(picker.availability(2), 2);
        picker.peer_left(&bf);
        assert_eq!(picker.availability(0), 0);
        assert_eq!(picker.availability(2), 1);
    }
}
