//! The piece picker decides which piece to download next from which peer.
//!
//! It tracks piece availability across the swarm (from bitfields and HAVE
//! messages), which pieces we own, which are pending in an active download,
//! and the per-file selection state, and ranks the remaining candidates
//! according to the configured selection policy.

use std::cmp::Reverse;
use std::ops::Range;

use rand::Rng;

use crate::{
    conf::{PieceSelection, StrategyConf},
    error::*,
    storage_info::{FilePriority, FileSelection, StorageInfo},
    Bitfield, FileIndex, PieceIndex,
};

/// Availability and scheduling state of a single piece.
#[derive(Clone, Debug, Default)]
struct Piece {
    /// The number of connected peers that have this piece.
    frequency: usize,
    /// Whether an active download of this piece exists. Pending pieces are
    /// not picked again outside endgame; the shared download is continued
    /// instead.
    is_pending: bool,
}

pub(crate) struct PiecePicker {
    /// The pieces we have verified on disk.
    own_pieces: Bitfield,
    /// Swarm availability and pending state per piece.
    pieces: Vec<Piece>,
    /// The files each piece overlaps, precomputed from the storage layout.
    piece_files: Vec<Range<FileIndex>>,
    /// Per-file download priorities.
    selection: FileSelection,
    /// Derived from `selection`: whether a piece overlaps any selected file.
    wanted: Vec<bool>,
    /// Derived from `selection`: the strongest priority among the files a
    /// piece overlaps.
    priorities: Vec<FilePriority>,
    policy: PieceSelection,
    endgame_threshold: f64,
    first_last_bias: bool,
    /// Set once the fraction of missing wanted pieces drops to the
    /// threshold; re-evaluated on every verified piece.
    in_endgame: bool,
}

impl PiecePicker {
    pub fn new(
        own_pieces: Bitfield,
        storage: &StorageInfo,
        selection: FileSelection,
        strategy: &StrategyConf,
    ) -> Result<Self> {
        debug_assert_eq!(own_pieces.len(), storage.piece_count);
        let piece_files = (0..storage.piece_count)
            .map(|index| storage.files_intersecting_piece(index))
            .collect::<Result<Vec<_>>>()?;
        let mut picker = Self {
            own_pieces,
            pieces: vec![Piece::default(); storage.piece_count],
            piece_files,
            selection,
            wanted: Vec::new(),
            priorities: Vec::new(),
            policy: strategy.piece_selection,
            endgame_threshold: strategy.endgame_threshold,
            first_last_bias: strategy.first_last_piece_bias,
            in_endgame: false,
        };
        picker.derive_selection_state();
        picker.evaluate_endgame();
        Ok(picker)
    }

    pub fn own_pieces(&self) -> &Bitfield {
        &self.own_pieces
    }

    pub fn piece_count(&self) -> usize {
        self.pieces.len()
    }

    pub fn in_endgame(&self) -> bool {
        self.in_endgame
    }

    pub fn is_wanted(&self, index: PieceIndex) -> bool {
        self.wanted[index]
    }

    /// Returns the number of wanted pieces not yet verified.
    pub fn count_missing(&self) -> usize {
        (0..self.pieces.len())
            .filter(|&index| self.wanted[index] && !self.own_pieces[index])
            .count()
    }

    /// Returns true once every wanted piece is verified on disk, i.e. the
    /// download is complete under the current file selection.
    pub fn is_complete(&self) -> bool {
        self.count_missing() == 0
    }

    /// Registers a peer's piece availability, as learned from its bitfield.
    /// Returns whether the peer has any wanted piece we are missing, i.e.
    /// whether we are interested in the peer.
    pub fn register_availability(&mut self, pieces: &Bitfield) -> Result<bool> {
        if pieces.len() != self.pieces.len() {
            return Err(Error::InvalidPieceIndex);
        }
        let mut interested = false;
        for (index, has_piece) in pieces.iter().enumerate() {
            if *has_piece {
                self.pieces[index].frequency += 1;
                if self.wanted[index] && !self.own_pieces[index] {
                    interested = true;
                }
            }
        }
        Ok(interested)
    }

    /// Removes a disconnecting peer's availability.
    pub fn unregister_availability(&mut self, pieces: &Bitfield) {
        for (index, has_piece) in pieces.iter().enumerate() {
            if *has_piece && index < self.pieces.len() {
                debug_assert!(self.pieces[index].frequency > 0);
                self.pieces[index].frequency =
                    self.pieces[index].frequency.saturating_sub(1);
            }
        }
    }

    /// Registers that a peer announced a single new piece (a HAVE message).
    /// Returns whether this makes us interested in the peer.
    pub fn register_piece_availability(
        &mut self,
        index: PieceIndex,
    ) -> Result<bool> {
        let piece = self
            .pieces
            .get_mut(index)
            .ok_or(Error::InvalidPieceIndex)?;
        piece.frequency += 1;
        Ok(self.wanted[index] && !self.own_pieces[index])
    }

    /// Picks the next piece to download from a peer with the given pieces,
    /// marking it pending. Returns `None` if the peer has nothing we can
    /// start.
    pub fn pick_piece(&mut self, peer_pieces: &Bitfield) -> Option<PieceIndex> {
        let candidates = (0..self.pieces.len()).filter(|&index| {
            self.wanted[index]
                && !self.own_pieces[index]
                && !self.pieces[index].is_pending
                && peer_pieces.get(index).map(|bit| *bit).unwrap_or(false)
        });

        let picked = match self.policy {
            PieceSelection::RarestFirst => candidates.min_by_key(|&index| {
                (
                    Reverse(self.priorities[index]),
                    self.pieces[index].frequency,
                    index,
                )
            }),
            PieceSelection::Sequential => candidates.min_by_key(|&index| {
                (Reverse(self.priorities[index]), self.sequential_rank(index))
            }),
            PieceSelection::RoundRobin => {
                // reservoir sample one candidate from the strongest
                // priority class present
                let mut rng = rand::thread_rng();
                let mut best: Option<(FilePriority, PieceIndex, usize)> = None;
                for index in candidates {
                    let priority = self.priorities[index];
                    best = match best {
                        None => Some((priority, index, 1)),
                        Some((top, _, _)) if priority > top => {
                            Some((priority, index, 1))
                        }
                        Some((top, picked, seen)) if priority == top => {
                            let seen = seen + 1;
                            if rng.gen_range(0..seen) == 0 {
                                Some((top, index, seen))
                            } else {
                                Some((top, picked, seen))
                            }
                        }
                        keep => keep,
                    };
                }
                best.map(|(_, index, _)| index)
            }
        };

        if let Some(index) = picked {
            self.pieces[index].is_pending = true;
        }
        picked
    }

    /// Under the sequential policy the rank is simply the index, except that
    /// the streaming bias pulls the first and last pieces to the front so
    /// media players can probe container headers and footers.
    fn sequential_rank(&self, index: PieceIndex) -> usize {
        if self.first_last_piece_biased() {
            let last = self.pieces.len() - 1;
            if index == 0 {
                0
            } else if index == last {
                1
            } else {
                index + 2
            }
        } else {
            index
        }
    }

    fn first_last_piece_biased(&self) -> bool {
        self.first_last_bias && self.pieces.len() > 1
    }

    /// Registers that the piece has been downloaded and verified. This is
    /// the only place the local bitfield is set.
    pub fn received_piece(&mut self, index: PieceIndex) {
        debug_assert!(!self.own_pieces[index]);
        self.own_pieces.set(index, true);
        self.pieces[index].is_pending = false;
        self.evaluate_endgame();
    }

    /// Clears the pending mark of a piece so it can be picked again, after
    /// a failed hash check or an abandoned download.
    pub fn unmark_pending(&mut self, index: PieceIndex) {
        self.pieces[index].is_pending = false;
    }

    /// Replaces the file selection, rederiving which pieces are wanted.
    /// Returns the pieces that are pending but no longer wanted; the caller
    /// drops their in-flight requests.
    pub fn apply_selection(
        &mut self,
        selection: FileSelection,
    ) -> Vec<PieceIndex> {
        self.selection = selection;
        self.derive_selection_state();
        let dropped: Vec<PieceIndex> = (0..self.pieces.len())
            .filter(|&index| {
                !self.wanted[index] && self.pieces[index].is_pending
            })
            .collect();
        for &index in &dropped {
            self.pieces[index].is_pending = false;
        }
        self.evaluate_endgame();
        dropped
    }

    pub fn selection(&self) -> &FileSelection {
        &self.selection
    }

    fn derive_selection_state(&mut self) {
        self.wanted = self
            .piece_files
            .iter()
            .map(|files| self.selection.is_any_selected(files.clone()))
            .collect();
        self.priorities = self
            .piece_files
            .iter()
            .map(|files| self.selection.max_priority(files.clone()))
            .collect();
    }

    fn evaluate_endgame(&mut self) {
        let wanted_total =
            self.wanted.iter().filter(|wanted| **wanted).count();
        let missing = self.count_missing();
        self.in_endgame = missing > 0
            && wanted_total > 0
            && (missing as f64 / wanted_total as f64)
                <= self.endgame_threshold;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage_info::{FileInfo, FsStructure};
    use pretty_assertions::assert_eq;
    use std::path::PathBuf;

    fn single_file_storage(piece_count: usize, piece_len: u32) -> StorageInfo {
        let download_len = piece_count as u64 * piece_len as u64;
        StorageInfo {
            piece_count,
            piece_len,
            last_piece_len: piece_len,
            download_len,
            download_dir: PathBuf::from("/"),
            structure: FsStructure::File(FileInfo {
                path: PathBuf::from("file"),
                len: download_len,
                torrent_offset: 0,
                executable: false,
            }),
        }
    }

    // Three files of two pieces each, for file selection tests: deselecting
    // the middle file must leave its interior pieces unwanted while the
    // straddling pieces stay wanted.
    fn three_file_storage() -> StorageInfo {
        // piece length 4, file length 6: file 0 covers pieces 0-1, file
        // 1 covers pieces 1-2, file 2 covers pieces 3-4 (piece 2 straddles
        // nothing selected... see individual tests)
        let files = vec![
            FileInfo {
                path: PathBuf::from("0"),
                len: 8,
                torrent_offset: 0,
                executable: false,
            },
            FileInfo {
                path: PathBuf::from("1"),
                len: 8,
                torrent_offset: 8,
                executable: false,
            },
            FileInfo {
                path: PathBuf::from("2"),
                len: 8,
                torrent_offset: 16,
                executable: false,
            },
        ];
        StorageInfo {
            piece_count: 6,
            piece_len: 4,
            last_piece_len: 4,
            download_len: 24,
            download_dir: PathBuf::from("/"),
            structure: FsStructure::Archive { files },
        }
    }

    fn picker(storage: &StorageInfo, strategy: &StrategyConf) -> PiecePicker {
        let own = Bitfield::repeat(false, storage.piece_count);
        let selection = FileSelection::new(storage.files().len());
        PiecePicker::new(own, storage, selection, strategy).unwrap()
    }

    fn all_pieces(count: usize) -> Bitfield {
        Bitfield::repeat(true, count)
    }

    #[test]
    fn test_rarest_first_breaks_ties_by_index() {
        let storage = single_file_storage(4, 0x4000);
        let mut picker = picker(&storage, &StrategyConf::default());
        let peer = all_pieces(4);
        picker.register_availability(&peer).unwrap();

        // all pieces equally available: ties break by ascending index
        assert_eq!(picker.pick_piece(&peer), Some(0));
        assert_eq!(picker.pick_piece(&peer), Some(1));
        assert_eq!(picker.pick_piece(&peer), Some(2));
        assert_eq!(picker.pick_piece(&peer), Some(3));
        assert_eq!(picker.pick_piece(&peer), None);
    }

    #[test]
    fn test_rarest_first_prefers_rare_pieces() {
        let storage = single_file_storage(4, 0x4000);
        let mut picker = picker(&storage, &StrategyConf::default());

        // two peers have everything, a third only has piece 2, making the
        // others "more common"... invert: two peers have pieces {0,1,3},
        // one peer has everything, so piece 2 is the rarest
        let mut common = all_pieces(4);
        common.set(2, false);
        picker.register_availability(&common).unwrap();
        picker.register_availability(&common).unwrap();
        let seed = all_pieces(4);
        picker.register_availability(&seed).unwrap();

        assert_eq!(picker.pick_piece(&seed), Some(2));
        // the rest tie at frequency 3, so ascending index
        assert_eq!(picker.pick_piece(&seed), Some(0));
    }

    #[test]
    fn test_interest_tracking() {
        let storage = single_file_storage(2, 0x4000);
        let mut own = Bitfield::repeat(false, 2);
        own.set(0, true);
        let selection = FileSelection::new(1);
        let mut picker = PiecePicker::new(
            own,
            &storage,
            selection,
            &StrategyConf::default(),
        )
        .unwrap();

        // a peer with only the piece we already have is not interesting
        let mut peer = Bitfield::repeat(false, 2);
        peer.set(0, true);
        assert!(!picker.register_availability(&peer).unwrap());

        // a peer with the missing piece is
        let mut peer = Bitfield::repeat(false, 2);
        peer.set(1, true);
        assert!(picker.register_availability(&peer).unwrap());

        // a single HAVE triggers interest the same way
        assert!(picker.register_piece_availability(1).unwrap());
        assert!(!picker.register_piece_availability(0).unwrap());
    }

    #[test]
    fn test_sequential_policy_and_streaming_bias() {
        let storage = single_file_storage(5, 0x4000);
        let mut strategy = StrategyConf::default();
        strategy.piece_selection = PieceSelection::Sequential;
        let mut seq_picker = picker(&storage, &strategy);
        let peer = all_pieces(5);
        seq_picker.register_availability(&peer).unwrap();
        assert_eq!(seq_picker.pick_piece(&peer), Some(0));
        assert_eq!(seq_picker.pick_piece(&peer), Some(1));

        strategy.first_last_piece_bias = true;
        let mut biased_picker = picker(&storage, &strategy);
        biased_picker.register_availability(&peer).unwrap();
        assert_eq!(biased_picker.pick_piece(&peer), Some(0));
        assert_eq!(biased_picker.pick_piece(&peer), Some(4));
        assert_eq!(biased_picker.pick_piece(&peer), Some(1));
    }

    #[test]
    fn test_round_robin_picks_any_candidate() {
        let storage = single_file_storage(8, 0x4000);
        let mut strategy = StrategyConf::default();
        strategy.piece_selection = PieceSelection::RoundRobin;
        let mut picker = picker(&storage, &strategy);
        let peer = all_pieces(8);
        picker.register_availability(&peer).unwrap();

        let mut picked = std::collections::HashSet::new();
        for _ in 0..8 {
            picked.insert(picker.pick_piece(&peer).unwrap());
        }
        assert_eq!(picked.len(), 8);
        assert_eq!(picker.pick_piece(&peer), None);
    }

    #[test]
    fn test_file_selection_derives_wanted_pieces() {
        // 3 files of 8 bytes, piece length 4: pieces 0-1 in file 0, 2-3 in
        // file 1, 4-5 in file 2; no straddling pieces in this layout
        let storage = three_file_storage();
        let mut picker = picker(&storage, &StrategyConf::default());

        let mut selection = FileSelection::new(3);
        selection.set(1, FilePriority::DoNotDownload);
        let dropped = picker.apply_selection(selection);
        assert!(dropped.is_empty());

        assert!(picker.is_wanted(0));
        assert!(picker.is_wanted(1));
        assert!(!picker.is_wanted(2));
        assert!(!picker.is_wanted(3));
        assert!(picker.is_wanted(4));
        assert!(picker.is_wanted(5));

        // unwanted pieces are never picked
        let peer = all_pieces(6);
        picker.register_availability(&peer).unwrap();
        let mut picked = Vec::new();
        while let Some(index) = picker.pick_piece(&peer) {
            picked.push(index);
        }
        assert_eq!(picked, vec![0, 1, 4, 5]);

        // completion is relative to the selection
        assert_eq!(picker.count_missing(), 4);
        for index in [0, 1, 4, 5].iter() {
            picker.received_piece(*index);
        }
        assert!(picker.is_complete());
    }

    #[test]
    fn test_straddling_piece_stays_wanted() {
        // two files, the second deselected; the piece straddling both must
        // remain wanted
        let files = vec![
            FileInfo {
                path: PathBuf::from("0"),
                len: 6,
                torrent_offset: 0,
                executable: false,
            },
            FileInfo {
                path: PathBuf::from("1"),
                len: 6,
                torrent_offset: 6,
                executable: false,
            },
        ];
        let storage = StorageInfo {
            piece_count: 3,
            piece_len: 4,
            last_piece_len: 4,
            download_len: 12,
            download_dir: PathBuf::from("/"),
            structure: FsStructure::Archive { files },
        };
        let own = Bitfield::repeat(false, 3);
        let mut selection = FileSelection::new(2);
        selection.set(1, FilePriority::DoNotDownload);
        let picker = PiecePicker::new(
            own,
            &storage,
            selection,
            &StrategyConf::default(),
        )
        .unwrap();

        assert!(picker.is_wanted(0));
        // piece 1 covers bytes 4..8: straddles both files, stays wanted
        assert!(picker.is_wanted(1));
        // piece 2 covers bytes 8..12: entirely in the deselected file
        assert!(!picker.is_wanted(2));
    }

    #[test]
    fn test_priority_outranks_rarity() {
        let storage = three_file_storage();
        let mut picker = picker(&storage, &StrategyConf::default());

        let mut selection = FileSelection::new(3);
        selection.set(2, FilePriority::Maximum);
        picker.apply_selection(selection);

        // piece 0 is rarer than the maximum priority pieces 4 and 5, but
        // priority outranks rarity
        let mut sparse = Bitfield::repeat(false, 6);
        sparse.set(0, true);
        picker.register_availability(&sparse).unwrap();
        let seed = all_pieces(6);
        picker.register_availability(&seed).unwrap();
        picker.register_availability(&seed).unwrap();

        assert_eq!(picker.pick_piece(&seed), Some(4));
        assert_eq!(picker.pick_piece(&seed), Some(5));
        assert_eq!(picker.pick_piece(&seed), Some(0));
    }

    #[test]
    fn test_endgame_threshold() {
        let storage = single_file_storage(10, 0x4000);
        let mut strategy = StrategyConf::default();
        strategy.endgame_threshold = 0.2;
        let mut picker = picker(&storage, &strategy);
        assert!(!picker.in_endgame());

        // verify 8 of 10: 20% missing, at the threshold
        for index in 0..8 {
            picker.received_piece(index);
        }
        assert!(picker.in_endgame());

        for index in 8..10 {
            picker.received_piece(index);
        }
        // nothing missing: endgame is over
        assert!(!picker.in_endgame());
    }

    #[test]
    fn test_unregister_availability() {
        let storage = single_file_storage(2, 0x4000);
        let mut picker = picker(&storage, &StrategyConf::default());
        let peer = all_pieces(2);
        picker.register_availability(&peer).unwrap();
        picker.unregister_availability(&peer);
        // frequencies went back to zero but picking only depends on the
        // requesting peer's pieces
        assert_eq!(picker.pick_piece(&peer), Some(0));
    }
}
