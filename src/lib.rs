// needed by the `select!` macro reaching the default recursion limit
#![recursion_limit = "256"]

#[macro_use]
extern crate serde_derive;

mod checkpoint;
mod conf;
mod counter;
mod disk;
mod download;
pub mod engine;
pub mod error;
pub mod magnet;
pub mod metainfo;
mod metadata;
mod peer;
mod piece_picker;
mod rate_limiter;
mod storage_info;
pub mod torrent;

use bitvec::prelude::{BitVec, Msb0};

pub use checkpoint::{Checkpoint, CheckpointError, CheckpointStore};
pub use conf::{
    Conf, DiskConf, EngineConf, NetworkConf, PieceSelection, Preallocation,
    ResumeConf, StrategyConf, TorrentConf,
};
pub use magnet::MagnetInfo;
pub use storage_info::{FileInfo, FilePriority};
pub use torrent::{
    Event, PeerOrigin, TorrentHandle, TorrentParams, TorrentSource,
    TorrentState, TorrentStatus,
};

/// The type of a piece's index.
///
/// On the wire all integers are sent as 4-byte big endian integers, but in the
/// source code we use `usize` to be consistent with other index types in Rust.
pub type PieceIndex = usize;

/// The type of a file's index.
pub type FileIndex = usize;

/// Each torrent gets a randomly assigned ID that is unique within the
/// application.
pub type TorrentId = u32;

/// The peer ID is an arbitrary 20 byte string.
///
/// Guidelines for choosing a peer ID: http://bittorrent.org/beps/bep_0020.html.
pub type PeerId = [u8; 20];

/// A SHA-1 hash digest, 20 bytes long.
pub type Sha1Hash = [u8; 20];

/// A SHA-256 hash digest, 32 bytes long. Used by v2 (BEP 52) torrents.
pub type Sha256Hash = [u8; 32];

/// The hash identifying a torrent.
///
/// v1 torrents are identified by the SHA-1 of their bencoded `info`
/// dictionary, v2 torrents (BEP 52) by its SHA-256. A hybrid torrent carries
/// both; the controller treats the v1 hash as its primary identity and keeps
/// the v2 hash alongside it in [`metainfo::Metainfo`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InfoHash {
    V1(Sha1Hash),
    V2(Sha256Hash),
}

impl InfoHash {
    /// Returns the 20 byte form used in the wire handshake: the v1 hash
    /// as is, or the SHA-256 hash truncated to 20 bytes, as specified by
    /// BEP 52 for backwards compatibility.
    pub fn wire(&self) -> [u8; 20] {
        match self {
            Self::V1(hash) => *hash,
            Self::V2(hash) => {
                let mut wire = [0; 20];
                wire.copy_from_slice(&hash[..20]);
                wire
            }
        }
    }

    /// The hexadecimal rendering of the full hash, used for checkpoint file
    /// names and logging.
    pub fn to_hex(&self) -> String {
        match self {
            Self::V1(hash) => hex::encode(hash),
            Self::V2(hash) => hex::encode(hash),
        }
    }
}

impl std::fmt::Display for InfoHash {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// The bitfield represents the piece availability of a peer.
///
/// It is a compact bool vector of most significant bits to least significants
/// bits, that is, where the first highest bit represents the first piece, the
/// second highest element the second piece, and so on (e.g. `0b1100_0001` would
/// mean that we have pieces 0, 1, and 7). A truthy boolean value of a piece's
/// position in this vector means that the peer has the piece, while a falsy
/// value means it doesn't have the piece.
pub type Bitfield = BitVec<Msb0, u8>;

/// The canonical block length, 16 KiB. Requests use this granularity (except
/// for possibly the last block of a piece) and the protocol treats it as a
/// ceiling: a request for more than this is a protocol violation.
pub(crate) const BLOCK_LEN: u32 = 0x4000;

/// A block is a fixed size chunk of a piece, which in turn is a fixed size
/// chunk of a torrent. Downloading torrents happen at this block level
/// granularity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct BlockInfo {
    /// The index of the piece of which this is a block.
    pub piece_index: PieceIndex,
    /// The zero-based byte offset into the piece.
    pub offset: u32,
    /// The block's length in bytes. At most 16 KiB (0x4000 bytes).
    pub len: u32,
}

impl BlockInfo {
    /// Returns the index of the block within its piece, assuming the default
    /// block length of 16 KiB.
    pub fn index_in_piece(&self) -> usize {
        // we need to use "lower than or equal" as this may be the last block in
        // which case it may be shorter than the default block length
        debug_assert!(self.len <= BLOCK_LEN);
        debug_assert!(self.len > 0);
        (self.offset / BLOCK_LEN) as usize
    }
}

impl std::fmt::Display for BlockInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "(piece: {}, offset: {}, len: {})",
            self.piece_index, self.offset, self.len
        )
    }
}

/// Returns the length of the block at the index in piece.
///
/// If the piece is not a multiple of the default block length, the returned
/// value is smaller.
///
/// # Panics
///
/// Panics if the index multiplied by the default block length would exceed the
/// piece length.
pub(crate) fn block_len(piece_len: u32, index: usize) -> u32 {
    let index = index as u32;
    let block_offset = index * BLOCK_LEN;
    assert!(piece_len > block_offset);
    std::cmp::min(piece_len - block_offset, BLOCK_LEN)
}

/// Returns the number of blocks in a piece of the given length.
pub(crate) fn block_count(piece_len: u32) -> usize {
    // all but the last piece are a multiple of the block length, but the
    // last piece may be shorter so we need to account for this by rounding
    // up before dividing to get the number of blocks in piece
    (piece_len as usize + (BLOCK_LEN as usize - 1)) / BLOCK_LEN as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    // An arbitrary piece length that is an exact multiple of the canonical
    // block length (16 KiB).
    const BLOCK_LEN_MULTIPLE_PIECE_LEN: u32 = 2 * BLOCK_LEN;

    // An arbitrary piece length that is _not_ a multiple of the canonical block
    // length and the amount with which it overlaps the nearest exact multiple
    // value.
    const OVERLAP: u32 = 234;
    const UNEVEN_PIECE_LEN: u32 = 2 * BLOCK_LEN + OVERLAP;

    #[test]
    fn test_block_len() {
        assert_eq!(block_len(BLOCK_LEN_MULTIPLE_PIECE_LEN, 0), BLOCK_LEN);
        assert_eq!(block_len(BLOCK_LEN_MULTIPLE_PIECE_LEN, 1), BLOCK_LEN);

        assert_eq!(block_len(UNEVEN_PIECE_LEN, 0), BLOCK_LEN);
        assert_eq!(block_len(UNEVEN_PIECE_LEN, 1), BLOCK_LEN);
        assert_eq!(block_len(UNEVEN_PIECE_LEN, 2), OVERLAP);
    }

    #[test]
    #[should_panic]
    fn test_block_len_invalid_index_panic() {
        block_len(BLOCK_LEN_MULTIPLE_PIECE_LEN, 2);
    }

    #[test]
    fn test_block_count() {
        assert_eq!(block_count(BLOCK_LEN_MULTIPLE_PIECE_LEN), 2);

        assert_eq!(block_count(UNEVEN_PIECE_LEN), 3);
    }

    #[test]
    fn test_info_hash_wire_form() {
        let v1 = InfoHash::V1([0xab; 20]);
        assert_eq!(v1.wire(), [0xab; 20]);

        let mut v2_hash = [0; 32];
        for (i, b) in v2_hash.iter_mut().enumerate() {
            *b = i as u8;
        }
        let v2 = InfoHash::V2(v2_hash);
        assert_eq!(&v2.wire()[..], &v2_hash[..20]);
        assert_eq!(v2.to_hex().len(), 64);
    }
}
