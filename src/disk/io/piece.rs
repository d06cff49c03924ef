use std::{
    collections::BTreeMap,
    ops::Range,
    sync::{self, Arc},
};

use nix::sys::uio::IoVec;
use sha1::{Digest, Sha1};
use sha2::Sha256;

use crate::{
    block_count, block_len, disk::BlockAdmission, FileIndex, Sha1Hash,
    Sha256Hash, BLOCK_LEN,
};

use super::super::error::{ReadError, WriteError};
use super::file::TorrentFile;
use crate::disk::CachedBlock;

/// The expected hash a piece verifies against: a SHA-1 digest for v1
/// torrents, or the piece's SHA-256 merkle root from the BEP 52 piece
/// layers for v2 torrents.
#[derive(Clone, Copy, Debug)]
pub(super) enum ExpectedHash {
    Sha1(Sha1Hash),
    Sha256 {
        root: Sha256Hash,
        /// The number of 16 KiB leaves of the piece's merkle tree. This is
        /// derived from the torrent's nominal piece length, so for the last
        /// piece it generally exceeds the actual block count; the missing
        /// leaf hashes are zero, per BEP 52.
        leaf_count: usize,
    },
}

/// An in-progress piece download that keeps in memory the so far downloaded
/// blocks and the expected hash of the piece.
pub(super) struct Piece {
    /// The expected hash of the whole piece.
    pub expected_hash: ExpectedHash,
    /// The length of the piece, in bytes.
    pub len: u32,
    /// The so far downloaded blocks. Once the blocks cover the whole piece,
    /// it is complete and, if the hash is correct, saved to disk.
    ///
    /// Blocks are mapped to their offset within piece; a BTreeMap keeps them
    /// sorted by offset, which matters when hashing and writing them in
    /// order.
    pub blocks: BTreeMap<u32, Vec<u8>>,
    /// The files that this piece overlaps with.
    ///
    /// This is a left-inclusive range of all file indices, that can be used
    /// to index the `Torrent::files` vector to get the file handles.
    pub file_range: Range<FileIndex>,
}

impl Piece {
    /// Admits a block into the piece's write buffer.
    ///
    /// A block is rejected if it doesn't fit the piece or if it overlaps a
    /// previously accepted block of a different shape; re-sending an
    /// identical block is reported as a duplicate and the copy dropped.
    pub fn enqueue_block(&mut self, offset: u32, data: Vec<u8>) -> BlockAdmission {
        let len = data.len() as u32;
        if len == 0 || offset + len > self.len || len > BLOCK_LEN {
            log::warn!("Invalid piece block (offset {}, len {})", offset, len);
            return BlockAdmission::Rejected;
        }
        if let Some(existing) = self.blocks.get(&offset) {
            return if existing.len() == data.len() {
                log::trace!("Duplicate piece block at offset {}", offset);
                BlockAdmission::Duplicate
            } else {
                log::warn!(
                    "Block at offset {} re-sent with different length",
                    offset
                );
                BlockAdmission::Rejected
            };
        }
        // accepted offsets must be pairwise disjoint: check the nearest
        // buffered neighbors on both sides
        if let Some((prev_offset, prev_block)) =
            self.blocks.range(..offset).next_back()
        {
            if prev_offset + prev_block.len() as u32 > offset {
                log::warn!("Block at offset {} overlaps predecessor", offset);
                return BlockAdmission::Rejected;
            }
        }
        if let Some((next_offset, _)) = self.blocks.range(offset..).next() {
            if offset + len > *next_offset {
                log::warn!("Block at offset {} overlaps successor", offset);
                return BlockAdmission::Rejected;
            }
        }
        self.blocks.insert(offset, data);
        BlockAdmission::Accepted
    }

    /// Returns true if the piece's write buffer covers the whole piece.
    pub fn is_complete(&self) -> bool {
        self.blocks.values().map(|b| b.len() as u32).sum::<u32>() == self.len
    }

    /// Calculates the piece's hash using all its blocks and returns if it
    /// matches the expected hash.
    ///
    /// # Important
    ///
    /// This is a long running function and should be executed on a thread
    /// pool and not the executor.
    pub fn matches_hash(&self) -> bool {
        debug_assert!(self.is_complete());
        match &self.expected_hash {
            ExpectedHash::Sha1(expected) => {
                let mut hasher = Sha1::new();
                for block in self.blocks.values() {
                    hasher.update(block);
                }
                let hash = hasher.finalize();
                log::debug!("Piece hash: {:x}", hash);
                hash.as_slice() == expected
            }
            ExpectedHash::Sha256 { root, leaf_count } => {
                let data: Vec<u8> =
                    self.blocks.values().flatten().copied().collect();
                merkle_root(&data, *leaf_count) == *root
            }
        }
    }

    /// Writes the piece's blocks to the files the piece overlaps with,
    /// coalescing buffered blocks into vectored writes of at most
    /// `batch_bytes` each.
    ///
    /// # Important
    ///
    /// This performs sync IO and is thus potentially blocking and should be
    /// executed on a thread pool and not the executor.
    pub fn write(
        &self,
        torrent_piece_offset: u64,
        files: &[sync::RwLock<TorrentFile>],
        batch_bytes: usize,
    ) -> Result<usize, WriteError> {
        let batch_bytes = (batch_bytes.max(1)) as u64;
        // loop through all files the piece overlaps with and write that
        // part of piece to file
        let files = &files[self.file_range.clone()];
        debug_assert!(!files.is_empty());

        // the offset at which we need to write in torrent, updated with each
        // file written
        let mut torrent_write_offset = torrent_piece_offset;
        // how much of the piece has been written so far
        let mut total_write_count = 0u64;

        for file in files.iter() {
            let file = file.write().expect("file lock poisoned");

            debug_assert!(self.len as u64 > total_write_count);
            let remaining_piece_len = self.len as u64 - total_write_count;
            let file_slice = file
                .info
                .get_slice(torrent_write_offset, remaining_piece_len);
            // an empty file slice shouldn't occur as it would mean that
            // piece was thought to span more files than it actually does
            debug_assert!(file_slice.len > 0);

            // IO syscalls are not guaranteed to write the whole input in one
            // go, so rebuild the remaining iovecs and retry until all bytes
            // of the slice are on disk
            let mut written = 0u64;
            while written < file_slice.len {
                let chunk = (file_slice.len - written).min(batch_bytes);
                let iovecs =
                    self.slice_iovecs(total_write_count + written, chunk);
                debug_assert!(!iovecs.is_empty());
                let n = file
                    .write_vectored_at(&iovecs, file_slice.offset + written)?;
                if n == 0 {
                    return Err(WriteError::Io(std::io::Error::new(
                        std::io::ErrorKind::WriteZero,
                        "pwritev wrote no bytes",
                    )));
                }
                written += n as u64;
            }

            torrent_write_offset += file_slice.len;
            total_write_count += file_slice.len;
        }

        // we should have written exactly the whole piece
        debug_assert_eq!(total_write_count, self.len as u64);

        Ok(total_write_count as usize)
    }

    /// Builds the iovecs covering `len` bytes of the piece starting at the
    /// piece-relative offset, slicing into the buffered blocks as needed.
    fn slice_iovecs(&self, start: u64, len: u64) -> Vec<IoVec<&[u8]>> {
        let end = start + len;
        let mut iovecs = Vec::new();
        for (block_offset, block) in self.blocks.iter() {
            let block_start = *block_offset as u64;
            let block_end = block_start + block.len() as u64;
            if block_end <= start {
                continue;
            }
            if block_start >= end {
                break;
            }
            let from = start.saturating_sub(block_start) as usize;
            let to = (end.min(block_end) - block_start) as usize;
            iovecs.push(IoVec::from_slice(&block[from..to]));
        }
        iovecs
    }

    /// Returns a copy of the buffered block at the offset, if present. Used
    /// to serve requests for pieces still being verified.
    pub fn buffered_block(&self, offset: u32, len: u32) -> Option<Vec<u8>> {
        self.blocks
            .get(&offset)
            .filter(|block| block.len() as u32 == len)
            .cloned()
    }
}

/// Computes the BEP 52 merkle root of a piece: leaves are the SHA-256
/// hashes of the piece's 16 KiB blocks (the trailing block hashed at its
/// actual length), padded with zero hashes up to `leaf_count`, then hashed
/// up pairwise.
pub(super) fn merkle_root(data: &[u8], leaf_count: usize) -> Sha256Hash {
    debug_assert!(leaf_count.is_power_of_two());
    let mut layer: Vec<Sha256Hash> = data
        .chunks(BLOCK_LEN as usize)
        .map(|chunk| Sha256::digest(chunk).into())
        .collect();
    debug_assert!(layer.len() <= leaf_count);
    layer.resize(leaf_count, [0; 32]);

    while layer.len() > 1 {
        layer = layer
            .chunks(2)
            .map(|pair| {
                let mut hasher = Sha256::new();
                hasher.update(&pair[0]);
                hasher.update(&pair[1]);
                hasher.finalize().into()
            })
            .collect();
    }
    layer[0]
}

/// Reads a piece's blocks from the specified portion of the torrent from
/// disk.
///
/// # Arguments
///
/// * `torrent_piece_offset` - The absolute offset of the piece's first byte
///     in the whole torrent.
/// * `file_range` - The files that contain data of the piece.
/// * `files` - A slice of all files in torrent.
/// * `piece_len` - The length of the piece to read in.
///
/// # Important
///
/// This performs sync IO and should be executed on a thread pool and not
/// the executor.
pub(super) fn read(
    torrent_piece_offset: u64,
    file_range: Range<FileIndex>,
    files: &[sync::RwLock<TorrentFile>],
    piece_len: u32,
) -> Result<Vec<CachedBlock>, ReadError> {
    // reserve a read buffer for each block in piece
    let block_count = block_count(piece_len);
    let mut bufs: Vec<Vec<u8>> = (0..block_count)
        .map(|index| vec![0u8; block_len(piece_len, index) as usize])
        .collect();

    let files = &files[file_range];
    debug_assert!(!files.is_empty());
    let piece_len = piece_len as u64;

    // how much of the piece has been read so far
    let mut total_read_count = 0u64;

    for file in files.iter() {
        let file = file.read().expect("file lock poisoned");

        debug_assert!(piece_len > total_read_count);
        let remaining_piece_len = piece_len - total_read_count;
        let file_slice = file.info.get_slice(
            torrent_piece_offset + total_read_count,
            remaining_piece_len,
        );
        debug_assert!(file_slice.len > 0);

        let mut read = 0u64;
        while read < file_slice.len {
            let mut iovecs = slice_iovecs_mut(
                &mut bufs,
                total_read_count + read,
                file_slice.len - read,
            );
            debug_assert!(!iovecs.is_empty());
            let n = file
                .read_vectored_at(&mut iovecs, file_slice.offset + read)?;
            if n == 0 {
                // the file is shorter than the piece expects: the data has
                // not been downloaded yet
                return Err(ReadError::MissingData);
            }
            read += n as u64;
        }

        total_read_count += file_slice.len;
    }

    debug_assert_eq!(total_read_count, piece_len);

    Ok(bufs.into_iter().map(Arc::new).collect())
}

/// The mutable counterpart of `Piece::slice_iovecs`, carving the byte range
/// `[start, start + len)` of the piece out of the read buffers.
fn slice_iovecs_mut(
    bufs: &mut [Vec<u8>],
    start: u64,
    len: u64,
) -> Vec<IoVec<&mut [u8]>> {
    let end = start + len;
    let mut iovecs = Vec::new();
    let mut buf_start = 0u64;
    for buf in bufs.iter_mut() {
        let buf_end = buf_start + buf.len() as u64;
        if buf_end > start && buf_start < end {
            let from = start.saturating_sub(buf_start) as usize;
            let to = (end.min(buf_end) - buf_start) as usize;
            iovecs.push(IoVec::from_mut_slice(&mut buf[from..to]));
        }
        buf_start = buf_end;
        if buf_start >= end {
            break;
        }
    }
    iovecs
}
