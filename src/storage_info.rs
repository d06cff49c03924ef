use std::{ops::Range, path::PathBuf};

use crate::{error::*, metainfo::Metainfo, FileIndex, PieceIndex};

/// Information about a torrent's file.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FileInfo {
    /// The file's relative path from the download directory.
    pub path: PathBuf,
    /// The file's length, in bytes.
    pub len: u64,
    /// The byte offset of the file within the torrent, when all files in
    /// torrent are viewed as a single contiguous byte array. This is always
    /// 0 for a single file torrent.
    pub torrent_offset: u64,
    /// Whether the torrent declares this file executable.
    pub executable: bool,
}

impl FileInfo {
    /// The byte range the file occupies in the torrent, where all files are
    /// laid out back to back as one contiguous array.
    pub(crate) fn byte_range(&self) -> Range<u64> {
        self.torrent_offset..self.torrent_end_offset()
    }

    /// One past the offset of the file's last byte in the torrent.
    pub(crate) fn torrent_end_offset(&self) -> u64 {
        self.torrent_offset + self.len
    }

    /// Maps a torrent byte range onto this file: the returned slice begins
    /// where `torrent_offset` lands within the file and is clipped at the
    /// file's end, so its length never exceeds what the file can hold of
    /// the `len` bytes asked for.
    ///
    /// # Panics
    ///
    /// Panics if `torrent_offset` doesn't fall inside the file; callers are
    /// expected to have resolved which files a range intersects first.
    pub(crate) fn get_slice(&self, torrent_offset: u64, len: u64) -> FileSlice {
        assert!(
            self.byte_range().contains(&torrent_offset),
            "offset {} not within file spanning {:?}",
            torrent_offset,
            self.byte_range(),
        );

        let offset = torrent_offset - self.torrent_offset;
        FileSlice {
            offset,
            len: len.min(self.len - offset),
        }
    }
}

/// Represents the location of a range of bytes within a file.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct FileSlice {
    /// The byte offset in file, relative to the file's start.
    pub offset: u64,
    /// The length of the slice, in bytes.
    pub len: u64,
}

/// The download priority of a single file.
///
/// `DoNotDownload` deselects the file: pieces entirely inside it are not
/// requested. The other four levels bias the piece picker's ranking.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize,
    Deserialize,
)]
#[repr(u8)]
pub enum FilePriority {
    DoNotDownload = 0,
    Low = 1,
    Normal = 2,
    High = 3,
    Maximum = 4,
}

impl FilePriority {
    /// Converts a BEP 53 priority level (0-4) into a priority.
    pub fn from_level(level: u8) -> Option<Self> {
        match level {
            0 => Some(Self::DoNotDownload),
            1 => Some(Self::Low),
            2 => Some(Self::Normal),
            3 => Some(Self::High),
            4 => Some(Self::Maximum),
            _ => None,
        }
    }

    pub fn is_selected(self) -> bool {
        self != Self::DoNotDownload
    }
}

impl Default for FilePriority {
    fn default() -> Self {
        Self::Normal
    }
}

/// The per-file selection state of a torrent.
///
/// A piece is "wanted" iff at least one file it overlaps is selected; a
/// piece straddling a selected and an unselected file is still wanted and
/// writes through into the unselected file so that it can be hashed whole.
#[derive(Clone, Debug)]
pub(crate) struct FileSelection {
    priorities: Vec<FilePriority>,
}

impl FileSelection {
    pub fn new(file_count: usize) -> Self {
        Self {
            priorities: vec![FilePriority::default(); file_count],
        }
    }

    pub fn from_priorities(priorities: Vec<FilePriority>) -> Self {
        Self { priorities }
    }

    pub fn file_count(&self) -> usize {
        self.priorities.len()
    }

    pub fn set(&mut self, index: FileIndex, priority: FilePriority) {
        self.priorities[index] = priority;
    }

    pub fn priorities(&self) -> &[FilePriority] {
        &self.priorities
    }

    /// Returns whether any file in the range is selected.
    pub fn is_any_selected(&self, files: Range<FileIndex>) -> bool {
        self.priorities[files].iter().any(|p| p.is_selected())
    }

    /// Returns the strongest priority among the files in the range.
    pub fn max_priority(&self, files: Range<FileIndex>) -> FilePriority {
        self.priorities[files]
            .iter()
            .copied()
            .max()
            .unwrap_or(FilePriority::DoNotDownload)
    }
}

/// Information about a torrent's storage details, such as the piece count and
/// length, download length, etc.
#[derive(Clone, Debug)]
pub(crate) struct StorageInfo {
    /// The number of pieces in the torrent.
    pub piece_count: usize,
    /// The nominal length of a piece.
    pub piece_len: u32,
    /// The length of the last piece in torrent, which may differ from the
    /// normal piece length if the download size is not an exact multiple of the
    /// piece length.
    pub last_piece_len: u32,
    /// The sum of the length of all files in the torrent.
    pub download_len: u64,
    /// The download destination directory of the torrent.
    ///
    /// In case of single file downloads, this is the directory where the file
    /// is downloaded. In case of archive downloads, this directory is the
    /// download directory joined by the torrent's name, so that a torrent with
    /// multiple top-level entries doesn't scatter files across the download
    /// directory.
    pub download_dir: PathBuf,
    /// The paths and lengths of the torrent files.
    pub structure: FsStructure,
}

impl StorageInfo {
    /// Extracts storage related information from the torrent metainfo.
    pub fn new(metainfo: &Metainfo, download_dir: PathBuf) -> Self {
        let piece_count = metainfo.piece_count();
        let piece_len = metainfo.piece_len;

        // lay the files out end to end in torrent order
        let mut torrent_offset = 0;
        let mut files: Vec<FileInfo> = metainfo
            .files
            .iter()
            .map(|f| {
                let file = FileInfo {
                    path: f.path.clone(),
                    len: f.len,
                    torrent_offset,
                    executable: f.executable,
                };
                torrent_offset += f.len;
                file
            })
            .collect();

        let structure = if files.len() > 1 {
            FsStructure::Archive { files }
        } else {
            FsStructure::File(files.remove(0))
        };
        let download_len = structure.download_len();
        let last_piece_len =
            download_len - piece_len as u64 * (piece_count - 1) as u64;
        let last_piece_len = last_piece_len as u32;

        // if this is an archive, download files into torrent's own dir so
        // a torrent with multiple top level entries doesn't scatter them
        let download_dir = if structure.is_archive() {
            download_dir.join(&metainfo.name)
        } else {
            download_dir
        };

        Self {
            piece_count,
            piece_len,
            last_piece_len,
            download_len,
            download_dir,
            structure,
        }
    }

    /// Returns the files of the torrent as a flat slice, regardless of
    /// structure.
    pub fn files(&self) -> &[FileInfo] {
        match &self.structure {
            FsStructure::File(file) => std::slice::from_ref(file),
            FsStructure::Archive { files } => files,
        }
    }

    /// Returns the zero-based indices of the files of torrent that intersect
    /// with the piece.
    pub fn files_intersecting_piece(
        &self,
        index: PieceIndex,
    ) -> Result<Range<FileIndex>> {
        log::trace!("Returning files intersecting piece {}", index);
        let piece_offset = index as u64 * self.piece_len as u64;
        let piece_end = piece_offset + self.piece_len(index)? as u64;
        let files = self
            .structure
            .files_intersecting_bytes(piece_offset..piece_end);
        Ok(files)
    }

    /// Returns the length of the piece at the given index.
    pub fn piece_len(&self, index: PieceIndex) -> Result<u32> {
        if index == self.piece_count - 1 {
            Ok(self.last_piece_len)
        } else if index < self.piece_count - 1 {
            Ok(self.piece_len)
        } else {
            log::error!("Piece {} is invalid for torrent: {:?}", index, self);
            Err(Error::InvalidPieceIndex)
        }
    }

    /// Returns the piece's first byte's offset in the torrent.
    pub fn torrent_piece_offset(&self, index: PieceIndex) -> u64 {
        index as u64 * self.piece_len as u64
    }
}

/// Defines the file system structure of the download.
#[derive(Clone, Debug)]
pub(crate) enum FsStructure {
    /// This is a single file download.
    File(FileInfo),
    /// The download is for multiple files, possibly with nested directories.
    Archive {
        /// A flattened list of all files in the archive.
        ///
        /// When all files in the torrent are viewed as a single contiguous byte
        /// array, we can get the offset of a file in torrent. The file's last
        /// byte offset in torrent is the key of this map, for helping us with
        /// lookups of which piece bytes are contained in file.
        files: Vec<FileInfo>,
    },
}

impl FsStructure {
    /// Returns true if the download is for an archive.
    pub fn is_archive(&self) -> bool {
        matches!(self, Self::Archive { .. })
    }

    /// Returns the total download size in bytes.
    ///
    /// Note that this is an O(n) operation for archive downloads, where n is
    /// the number of files, so the return value should ideally be cached.
    pub fn download_len(&self) -> u64 {
        match self {
            Self::File(file) => file.len,
            Self::Archive { files } => files.iter().map(|f| f.len).sum(),
        }
    }

    /// Returns the files that overlap with the given left-inclusive range of
    /// bytes, where `bytes.start` is the offset and `bytes.end` is one past the
    /// last byte offset.
    pub fn files_intersecting_bytes(
        &self,
        byte_range: Range<u64>,
    ) -> Range<FileIndex> {
        match self {
            // when torrent only has one file, only that file can be returned
            Self::File(_) => 0..1,
            Self::Archive { files } => {
                // find the index of the first file that contains the first byte
                // of the given range
                let first_matching_index = match files
                    .iter()
                    .enumerate()
                    .find(|(_, file)| {
                        // check if the file's byte range contains the first
                        // byte of the given range
                        file.byte_range().contains(&byte_range.start)
                    })
                    .map(|(index, _)| index)
                {
                    Some(index) => index,
                    None => return 0..0,
                };

                // the resulting files
                let mut file_range =
                    first_matching_index..first_matching_index + 1;

                // Find the the last file that contains the last byte of the
                // given range, starting at the file after the above found one.
                //
                // NOTE: the order of `enumerate` and `skip` matters as
                // otherwise we'd be getting relative indices
                for (index, file) in
                    files.iter().enumerate().skip(first_matching_index + 1)
                {
                    // stop if file's first byte is not contained by the given
                    // byte range (is at or past the end of the byte range we're
                    // looking for)
                    if !byte_range.contains(&file.torrent_offset) {
                        break;
                    }

                    // note that we need to add one to the end as this is
                    // a left-inclusive range, so we want the end (excluded) to
                    // be one past the actually included value
                    file_range.end = index + 1;
                }

                file_range
            }
        }
    }
}
