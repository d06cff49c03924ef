use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors of the disk task itself. Any of these tears down the task; errors
/// of individual torrents or operations are reported through alerts instead.
#[derive(Debug, Error)]
pub enum Error {
    #[error("disk channel closed")]
    Channel,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for Error {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Self::Channel
    }
}

/// Errors of setting up a new torrent's files on disk.
#[derive(Debug, Error)]
pub enum NewTorrentError {
    /// The torrent id is already registered with the disk task.
    #[error("torrent already allocated")]
    AlreadyExists,
    /// Filesystem failure while creating the directory structure or
    /// preallocating files.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors of accepting and writing a block.
#[derive(Debug, Error)]
pub enum WriteError {
    /// The block's piece index doesn't exist in the torrent.
    #[error("invalid piece index")]
    InvalidPieceIndex,
    /// The block's offset/length don't fit its piece, or overlap a
    /// previously accepted block of a different shape.
    #[error("invalid block geometry")]
    InvalidBlock,
    /// Filesystem failure. Transient failures are retried by the torrent
    /// with bounded backoff; persistent ones (e.g. a full disk) surface in
    /// the torrent's status.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors of serving a block read.
#[derive(Debug, Error)]
pub enum ReadError {
    /// The requested piece index doesn't exist in the torrent.
    #[error("invalid piece index")]
    InvalidPieceIndex,
    /// The requested offset doesn't address a block within the piece.
    #[error("invalid block offset")]
    InvalidBlockOffset,
    /// The underlying file doesn't contain the data yet.
    #[error("data missing from disk")]
    MissingData,
    /// Filesystem failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
