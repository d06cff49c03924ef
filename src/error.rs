//! The crate's error taxonomy.
//!
//! Errors are scoped: [`PeerError`] is fatal to a single peer session but
//! never to its torrent, while [`Error`] covers torrent and engine level
//! failures. Piece level failures (a bad hash) are not errors at all but
//! ordinary results the disk layer reports, since the piece is simply
//! requeued.

use thiserror::Error;

use crate::checkpoint::CheckpointError;
use crate::magnet::MagnetError;
use crate::metainfo::MetainfoError;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Torrent and engine level errors.
#[derive(Debug, Error)]
pub enum Error {
    /// The configuration the torrent was started with is unusable, e.g. a
    /// block size larger than the piece length. The torrent refuses to start.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The torrent id has no corresponding torrent in the engine.
    #[error("invalid torrent id")]
    InvalidTorrentId,

    /// An out of bounds piece index was used.
    #[error("invalid piece index")]
    InvalidPieceIndex,

    /// An operation needed the torrent's metadata but the magnet bootstrap
    /// has not produced it yet.
    #[error("torrent metadata not yet available")]
    MetadataMissing,

    /// The assembled metadata did not hash to the magnet's info hash. The
    /// exchange restarts and contributing peers are blacklisted.
    #[error("fetched metadata does not match the info hash")]
    MetadataMismatch,

    /// The engine or a torrent has reached its connection limit; new peers
    /// are dropped while existing connections continue.
    #[error("peer connection limit reached")]
    TooManyPeers,

    /// A channel to another task of the engine was closed. This is fatal to
    /// the component but usually just means the engine is shutting down.
    #[error("channel closed")]
    Channel,

    #[error(transparent)]
    Peer(#[from] PeerError),

    #[error(transparent)]
    Metainfo(#[from] MetainfoError),

    #[error(transparent)]
    Magnet(#[from] MagnetError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for Error {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Self::Channel
    }
}

/// Errors fatal to a single peer session.
///
/// Any of these tears down the session (after best effort CANCELs for
/// outstanding requests), but the torrent keeps running with its other peers.
#[derive(Debug, Error)]
pub enum PeerError {
    /// The remote handshake was malformed or carried the wrong protocol
    /// string.
    #[error("invalid handshake")]
    InvalidHandshake,

    /// The info hash in the remote handshake differs from the torrent's.
    #[error("peer advertised a different info hash")]
    InvalidInfoHash,

    /// The remote peer id equals our own client id: we dialed ourselves.
    #[error("connected to self")]
    SelfConnection,

    /// The remote sent a bitfield message at a point other than directly
    /// after the handshake.
    #[error("bitfield sent not directly after the handshake")]
    BitfieldNotAfterHandshake,

    /// A message's length prefix exceeds the protocol maximum.
    #[error("message too large: {0} bytes")]
    MessageTooLarge(u32),

    /// A structurally invalid message: unknown id, impossible field values,
    /// a block crossing its piece boundary, or a malformed bitfield length.
    #[error("invalid message")]
    InvalidMessage,

    /// The remote sent requests while we were choking it.
    #[error("request received while peer is choked")]
    RequestWhileChoked,

    /// The remote peer was dropped for repeatedly contributing to pieces
    /// that failed hash verification.
    #[error("peer banned for bad data")]
    Banned,

    /// Dial, handshake or general inactivity timeout.
    #[error("peer timed out")]
    Timeout,

    /// The session's channel to its torrent was closed.
    #[error("channel closed")]
    Channel,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for PeerError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Self::Channel
    }
}
