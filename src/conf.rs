//! This module defines types used to configure the engine and its parts.

use std::{path::PathBuf, time::Duration};

use crate::{error::Error, PeerId, BLOCK_LEN};

/// The default riptorrent client id.
pub const RIPTORRENT_CLIENT_ID: &PeerId = b"-rp0100-000000000000";

/// The global configuration for the torrent engine and all its parts.
#[derive(Clone, Debug)]
pub struct Conf {
    pub engine: EngineConf,
    pub torrent: TorrentConf,
}

impl Conf {
    /// Returns the configuration with reasonable defaults, except for the
    /// download directory, as it is not sensible to guess that for the user.
    /// It uses the default riptorrent client id, [`RIPTORRENT_CLIENT_ID`].
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            engine: EngineConf::default(),
            torrent: TorrentConf::new(download_dir),
        }
    }
}

/// Configuration related to the engine itself.
#[derive(Clone, Debug)]
pub struct EngineConf {
    /// The ID of the client to announce to other peers.
    pub client_id: PeerId,
    /// The port on which the session level listener accepts inbound
    /// connections. The engine only records it; binding the listener is the
    /// host application's job.
    pub listen_port: u16,
    /// The maximum number of peer connections across all torrents.
    pub max_global_peers: usize,
    /// Global download rate cap in KiB/s. Zero means unlimited.
    pub global_down_kib: u64,
    /// Global upload rate cap in KiB/s. Zero means unlimited.
    pub global_up_kib: u64,
}

impl Default for EngineConf {
    fn default() -> Self {
        Self {
            client_id: *RIPTORRENT_CLIENT_ID,
            listen_port: 6881,
            max_global_peers: 500,
            global_down_kib: 0,
            global_up_kib: 0,
        }
    }
}

/// Configuration for a torrent.
///
/// The engine will have a default instance of this applied to all torrents by
/// default, but individual torrents may override this configuration.
#[derive(Clone, Debug)]
pub struct TorrentConf {
    /// The directory in which a torrent's files are placed upon download and
    /// from which they are seeded.
    pub download_dir: PathBuf,
    /// Per-torrent download rate cap in KiB/s. Zero means unlimited.
    pub down_kib: u64,
    /// Per-torrent upload rate cap in KiB/s. Zero means unlimited.
    pub up_kib: u64,
    pub network: NetworkConf,
    pub strategy: StrategyConf,
    pub disk: DiskConf,
    pub resume: ResumeConf,
}

impl TorrentConf {
    /// Returns the torrent configuration with reasonable defaults, except for
    /// the download directory, as it is not sensible to guess that for the
    /// user.
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            download_dir: download_dir.into(),
            down_kib: 0,
            up_kib: 0,
            network: NetworkConf::default(),
            strategy: StrategyConf::default(),
            disk: DiskConf::default(),
            resume: ResumeConf::default(),
        }
    }

    /// Checks the configuration for values that would make the torrent
    /// misbehave. Called once at torrent start; a torrent with an invalid
    /// configuration refuses to start.
    pub fn validate(&self, piece_len: Option<u32>) -> Result<(), Error> {
        let block_size = self.network.block_size;
        if block_size == 0 || block_size > BLOCK_LEN {
            return Err(Error::InvalidConfig(format!(
                "block_size {} outside (0, {}]",
                block_size, BLOCK_LEN
            )));
        }
        if !block_size.is_power_of_two() {
            return Err(Error::InvalidConfig(format!(
                "block_size {} is not a power of two",
                block_size
            )));
        }
        if let Some(piece_len) = piece_len {
            if block_size > piece_len {
                return Err(Error::InvalidConfig(format!(
                    "block_size {} larger than piece length {}",
                    block_size, piece_len
                )));
            }
        }
        let pipeline = self.network.pipeline_depth;
        if pipeline == 0 || pipeline > 256 {
            return Err(Error::InvalidConfig(format!(
                "pipeline_depth {} outside [1, 256]",
                pipeline
            )));
        }
        let threshold = self.strategy.endgame_threshold;
        if !(0.0..=1.0).contains(&threshold) {
            return Err(Error::InvalidConfig(format!(
                "endgame_threshold {} outside [0, 1]",
                threshold
            )));
        }
        if self.strategy.endgame_duplicates == 0 {
            return Err(Error::InvalidConfig(
                "endgame_duplicates must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Peer networking knobs of a torrent.
#[derive(Clone, Debug)]
pub struct NetworkConf {
    /// The max number of connected peers the torrent should have.
    pub max_peers_per_torrent: usize,
    /// The number of block requests kept outstanding to a single peer.
    pub pipeline_depth: usize,
    /// The request granularity in bytes. Defaults to the protocol's canonical
    /// 16 KiB which is also the ceiling.
    pub block_size: u32,
    /// Time allowed for the TCP dial plus the handshake exchange.
    pub connection_timeout: Duration,
    /// General inactivity timeout after which an idle session is closed.
    pub peer_timeout: Duration,
    /// Time allowed for a single block request to be served before it is
    /// requeued and the peer penalized.
    pub request_timeout: Duration,
    /// How often the upload choker recomputes the unchoke set.
    pub unchoke_interval: Duration,
    /// How often the optimistic unchoke slot is rotated.
    pub optimistic_unchoke_interval: Duration,
}

impl Default for NetworkConf {
    fn default() -> Self {
        Self {
            max_peers_per_torrent: 50,
            pipeline_depth: 16,
            block_size: BLOCK_LEN,
            connection_timeout: Duration::from_secs(20),
            peer_timeout: Duration::from_secs(120),
            request_timeout: Duration::from_secs(30),
            unchoke_interval: Duration::from_secs(10),
            optimistic_unchoke_interval: Duration::from_secs(30),
        }
    }
}

/// The piece selection policy of the picker.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PieceSelection {
    /// Pick the piece the fewest connected peers have. The default.
    RarestFirst,
    /// Pick pieces in ascending index order. Used for streaming.
    Sequential,
    /// Pseudo-random spread across pieces. A fallback and diagnostic policy.
    RoundRobin,
}

impl Default for PieceSelection {
    fn default() -> Self {
        Self::RarestFirst
    }
}

/// Piece selection strategy knobs.
#[derive(Clone, Debug)]
pub struct StrategyConf {
    pub piece_selection: PieceSelection,
    /// When the fraction of unverified pieces drops to or below this value
    /// the picker enters endgame mode.
    pub endgame_threshold: f64,
    /// How many peers an outstanding block may be requested from in parallel
    /// during endgame.
    pub endgame_duplicates: usize,
    /// Under the sequential policy, request the first and last pieces first
    /// so media players can probe container headers and footers.
    pub first_last_piece_bias: bool,
}

impl Default for StrategyConf {
    fn default() -> Self {
        Self {
            piece_selection: PieceSelection::default(),
            endgame_threshold: 0.02,
            endgame_duplicates: 2,
            first_last_piece_bias: false,
        }
    }
}

/// The file preallocation policy applied when a torrent's files are first
/// created.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Preallocation {
    /// Files are created on first write and grown as pieces arrive.
    None,
    /// Files are created with their logical length up front; filesystem holes
    /// are permitted.
    Sparse,
    /// The entire length is allocated at creation, zeroing if the filesystem
    /// requires it.
    Full,
}

impl Default for Preallocation {
    fn default() -> Self {
        Self::Sparse
    }
}

/// Disk IO knobs of a torrent.
#[derive(Clone, Debug)]
pub struct DiskConf {
    /// Upper bound on concurrently running hash verification jobs.
    pub hash_workers: usize,
    /// Upper bound on concurrently running disk read/write jobs.
    pub disk_workers: usize,
    /// The write coalescing envelope, in bytes.
    pub write_batch_bytes: usize,
    pub preallocate: Preallocation,
    /// Whether each write batch is fsynced as it lands. `flush()` syncs
    /// regardless.
    pub fsync_on_batch: bool,
}

impl Default for DiskConf {
    fn default() -> Self {
        Self {
            hash_workers: 4,
            disk_workers: 4,
            write_batch_bytes: 512 * 1024,
            preallocate: Preallocation::default(),
            fsync_on_batch: false,
        }
    }
}

/// Resume checkpoint knobs of a torrent.
#[derive(Clone, Debug)]
pub struct ResumeConf {
    pub checkpoint_enabled: bool,
    /// The debounce interval of the periodic checkpoint writer.
    pub checkpoint_interval: Duration,
    /// Where checkpoints are stored. When unset, checkpoints are disabled.
    pub checkpoint_dir: Option<PathBuf>,
    /// How many random verified pieces to re-hash from disk before trusting
    /// a loaded checkpoint's bitfield. Zero trusts the bitfield outright.
    pub integrity_check_pieces: usize,
}

impl Default for ResumeConf {
    fn default() -> Self {
        Self {
            checkpoint_enabled: true,
            checkpoint_interval: Duration::from_secs(60),
            checkpoint_dir: None,
            integrity_check_pieces: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_block_size() {
        let mut conf = TorrentConf::new("/tmp");
        assert!(conf.validate(None).is_ok());

        conf.network.block_size = BLOCK_LEN * 2;
        assert!(conf.validate(None).is_err());

        conf.network.block_size = 0x3000;
        assert!(conf.validate(None).is_err(), "not a power of two");

        conf.network.block_size = 0x4000;
        // block size larger than the piece length is rejected
        assert!(conf.validate(Some(0x2000)).is_err());
        assert!(conf.validate(Some(0x4000)).is_ok());
    }

    #[test]
    fn test_validate_pipeline_and_endgame() {
        let mut conf = TorrentConf::new("/tmp");
        conf.network.pipeline_depth = 0;
        assert!(conf.validate(None).is_err());
        conf.network.pipeline_depth = 257;
        assert!(conf.validate(None).is_err());
        conf.network.pipeline_depth = 16;

        conf.strategy.endgame_threshold = 1.5;
        assert!(conf.validate(None).is_err());
        conf.strategy.endgame_threshold = 0.02;

        conf.strategy.endgame_duplicates = 0;
        assert!(conf.validate(None).is_err());
    }
}
