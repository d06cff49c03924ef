pub(crate) mod error;
mod io;

use std::sync::Arc;

use tokio::{
    sync::{
        mpsc::{UnboundedReceiver, UnboundedSender},
        oneshot,
    },
    task,
};

use crate::{
    conf::DiskConf,
    metainfo::PieceHashes,
    peer,
    storage_info::StorageInfo,
    BlockInfo, PieceIndex, TorrentId,
};
use error::*;
use io::Disk;

/// A whole piece kept in memory, as a list of 16 KiB blocks, which is what
/// peers request. Blocks are shared with the read cache without copying.
pub(crate) type CachedBlock = Arc<Vec<u8>>;

/// Spawns a disk IO task and returns a tuple with the task join handle, the
/// disk handle used for sending commands, and a channel for receiving
/// command results and other notifications.
pub(crate) fn spawn(
) -> Result<(task::JoinHandle<Result<()>>, DiskHandle, AlertReceiver)> {
    log::info!("Spawning disk IO task");
    let (mut disk, cmd_chan, alert_port) = Disk::new()?;
    // spawn disk event loop on a new task
    let join_handle = task::spawn(async move { disk.start().await });
    log::info!("Spawned disk IO task");

    Ok((join_handle, DiskHandle(cmd_chan), alert_port))
}

/// The handle for the disk task, used to execute disk IO related tasks.
///
/// The handle may be copied an arbitrary number of times. It is an
/// abstraction over the means to communicate with the disk IO task. For now,
/// mpsc channels are used for issuing commands and receiving results, but
/// this may well change later on, hence hiding this behind this handle type.
#[derive(Clone)]
pub(crate) struct DiskHandle(CommandSender);

impl DiskHandle {
    /// Instructs the disk task to set up everything needed for a new
    /// torrent, which includes opening (and, depending on the preallocation
    /// policy, allocating) the to-be-downloaded files.
    pub fn allocate_new_torrent(
        &self,
        id: TorrentId,
        storage: StorageInfo,
        piece_hashes: PieceHashes,
        conf: DiskConf,
        torrent_chan: TorrentAlertSender,
    ) -> Result<()> {
        log::trace!("Allocating new torrent {}", id);
        self.0
            .send(Command::NewTorrent {
                id,
                storage,
                piece_hashes,
                conf,
                torrent_chan,
            })
            .map_err(Error::from)
    }

    /// Queues a block for eventual writing to disk.
    ///
    /// Once its piece completes and is verified, the result is advertised on
    /// the torrent's alert channel.
    pub fn write_block(
        &self,
        id: TorrentId,
        info: BlockInfo,
        data: Vec<u8>,
    ) -> Result<()> {
        log::trace!("Saving block {} to disk", info);
        self.0
            .send(Command::WriteBlock { id, info, data })
            .map_err(Error::from)
    }

    /// Asks the disk task to return the block via the given peer channel,
    /// from the write buffer, the read cache, or the disk.
    pub fn read_block(
        &self,
        id: TorrentId,
        info: BlockInfo,
        result_chan: peer::Sender,
    ) -> Result<()> {
        log::trace!("Reading block {} from disk", info);
        self.0
            .send(Command::ReadBlock {
                id,
                info,
                result_chan,
            })
            .map_err(Error::from)
    }

    /// Blocks until every verified piece accepted so far is durably written
    /// and the touched files are synced. Called before checkpoint saves.
    pub async fn flush(&self, id: TorrentId) -> Result<()> {
        let (chan, port) = oneshot::channel();
        self.0
            .send(Command::Flush { id, chan })
            .map_err(Error::from)?;
        port.await.map_err(|_| Error::Channel)?
    }

    /// Re-reads the given pieces from disk and verifies their hashes.
    /// Used by the resume spot-check.
    pub async fn verify_pieces(
        &self,
        id: TorrentId,
        pieces: Vec<PieceIndex>,
    ) -> Result<Vec<(PieceIndex, bool)>> {
        let (chan, port) = oneshot::channel();
        self.0
            .send(Command::VerifyPieces { id, pieces, chan })
            .map_err(Error::from)?;
        port.await.map_err(|_| Error::Channel)
    }

    /// Removes the torrent from the disk task, closing its files.
    pub fn tear_down_torrent(&self, id: TorrentId) -> Result<()> {
        log::trace!("Tearing down torrent {} disk state", id);
        self.0.send(Command::TearDown { id }).map_err(Error::from)
    }

    /// Shuts down the disk IO task.
    pub fn shutdown(&self) -> Result<()> {
        log::trace!("Shutting down disk IO task");
        self.0.send(Command::Shutdown).map_err(Error::from)
    }
}

/// The channel for sending commands to the disk task.
type CommandSender = UnboundedSender<Command>;
/// The channel the disk task uses to listen for commands.
type CommandReceiver = UnboundedReceiver<Command>;

/// The type of commands that the disk can execute.
enum Command {
    // Allocate a new torrent.
    NewTorrent {
        id: TorrentId,
        storage: StorageInfo,
        piece_hashes: PieceHashes,
        conf: DiskConf,
        torrent_chan: TorrentAlertSender,
    },
    // Request to eventually write a block to disk.
    WriteBlock {
        id: TorrentId,
        info: BlockInfo,
        data: Vec<u8>,
    },
    // Request to eventually serve a block to a peer session.
    ReadBlock {
        id: TorrentId,
        info: BlockInfo,
        result_chan: peer::Sender,
    },
    // Wait for in-flight writes and sync files.
    Flush {
        id: TorrentId,
        chan: oneshot::Sender<Result<()>>,
    },
    // Re-hash the given pieces from disk.
    VerifyPieces {
        id: TorrentId,
        pieces: Vec<PieceIndex>,
        chan: oneshot::Sender<Vec<(PieceIndex, bool)>>,
    },
    // Drop a torrent's disk state.
    TearDown {
        id: TorrentId,
    },
    // Eventually shut down the disk task.
    Shutdown,
}

/// The type of channel used to alert the engine about global events.
type AlertSender = UnboundedSender<Alert>;
/// The channel on which the engine can listen for global disk events.
pub(crate) type AlertReceiver = UnboundedReceiver<Alert>;

/// The alerts that the disk task may send about global events (i.e. events
/// not related to individual torrents).
#[derive(Debug)]
pub(crate) enum Alert {
    /// Torrent allocation result. If successful, the id of the allocated
    /// torrent is returned for identification, if not, the reason of the
    /// error is included.
    TorrentAllocation {
        id: TorrentId,
        result: Result<(), NewTorrentError>,
    },
}

/// The type of channel used to alert a torrent about its disk events.
pub(crate) type TorrentAlertSender = UnboundedSender<TorrentAlert>;
/// The type of channel on which a torrent listens for its disk events.
pub(crate) type TorrentAlertReceiver = UnboundedReceiver<TorrentAlert>;

/// The alerts that the disk task may send about events related to a specific
/// torrent.
#[derive(Debug)]
pub(crate) enum TorrentAlert {
    /// The result of setting up the torrent's files on disk. An error here
    /// is fatal to the torrent.
    Allocation(Result<(), String>),
    /// A piece had all its blocks, was hashed, and, if valid, written to
    /// disk. Sent after the write is done, so a valid piece is durable by
    /// the time the torrent observes this.
    PieceCompletion(PieceCompletion),
    /// A piece passed verification but could not be written. The assembled
    /// piece is discarded, so the torrent must requeue it.
    WriteFailure {
        index: PieceIndex,
        error: WriteError,
    },
    /// A block could not be admitted into its piece's write buffer.
    BlockRejected {
        info: BlockInfo,
        error: WriteError,
    },
    /// A block read wasn't served.
    ReadError {
        info: BlockInfo,
        error: ReadError,
    },
}

/// The result of completing a piece.
#[derive(Debug)]
pub(crate) struct PieceCompletion {
    pub index: PieceIndex,
    /// Whether the piece's contents match its expected hash. An invalid
    /// piece is discarded without touching the disk.
    pub is_valid: bool,
}

/// The outcome of admitting a single block into a piece write buffer.
#[derive(Debug, PartialEq)]
pub(crate) enum BlockAdmission {
    /// The block was buffered.
    Accepted,
    /// An identical block was already buffered; the copy is dropped.
    Duplicate,
    /// The block doesn't fit the piece (bad geometry or overlapping a
    /// previously accepted block of a different shape).
    Rejected,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        block_count, block_len,
        conf::DiskConf,
        storage_info::{FileInfo, FsStructure, StorageInfo},
        BLOCK_LEN,
    };
    use sha1::{Digest, Sha1};
    use std::{fs, path::PathBuf, time::Duration};
    use tokio::time;

    // The disk IO test environment containing information of a valid
    // torrent: three pieces, the last one shorter than the rest.
    struct Env {
        id: TorrentId,
        pieces: Vec<Vec<u8>>,
        piece_hashes: PieceHashes,
        storage: StorageInfo,
        _dir: tempfile::TempDir,
    }

    impl Env {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let piece_len: u32 = 2 * BLOCK_LEN;
            // last piece is slightly shorter to test that it is handled
            // correctly
            let last_piece_len: u32 = piece_len - 935;
            let pieces: Vec<Vec<u8>> = vec![
                (0..piece_len).map(|b| (b % 256) as u8).collect(),
                (0..piece_len).map(|b| ((b + 1) % 256) as u8).collect(),
                (0..last_piece_len).map(|b| ((b + 2) % 256) as u8).collect(),
            ];
            // build up expected piece hashes
            let mut piece_hashes = Vec::with_capacity(pieces.len() * 20);
            for piece in pieces.iter() {
                let hash: [u8; 20] = Sha1::digest(piece).into();
                piece_hashes.extend_from_slice(&hash);
            }
            assert_eq!(piece_hashes.len(), pieces.len() * 20);

            let download_len: u64 =
                pieces.iter().map(|piece| piece.len() as u64).sum();
            let storage = StorageInfo {
                piece_count: pieces.len(),
                piece_len,
                last_piece_len,
                download_len,
                download_dir: dir.path().to_path_buf(),
                structure: FsStructure::File(FileInfo {
                    path: PathBuf::from("torrent0"),
                    len: download_len,
                    torrent_offset: 0,
                    executable: false,
                }),
            };

            Self {
                id: 0,
                pieces,
                piece_hashes: PieceHashes::Sha1(piece_hashes),
                storage,
                _dir: dir,
            }
        }

        async fn allocate(
            &self,
            disk: &DiskHandle,
        ) -> TorrentAlertReceiver {
            let (chan, mut port) = tokio::sync::mpsc::unbounded_channel();
            // no preallocation, so file length reflects what was written
            let conf = DiskConf {
                preallocate: crate::conf::Preallocation::None,
                ..DiskConf::default()
            };
            disk.allocate_new_torrent(
                self.id,
                self.storage.clone(),
                self.piece_hashes.clone(),
                conf,
                chan,
            )
            .unwrap();
            match port.recv().await {
                Some(TorrentAlert::Allocation(Ok(()))) => {}
                alert => panic!("unexpected alert: {:?}", alert),
            }
            port
        }
    }

    // Calls the provided function for each block in piece, passing it the
    // block's `BlockInfo`.
    fn for_each_block(
        piece_index: usize,
        piece_len: u32,
        mut block_visitor: impl FnMut(BlockInfo),
    ) {
        let mut block_offset = 0;
        for index in 0..block_count(piece_len) {
            let len = block_len(piece_len, index);
            block_visitor(BlockInfo {
                piece_index,
                offset: block_offset,
                len,
            });
            block_offset += len;
        }
    }

    // Tests writing of a complete valid torrent's pieces and verifying
    // that completion alerts arrive and the file contents land on disk.
    #[tokio::test(threaded_scheduler)]
    async fn test_write_all_pieces() {
        let (_, disk, _alert_port) = spawn().unwrap();
        let env = Env::new();
        let mut port = env.allocate(&disk).await;

        for (index, piece) in env.pieces.iter().enumerate() {
            for_each_block(index, piece.len() as u32, |info| {
                let block_end = (info.offset + info.len) as usize;
                let data = piece[info.offset as usize..block_end].to_vec();
                disk.write_block(env.id, info, data).unwrap();
            });

            match port.recv().await {
                Some(TorrentAlert::PieceCompletion(completion)) => {
                    assert_eq!(completion.index, index);
                    assert!(completion.is_valid);
                }
                alert => panic!("unexpected alert: {:?}", alert),
            }
        }

        disk.flush(env.id).await.unwrap();

        // the file is the exact concatenation of the pieces
        let expected: Vec<u8> =
            env.pieces.iter().flatten().copied().collect();
        let written =
            fs::read(env.storage.download_dir.join("torrent0")).unwrap();
        assert_eq!(written, expected);
    }

    // Tests writing of an invalid piece: it must be reported as such and
    // must not touch the file.
    #[tokio::test(threaded_scheduler)]
    async fn test_write_invalid_piece() {
        let (_, disk, _alert_port) = spawn().unwrap();
        let env = Env::new();
        let mut port = env.allocate(&disk).await;

        let index = 0;
        let invalid_piece: Vec<u8> = env.pieces[index]
            .iter()
            .map(|b| b.wrapping_add(5))
            .collect();
        for_each_block(index, invalid_piece.len() as u32, |info| {
            let block_end = (info.offset + info.len) as usize;
            let data =
                invalid_piece[info.offset as usize..block_end].to_vec();
            disk.write_block(env.id, info, data).unwrap();
        });

        match port.recv().await {
            Some(TorrentAlert::PieceCompletion(completion)) => {
                assert_eq!(completion.index, index);
                assert!(!completion.is_valid);
            }
            alert => panic!("unexpected alert: {:?}", alert),
        }

        // an invalid piece is discarded without writing
        disk.flush(env.id).await.unwrap();
        let file = env.storage.download_dir.join("torrent0");
        assert_eq!(fs::metadata(&file).unwrap().len(), 0);
    }

    // Tests that a write failure is reported with the index of the piece
    // it lost, by writing into /dev/full: opens succeed there but every
    // write fails with ENOSPC.
    #[cfg(target_os = "linux")]
    #[tokio::test(threaded_scheduler)]
    async fn test_write_failure_is_attributed_to_piece() {
        let (_, disk, _alert_port) = spawn().unwrap();

        let piece_len = 2 * BLOCK_LEN;
        let piece: Vec<u8> = (0..piece_len).map(|b| (b % 256) as u8).collect();
        let hash: [u8; 20] = Sha1::digest(&piece).into();
        let storage = StorageInfo {
            piece_count: 1,
            piece_len,
            last_piece_len: piece_len,
            download_len: piece_len as u64,
            download_dir: PathBuf::from("/dev"),
            structure: FsStructure::File(FileInfo {
                path: PathBuf::from("full"),
                len: piece_len as u64,
                torrent_offset: 0,
                executable: false,
            }),
        };

        let (chan, mut port) = tokio::sync::mpsc::unbounded_channel();
        let conf = DiskConf {
            preallocate: crate::conf::Preallocation::None,
            ..DiskConf::default()
        };
        disk.allocate_new_torrent(
            1,
            storage,
            PieceHashes::Sha1(hash.to_vec()),
            conf,
            chan,
        )
        .unwrap();
        match port.recv().await {
            Some(TorrentAlert::Allocation(Ok(()))) => {}
            alert => panic!("unexpected alert: {:?}", alert),
        }

        for_each_block(0, piece_len, |info| {
            let block_end = (info.offset + info.len) as usize;
            disk.write_block(
                1,
                info,
                piece[info.offset as usize..block_end].to_vec(),
            )
            .unwrap();
        });

        // the piece hashes correctly but the write fails, and the failure
        // names the piece so the torrent can requeue it
        let alert = time::timeout(Duration::from_secs(10), port.recv())
            .await
            .expect("timed out waiting for write failure");
        match alert {
            Some(TorrentAlert::WriteFailure { index, .. }) => {
                assert_eq!(index, 0);
            }
            alert => panic!("unexpected alert: {:?}", alert),
        }
    }

    // Tests that a written block can be served back through a peer
    // channel, exercising the read cache path.
    #[tokio::test(threaded_scheduler)]
    async fn test_read_block_round_trip() {
        let (_, disk, _alert_port) = spawn().unwrap();
        let env = Env::new();
        let mut port = env.allocate(&disk).await;

        // write the first piece and wait for it to be verified
        let piece = &env.pieces[0];
        for_each_block(0, piece.len() as u32, |info| {
            let block_end = (info.offset + info.len) as usize;
            let data = piece[info.offset as usize..block_end].to_vec();
            disk.write_block(env.id, info, data).unwrap();
        });
        match port.recv().await {
            Some(TorrentAlert::PieceCompletion(completion)) => {
                assert!(completion.is_valid)
            }
            alert => panic!("unexpected alert: {:?}", alert),
        }
        disk.flush(env.id).await.unwrap();

        // ask for the second block of the piece back
        let (chan, mut peer_port) = tokio::sync::mpsc::unbounded_channel();
        let info = BlockInfo {
            piece_index: 0,
            offset: BLOCK_LEN,
            len: BLOCK_LEN,
        };
        disk.read_block(env.id, info, chan).unwrap();

        let served = time::timeout(Duration::from_secs(10), peer_port.recv())
            .await
            .expect("timed out waiting for block read")
            .expect("peer channel closed");
        match served {
            crate::peer::Command::Block { info: served, data } => {
                assert_eq!(served, info);
                assert_eq!(
                    data,
                    piece[BLOCK_LEN as usize..2 * BLOCK_LEN as usize]
                );
            }
            _ => panic!("unexpected peer command"),
        }
    }
}
