use std::{
    collections::HashMap,
    fs,
    sync::{
        self,
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use lru::LruCache;
use tokio::{sync::Semaphore, task};

use crate::{
    block_count,
    conf::DiskConf,
    disk::{
        error::*, BlockAdmission, CachedBlock, PieceCompletion, TorrentAlert,
        TorrentAlertSender,
    },
    metainfo::PieceHashes,
    peer,
    storage_info::{FsStructure, StorageInfo},
    BlockInfo, PieceIndex, BLOCK_LEN,
};

use super::file::TorrentFile;
use super::piece::{self, ExpectedHash, Piece};

/// How many whole pieces the per-torrent read cache holds. Each cache line
/// is a piece split into its 16 KiB wire blocks.
const READ_CACHE_PIECE_COUNT: usize = 64;

/// Torrent information related to disk IO.
///
/// Contains the in-progress pieces (i.e. the write buffer), metadata about
/// torrent's download and piece sizes, etc.
pub(super) struct Torrent {
    /// All information concerning this torrent's storage.
    info: StorageInfo,
    /// The in-progress piece downloads and disk writes. This is the
    /// torrent's disk write buffer. Each piece is mapped to its index for
    /// faster lookups.
    write_buf: HashMap<PieceIndex, Piece>,
    /// Contains the fields that are also accessed by the torrent's IO
    /// worker jobs, so that a single arc clone suffices when spawning one.
    thread_ctx: Arc<ThreadContext>,
    /// The expected piece hashes of the torrent.
    piece_hashes: PieceHashes,
    /// Bounds concurrently running hash/write jobs.
    hash_workers: Arc<Semaphore>,
    /// Bounds concurrently running read jobs.
    disk_workers: Arc<Semaphore>,
    /// Handles of jobs spawned since the last flush; a flush drains and
    /// awaits them, which is what makes verification precede visibility.
    jobs: Vec<task::JoinHandle<()>>,
}

/// Contains fields that are commonly accessed by torrent's IO worker jobs.
struct ThreadContext {
    /// The channel used to alert a torrent that a block has been written to
    /// disk and/or a piece was completed.
    chan: TorrentAlertSender,
    /// Caches whole pieces, split into their 16 KiB wire blocks, which is
    /// what remote peers request. On a miss the entire piece is read in,
    /// since a peer requesting one block of it will typically request the
    /// rest soon after.
    read_cache: Mutex<LruCache<PieceIndex, Vec<CachedBlock>>>,
    /// Handles of all files in torrent, opened in advance during torrent
    /// creation.
    ///
    /// A writer gets exclusive access to the file it needs; multiple
    /// readers may share one.
    files: Vec<sync::RwLock<TorrentFile>>,
    /// The write coalescing envelope: at most this many bytes go into one
    /// vectored write.
    write_batch_bytes: usize,
    /// Whether each write batch is fsynced as it lands.
    fsync_on_batch: bool,
    /// Various disk IO statistics, updated by the worker jobs themselves.
    stats: Stats,
}

#[derive(Default)]
struct Stats {
    /// The number of bytes successfully written to disk.
    write_count: AtomicU64,
    /// The number of times we failed to write to disk.
    write_failure_count: AtomicUsize,
    /// The number of bytes successfully read from disk.
    read_count: AtomicU64,
    /// The number of times we failed to read from disk.
    read_failure_count: AtomicUsize,
}

impl Torrent {
    /// Creates the file system structure of the torrent and opens the file
    /// handles.
    ///
    /// For a single file, there is a path validity check and then the file
    /// is opened. For multi-file torrents, if there are any subdirectories
    /// in the torrent archive, they are created and all files are opened.
    /// Existing files are left as they are, which is what makes resuming
    /// a checkpointed torrent work.
    pub fn new(
        info: StorageInfo,
        piece_hashes: PieceHashes,
        conf: DiskConf,
        torrent_chan: TorrentAlertSender,
    ) -> Result<Self, NewTorrentError> {
        if !info.download_dir.is_dir() {
            log::info!(
                "Creating missing download directory {:?}",
                info.download_dir
            );
            fs::create_dir_all(&info.download_dir)?;
        }

        let files = match &info.structure {
            FsStructure::File(file) => {
                log::debug!(
                    "Torrent is single {} bytes long file {:?}",
                    file.len,
                    file.path
                );
                vec![sync::RwLock::new(TorrentFile::new(
                    &info.download_dir,
                    file.clone(),
                    conf.preallocate,
                )?)]
            }
            FsStructure::Archive { files } => {
                debug_assert!(!files.is_empty());
                log::debug!("Torrent is multi file: {:?}", files);
                files
                    .iter()
                    .map(|file| {
                        Ok(sync::RwLock::new(TorrentFile::new(
                            &info.download_dir,
                            file.clone(),
                            conf.preallocate,
                        )?))
                    })
                    .collect::<Result<Vec<_>, NewTorrentError>>()?
            }
        };

        Ok(Self {
            info,
            write_buf: HashMap::new(),
            thread_ctx: Arc::new(ThreadContext {
                chan: torrent_chan,
                read_cache: Mutex::new(LruCache::new(READ_CACHE_PIECE_COUNT)),
                files,
                write_batch_bytes: conf.write_batch_bytes,
                fsync_on_batch: conf.fsync_on_batch,
                stats: Stats::default(),
            }),
            piece_hashes,
            hash_workers: Arc::new(Semaphore::new(conf.hash_workers.max(1))),
            disk_workers: Arc::new(Semaphore::new(conf.disk_workers.max(1))),
            jobs: Vec::new(),
        })
    }

    pub async fn write_block(
        &mut self,
        info: BlockInfo,
        data: Vec<u8>,
    ) -> Result<()> {
        log::trace!("Saving block {} to disk", info);

        let piece_index = info.piece_index;
        if !self.write_buf.contains_key(&piece_index) {
            if let Err(e) = self.start_new_piece(piece_index) {
                self.thread_ctx
                    .chan
                    .send(TorrentAlert::BlockRejected { info, error: e })?;
                // return with ok as the disk task itself shouldn't be
                // aborted due to invalid input
                return Ok(());
            }
        }
        let piece = self
            .write_buf
            .get_mut(&piece_index)
            .expect("newly inserted piece not present");

        match piece.enqueue_block(info.offset, data) {
            BlockAdmission::Accepted => {}
            BlockAdmission::Duplicate => return Ok(()),
            BlockAdmission::Rejected => {
                self.thread_ctx.chan.send(TorrentAlert::BlockRejected {
                    info,
                    error: WriteError::InvalidBlock,
                })?;
                return Ok(());
            }
        }

        // if the piece has all its blocks, hash it and, if valid, save it to
        // disk and clear its write buffer
        if piece.is_complete() {
            let piece = self.write_buf.remove(&piece_index).unwrap();

            log::debug!(
                "Piece {} is complete ({} bytes), flushing {} block(s) to disk",
                piece_index,
                piece.len,
                piece.blocks.len()
            );

            let torrent_piece_offset =
                self.info.torrent_piece_offset(piece_index);
            let ctx = Arc::clone(&self.thread_ctx);
            let permit = Arc::clone(&self.hash_workers).acquire_owned().await;

            // don't block the executor with the potentially expensive
            // hashing and sync file writing
            let job = task::spawn_blocking(move || {
                let _permit = permit;
                let is_valid = piece.matches_hash();

                if is_valid {
                    log::debug!(
                        "Piece {} is valid, writing to disk",
                        piece_index
                    );
                    match piece.write(
                        torrent_piece_offset,
                        &ctx.files,
                        ctx.write_batch_bytes,
                    ) {
                        Ok(write_count) => {
                            ctx.stats.write_count.fetch_add(
                                write_count as u64,
                                Ordering::Relaxed,
                            );
                            if ctx.fsync_on_batch {
                                for file_index in piece.file_range.clone() {
                                    let file = ctx.files[file_index]
                                        .read()
                                        .expect("file lock poisoned");
                                    if let Err(e) = file.sync() {
                                        log::error!(
                                            "Error syncing file: {}",
                                            e
                                        );
                                    }
                                }
                            }
                        }
                        Err(error) => {
                            log::error!(
                                "Error writing piece {} to disk: {}",
                                piece_index,
                                error
                            );
                            ctx.stats
                                .write_failure_count
                                .fetch_add(1, Ordering::Relaxed);
                            ctx.chan
                                .send(TorrentAlert::WriteFailure {
                                    index: piece_index,
                                    error,
                                })
                                .ok();
                            return;
                        }
                    }
                } else {
                    log::warn!("Piece {} is not valid", piece_index);
                }

                // alert torrent of piece completion and hash result; for
                // a valid piece this only happens after the write above, so
                // verification precedes visibility
                ctx.chan
                    .send(TorrentAlert::PieceCompletion(PieceCompletion {
                        index: piece_index,
                        is_valid,
                    }))
                    .ok();
            });
            self.jobs.push(job);
        }

        Ok(())
    }

    /// Starts a new in-progress piece, creating metadata for it in self.
    ///
    /// This involves getting the expected hash of the piece, its length, and
    /// calculating the files that it intersects.
    fn start_new_piece(
        &mut self,
        piece_index: PieceIndex,
    ) -> Result<(), WriteError> {
        log::trace!("Creating piece {} write buffer", piece_index);

        let expected_hash = self.expected_hash(piece_index)?;

        let len = self
            .info
            .piece_len(piece_index)
            .map_err(|_| WriteError::InvalidPieceIndex)?;
        log::debug!("Piece {} is {} bytes long", piece_index, len);

        let file_range = self
            .info
            .files_intersecting_piece(piece_index)
            .map_err(|_| WriteError::InvalidPieceIndex)?;
        log::debug!("Piece {} intersects files: {:?}", piece_index, file_range);

        let piece = Piece {
            expected_hash,
            len,
            blocks: Default::default(),
            file_range,
        };
        self.write_buf.insert(piece_index, piece);

        Ok(())
    }

    /// Looks up the expected hash of a piece.
    fn expected_hash(
        &self,
        piece_index: PieceIndex,
    ) -> Result<ExpectedHash, WriteError> {
        match &self.piece_hashes {
            PieceHashes::Sha1(hashes) => {
                let pos = piece_index * 20;
                if pos + 20 > hashes.len() {
                    log::error!("Piece index {} is invalid", piece_index);
                    return Err(WriteError::InvalidPieceIndex);
                }
                let mut expected = [0; 20];
                expected.copy_from_slice(&hashes[pos..pos + 20]);
                log::debug!(
                    "Piece {} expected hash {}",
                    piece_index,
                    hex::encode(&expected)
                );
                Ok(ExpectedHash::Sha1(expected))
            }
            PieceHashes::Sha256(roots) => {
                let root = *roots
                    .get(piece_index)
                    .ok_or(WriteError::InvalidPieceIndex)?;
                // the merkle leaf count comes from the nominal piece length,
                // so short trailing pieces pad with zero hashes
                let leaf_count =
                    (self.info.piece_len / BLOCK_LEN).max(1) as usize;
                Ok(ExpectedHash::Sha256 { root, leaf_count })
            }
        }
    }

    /// Returns the specified block via the sender, either from the write
    /// buffer, the read cache, or the disk.
    ///
    /// On a cache miss, the whole piece of the block is read in and cached.
    /// The rationale is that a peer requesting a block in piece will very
    /// likely request further blocks in the same piece.
    pub async fn read_block(
        &mut self,
        info: BlockInfo,
        result_chan: peer::Sender,
    ) -> Result<()> {
        log::trace!("Reading {} from disk", info);

        let piece_index = info.piece_index;

        // blocks of a piece that is still being assembled or verified are
        // served straight from the write buffer
        if let Some(piece) = self.write_buf.get(&piece_index) {
            if let Some(data) = piece.buffered_block(info.offset, info.len) {
                result_chan.send(peer::Command::Block { info, data }).ok();
                return Ok(());
            }
        }

        let piece_len = match self.info.piece_len(piece_index) {
            Ok(len) => len,
            Err(_) => {
                self.thread_ctx.chan.send(TorrentAlert::ReadError {
                    info,
                    error: ReadError::InvalidPieceIndex,
                })?;
                // the disk task itself mustn't be aborted due to bad input
                return Ok(());
            }
        };
        let block_index = info.index_in_piece();
        if info.offset % BLOCK_LEN != 0
            || block_index >= block_count(piece_len)
            || info.len > crate::block_len(piece_len, block_index)
        {
            self.thread_ctx.chan.send(TorrentAlert::ReadError {
                info,
                error: ReadError::InvalidBlockOffset,
            })?;
            return Ok(());
        }

        // check the read cache
        if let Some(blocks) = self
            .thread_ctx
            .read_cache
            .lock()
            .expect("read cache poisoned")
            .get(&piece_index)
        {
            log::debug!("Piece {} is in the read cache", piece_index);
            let data = cut_block(&blocks[block_index], info.len);
            result_chan.send(peer::Command::Block { info, data }).ok();
            return Ok(());
        }

        // otherwise read in the whole piece from disk on a worker
        log::debug!(
            "Piece {} not in the read cache, reading from disk",
            piece_index
        );
        let file_range = match self.info.files_intersecting_piece(piece_index)
        {
            Ok(file_range) => file_range,
            Err(_) => {
                self.thread_ctx.chan.send(TorrentAlert::ReadError {
                    info,
                    error: ReadError::InvalidPieceIndex,
                })?;
                return Ok(());
            }
        };

        let torrent_piece_offset = self.info.torrent_piece_offset(piece_index);
        let ctx = Arc::clone(&self.thread_ctx);
        let permit = Arc::clone(&self.disk_workers).acquire_owned().await;
        let job = task::spawn_blocking(move || {
            let _permit = permit;
            match piece::read(
                torrent_piece_offset,
                file_range,
                &ctx.files,
                piece_len,
            ) {
                Ok(blocks) => {
                    log::debug!("Read piece {}", piece_index);
                    let data = cut_block(&blocks[block_index], info.len);

                    // Place piece in the read cache. Another concurrent read
                    // could have read the piece just before this job, but
                    // replacing it is harmless as the data is the same.
                    ctx.read_cache
                        .lock()
                        .expect("read cache poisoned")
                        .put(piece_index, blocks);
                    ctx.stats
                        .read_count
                        .fetch_add(piece_len as u64, Ordering::Relaxed);

                    result_chan.send(peer::Command::Block { info, data }).ok();
                }
                Err(error) => {
                    log::error!(
                        "Error reading piece {} from disk: {}",
                        piece_index,
                        error
                    );
                    ctx.stats
                        .read_failure_count
                        .fetch_add(1, Ordering::Relaxed);
                    ctx.chan
                        .send(TorrentAlert::ReadError { info, error })
                        .ok();
                }
            }
        });
        self.jobs.push(job);

        Ok(())
    }

    /// Waits out every job spawned since the last flush, then syncs all
    /// files. When this returns, every verified piece reported so far is
    /// durable.
    pub async fn flush(&mut self) -> Result<()> {
        log::debug!("Flushing torrent to disk");
        for job in self.jobs.drain(..) {
            job.await.ok();
        }
        let ctx = Arc::clone(&self.thread_ctx);
        task::spawn_blocking(move || {
            for file in ctx.files.iter() {
                let file = file.read().expect("file lock poisoned");
                file.sync()?;
            }
            Ok::<(), std::io::Error>(())
        })
        .await
        .map_err(|_| Error::Channel)?
        .map_err(Error::from)
    }

    /// Re-reads the given pieces from disk and checks them against their
    /// expected hashes. Used for the resume spot-check; pieces that cannot
    /// be read count as failed.
    pub async fn verify_pieces(
        &mut self,
        pieces: Vec<PieceIndex>,
    ) -> Vec<(PieceIndex, bool)> {
        let mut work = Vec::with_capacity(pieces.len());
        for index in pieces {
            let expected = self.expected_hash(index);
            let piece_len = self.info.piece_len(index);
            let file_range = self.info.files_intersecting_piece(index);
            let offset = self.info.torrent_piece_offset(index);
            match (expected, piece_len, file_range) {
                (Ok(expected), Ok(piece_len), Ok(file_range)) => {
                    work.push((index, expected, piece_len, file_range, offset))
                }
                _ => work.push((index, ExpectedHash::Sha1([0; 20]), 0, 0..0, 0)),
            }
        }

        let ctx = Arc::clone(&self.thread_ctx);
        task::spawn_blocking(move || {
            work.into_iter()
                .map(|(index, expected, piece_len, file_range, offset)| {
                    if piece_len == 0 {
                        return (index, false);
                    }
                    let blocks = match piece::read(
                        offset,
                        file_range.clone(),
                        &ctx.files,
                        piece_len,
                    ) {
                        Ok(blocks) => blocks,
                        Err(_) => return (index, false),
                    };
                    let piece = Piece {
                        expected_hash: expected,
                        len: piece_len,
                        blocks: blocks
                            .iter()
                            .enumerate()
                            .map(|(i, b)| {
                                (i as u32 * BLOCK_LEN, b.as_ref().clone())
                            })
                            .collect(),
                        file_range,
                    };
                    (index, piece.matches_hash())
                })
                .collect()
        })
        .await
        .unwrap_or_default()
    }
}

/// Returns the first `len` bytes of the cached block as an owned vector.
fn cut_block(block: &CachedBlock, len: u32) -> Vec<u8> {
    block[..(len as usize).min(block.len())].to_vec()
}
