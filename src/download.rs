//! Block level bookkeeping of an in-progress piece download.
//!
//! A [`PieceDownload`] is shared by all peer sessions downloading blocks of
//! the same piece, so that a piece abandoned by one peer (choke, disconnect,
//! timeout) is continued by another instead of being restarted, and so that
//! endgame mode can hand the same block to several peers at once.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::{BlockInfo, PieceIndex};

/// The state of a single block within a piece download.
#[derive(Clone, Debug)]
enum BlockState {
    /// No request is outstanding for the block.
    Free,
    /// The block has been requested from the listed peers (more than one
    /// only during endgame). The instant is that of the first request, used
    /// for the request timeout.
    Requested {
        peers: Vec<SocketAddr>,
        since: Instant,
    },
    /// The block has arrived and been handed to the disk layer.
    Received,
}

/// The outcome of registering a received block.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum BlockReceipt {
    /// First copy of the block; the listed peers still have duplicate
    /// requests outstanding and should be sent CANCELs.
    Accepted { duplicate_requests: Vec<SocketAddr> },
    /// The block had already been received (the losing copy of an endgame
    /// duplicate, or a peer re-sending data).
    Duplicate,
    /// The offset/length don't address a block of this piece.
    Invalid,
}

pub(crate) struct PieceDownload {
    /// The index of the piece that is downloaded.
    index: PieceIndex,
    /// The length of the piece in bytes.
    len: u32,
    /// The request granularity. All blocks but the last are this long.
    block_size: u32,
    /// The state of each block in the piece.
    blocks: Vec<BlockState>,
}

impl PieceDownload {
    pub fn new(index: PieceIndex, len: u32, block_size: u32) -> Self {
        debug_assert!(block_size > 0);
        let block_count =
            (len as usize + block_size as usize - 1) / block_size as usize;
        Self {
            index,
            len,
            block_size,
            blocks: vec![BlockState::Free; block_count],
        }
    }

    /// Returns the block info of the block at the given index in piece.
    fn block_info(&self, block_index: usize) -> BlockInfo {
        let offset = block_index as u32 * self.block_size;
        debug_assert!(offset < self.len);
        BlockInfo {
            piece_index: self.index,
            offset,
            len: (self.len - offset).min(self.block_size),
        }
    }

    /// Returns the index of the block at the given offset, if the offset is
    /// block aligned and within the piece.
    fn block_index(&self, offset: u32) -> Option<usize> {
        if offset % self.block_size != 0 {
            return None;
        }
        let index = (offset / self.block_size) as usize;
        if index < self.blocks.len() {
            Some(index)
        } else {
            None
        }
    }

    /// Picks at most `count` blocks for the peer and appends them to `buf`.
    ///
    /// Free blocks are always picked first. In endgame mode blocks already
    /// requested from other peers are picked too, up to `endgame_duplicates`
    /// concurrent requests per block, never twice for the same peer.
    ///
    /// Returns the number of blocks picked.
    pub fn pick_blocks(
        &mut self,
        count: usize,
        peer: SocketAddr,
        endgame: bool,
        endgame_duplicates: usize,
        buf: &mut Vec<BlockInfo>,
    ) -> usize {
        let mut picked = 0;
        for block_index in 0..self.blocks.len() {
            if picked == count {
                break;
            }
            if matches!(self.blocks[block_index], BlockState::Free) {
                self.blocks[block_index] = BlockState::Requested {
                    peers: vec![peer],
                    since: Instant::now(),
                };
            } else {
                let joined = match &mut self.blocks[block_index] {
                    BlockState::Requested { peers, .. }
                        if endgame
                            && peers.len() < endgame_duplicates
                            && !peers.contains(&peer) =>
                    {
                        peers.push(peer);
                        true
                    }
                    _ => false,
                };
                if !joined {
                    continue;
                }
            }
            buf.push(self.block_info(block_index));
            picked += 1;
        }
        picked
    }

    /// Registers a received block.
    pub fn received_block(&mut self, block: &BlockInfo) -> BlockReceipt {
        debug_assert_eq!(block.piece_index, self.index);
        let block_index = match self.block_index(block.offset) {
            Some(index) if self.block_info(index).len == block.len => index,
            _ => return BlockReceipt::Invalid,
        };
        match std::mem::replace(
            &mut self.blocks[block_index],
            BlockState::Received,
        ) {
            BlockState::Requested { peers, .. } => BlockReceipt::Accepted {
                duplicate_requests: peers,
            },
            BlockState::Free => {
                // a block we never asked this download for (e.g. freed by
                // a timeout just before arriving); accept it anyway
                BlockReceipt::Accepted {
                    duplicate_requests: Vec::new(),
                }
            }
            BlockState::Received => {
                self.blocks[block_index] = BlockState::Received;
                BlockReceipt::Duplicate
            }
        }
    }

    /// Releases all of the peer's outstanding requests in this download,
    /// making the affected blocks pickable again. Called when a peer chokes
    /// us, disconnects, or its session shuts down.
    ///
    /// Returns how many blocks were freed.
    pub fn free_blocks_of(&mut self, peer: &SocketAddr) -> usize {
        let mut freed = 0;
        for block in self.blocks.iter_mut() {
            if let BlockState::Requested { peers, .. } = block {
                if let Some(pos) = peers.iter().position(|p| p == peer) {
                    peers.remove(pos);
                    if peers.is_empty() {
                        *block = BlockState::Free;
                        freed += 1;
                    }
                }
            }
        }
        freed
    }

    /// Releases the peer's requests that have been outstanding for longer
    /// than the timeout, returning the lapsed block infos so the session
    /// can clear its pipeline and report the lapse.
    pub fn free_timed_out_blocks_of(
        &mut self,
        peer: &SocketAddr,
        timeout: Duration,
        now: Instant,
    ) -> Vec<BlockInfo> {
        let mut lapsed = Vec::new();
        for block_index in 0..self.blocks.len() {
            let expired = match &self.blocks[block_index] {
                BlockState::Requested { peers, since } => {
                    peers.contains(peer)
                        && now.saturating_duration_since(*since) >= timeout
                }
                _ => false,
            };
            if expired {
                lapsed.push(self.block_info(block_index));
                let now_free = match &mut self.blocks[block_index] {
                    BlockState::Requested { peers, .. } => {
                        peers.retain(|p| p != peer);
                        peers.is_empty()
                    }
                    _ => false,
                };
                if now_free {
                    self.blocks[block_index] = BlockState::Free;
                }
            }
        }
        lapsed
    }

    /// Returns true if all blocks of the piece have been received.
    pub fn is_complete(&self) -> bool {
        self.count_missing_blocks() == 0
    }

    /// Returns the number of blocks not yet received.
    pub fn count_missing_blocks(&self) -> usize {
        self.blocks
            .iter()
            .filter(|b| !matches!(b, BlockState::Received))
            .count()
    }

    /// Returns whether the download has any block a new request could be
    /// issued for.
    pub fn has_pickable_blocks(
        &self,
        peer: &SocketAddr,
        endgame: bool,
        endgame_duplicates: usize,
    ) -> bool {
        self.blocks.iter().any(|b| match b {
            BlockState::Free => true,
            BlockState::Requested { peers, .. } => {
                endgame
                    && peers.len() < endgame_duplicates
                    && !peers.contains(peer)
            }
            BlockState::Received => false,
        })
    }
}
