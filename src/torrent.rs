//! The torrent controller: composes the piece picker, the shared piece
//! downloads, the disk task, the metadata exchange, and the peer sessions
//! into one running torrent, and exposes the per-torrent operations and
//! event stream.
//!
//! The controller is a task. Peer sessions are child tasks communicating
//! with it over channels; they never dereference the controller directly.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    net::SocketAddr,
    path::PathBuf,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use futures::{select, StreamExt};
use rand::seq::IteratorRandom;
use tokio::{
    net::TcpStream,
    sync::{
        broadcast,
        mpsc::{self, UnboundedReceiver, UnboundedSender},
        oneshot, RwLock,
    },
    task, time,
};

use crate::{
    checkpoint::{Checkpoint, CheckpointStore, CHECKPOINT_VERSION},
    conf::TorrentConf,
    counter::ThruputCounters,
    disk::{DiskHandle, PieceCompletion, TorrentAlert, TorrentAlertReceiver},
    download::PieceDownload,
    engine::IpFilter,
    error::*,
    magnet::{self, MagnetInfo},
    metadata::MetadataExchange,
    metainfo::Metainfo,
    peer::{self, PeerSession},
    piece_picker::PiecePicker,
    rate_limiter::RateLimiter,
    storage_info::{FilePriority, FileSelection, StorageInfo},
    Bitfield, BlockInfo, FileIndex, InfoHash, PeerId, PieceIndex, TorrentId,
};

/// How many peers the upload choker unchokes by download (or, when
/// seeding, upload) rate, not counting the optimistic slot.
const UNCHOKE_SLOTS: usize = 4;

/// The reliability score at which a peer is banned and disconnected.
const PEER_BAN_THRESHOLD: u32 = 8;

/// Points added to a peer's reliability score for a lapsed request.
const TIMEOUT_PENALTY: u32 = 1;

/// Points added for contributing to a piece that failed verification.
const HASH_FAIL_PENALTY: u32 = 2;

/// If one piece fails verification twice within this window, the peers
/// whose blocks intersect both failures are banned outright.
const HASH_FAIL_WINDOW: Duration = Duration::from_secs(5 * 60);

/// How long a failed endpoint is kept in the dial cool-down.
const DIAL_COOLDOWN: Duration = Duration::from_secs(60);

/// How long a metadata exchange request may stay outstanding before it is
/// retried through another peer.
const METADATA_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Where a candidate peer endpoint came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerOrigin {
    Tracker,
    Dht,
    Pex,
    Magnet,
    Manual,
}

/// The lifecycle state of a torrent.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TorrentState {
    /// Waiting for metadata (magnet bootstrap) or file allocation.
    Initializing,
    /// At least one selected piece is not yet verified.
    Downloading,
    /// Every selected piece is verified; uploads only.
    Seeding,
    /// Peers are dropped but metadata, bitfield, and files are untouched.
    Paused,
    /// The torrent was removed from the engine.
    Stopped,
}

/// The events a torrent emits on its subscription channel.
#[derive(Clone, Debug)]
pub enum Event {
    PeerConnected { addr: SocketAddr },
    PeerDisconnected { addr: SocketAddr, reason: String },
    PieceVerified { index: PieceIndex },
    PieceHashFailed {
        index: PieceIndex,
        contributing_peers: Vec<SocketAddr>,
    },
    MetadataReceived,
    TorrentCompleted,
    CheckpointSaved,
}

/// A point in time snapshot of a torrent, as returned by `status()`.
#[derive(Clone, Debug)]
pub struct TorrentStatus {
    pub state: TorrentState,
    pub name: String,
    pub info_hash: InfoHash,
    pub piece_count: usize,
    pub verified_piece_count: usize,
    pub downloaded: u64,
    pub uploaded: u64,
    /// Rolling average download rate, bytes per second.
    pub download_rate: u64,
    /// Rolling average upload rate, bytes per second.
    pub upload_rate: u64,
    /// The highest one second download throughput seen.
    pub peak_download_rate: u64,
    pub connected_peer_count: usize,
    /// The most recent torrent level error, if the torrent cannot make
    /// progress.
    pub last_error: Option<String>,
}

/// What a torrent is started from.
pub enum TorrentSource {
    Metainfo(Metainfo),
    Magnet(MagnetInfo),
}

impl TorrentSource {
    pub fn info_hash(&self) -> InfoHash {
        match self {
            Self::Metainfo(metainfo) => metainfo.info_hash,
            Self::Magnet(magnet) => magnet.info_hash,
        }
    }
}

/// Parameters of a new torrent.
pub struct TorrentParams {
    pub source: TorrentSource,
    /// Overrides the engine's default torrent configuration.
    pub conf: Option<TorrentConf>,
    /// The path of the original `.torrent` file, recorded in checkpoints.
    pub torrent_file: Option<PathBuf>,
    /// Explicit resume state. When `None` and checkpoints are enabled, the
    /// engine loads it from the checkpoint store.
    pub resume: Option<Checkpoint>,
}

/// The handle through which a torrent is driven after creation. May be
/// cloned freely.
#[derive(Clone)]
pub struct TorrentHandle {
    id: TorrentId,
    info_hash: InfoHash,
    cmd_chan: Sender,
    events: broadcast::Sender<Event>,
}

impl TorrentHandle {
    pub fn id(&self) -> TorrentId {
        self.id
    }

    pub fn info_hash(&self) -> InfoHash {
        self.info_hash
    }

    /// Subscribes to the torrent's event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    /// Hands the torrent a batch of candidate peer endpoints. This is the
    /// sole channel through which trackers, DHT, PEX, and the user feed
    /// the torrent peers.
    pub fn add_peers(
        &self,
        peers: Vec<SocketAddr>,
        origin: PeerOrigin,
    ) -> Result<()> {
        self.cmd_chan
            .send(Command::AddPeers { peers, origin })
            .map_err(Error::from)
    }

    /// Hands the torrent a connection accepted by the host application's
    /// listener.
    pub fn add_inbound_peer(&self, socket: TcpStream) -> Result<()> {
        self.cmd_chan
            .send(Command::AddInbound { socket })
            .map_err(Error::from)
    }

    /// Drops all peer connections but keeps metadata, bitfield, and files.
    pub fn pause(&self) -> Result<()> {
        self.cmd_chan.send(Command::Pause).map_err(Error::from)
    }

    /// Reconnects peers after a pause.
    pub fn resume(&self) -> Result<()> {
        self.cmd_chan.send(Command::Resume).map_err(Error::from)
    }

    /// Updates the per-file download priorities. In-flight requests for
    /// pieces that are no longer wanted are dropped.
    pub fn set_file_priorities(
        &self,
        priorities: Vec<(FileIndex, FilePriority)>,
    ) -> Result<()> {
        self.cmd_chan
            .send(Command::SetFilePriorities { priorities })
            .map_err(Error::from)
    }

    /// Returns a snapshot of the torrent's state.
    pub async fn status(&self) -> Result<TorrentStatus> {
        let (chan, port) = oneshot::channel();
        self.cmd_chan
            .send(Command::Status { chan })
            .map_err(Error::from)?;
        port.await.map_err(|_| Error::Channel)
    }

    /// Synchronously saves a resume checkpoint: flushes the disk first so
    /// the saved bitfield only covers durable pieces.
    pub async fn checkpoint(&self) -> Result<()> {
        let (chan, port) = oneshot::channel();
        self.cmd_chan
            .send(Command::Checkpoint { chan })
            .map_err(Error::from)?;
        port.await.map_err(|_| Error::Channel)?
    }

    /// Stops the torrent and drops all its resources, saving a final
    /// checkpoint.
    pub async fn remove(&self) -> Result<()> {
        let (chan, port) = oneshot::channel();
        self.cmd_chan
            .send(Command::Remove { chan })
            .map_err(Error::from)?;
        port.await.map_err(|_| Error::Channel)
    }
}

pub(crate) type Sender = UnboundedSender<Command>;
type Receiver = UnboundedReceiver<Command>;

pub(crate) enum Command {
    AddPeers {
        peers: Vec<SocketAddr>,
        origin: PeerOrigin,
    },
    AddInbound {
        socket: TcpStream,
    },
    Pause,
    Resume,
    SetFilePriorities {
        priorities: Vec<(FileIndex, FilePriority)>,
    },
    Status {
        chan: oneshot::Sender<TorrentStatus>,
    },
    Checkpoint {
        chan: oneshot::Sender<Result<()>>,
    },
    Remove {
        chan: oneshot::Sender<()>,
    },
}

/// The events peer sessions report to their torrent.
pub(crate) enum PeerEvent {
    Connected {
        addr: SocketAddr,
        peer_id: PeerId,
    },
    SessionStopped {
        addr: SocketAddr,
        result: Result<(), PeerError>,
    },
    BlockReceived {
        addr: SocketAddr,
        block: BlockInfo,
        duplicate_requests: Vec<SocketAddr>,
    },
    RequestsTimedOut {
        addr: SocketAddr,
        count: usize,
    },
    Stats {
        addr: SocketAddr,
        downloaded: u64,
        uploaded: u64,
        download_rate: u64,
        upload_rate: u64,
        is_peer_interested: bool,
        is_peer_choked: bool,
    },
    MetadataSize {
        addr: SocketAddr,
        size: u32,
    },
    MetadataPiece {
        addr: SocketAddr,
        index: u32,
        data: Vec<u8>,
    },
    MetadataReject {
        addr: SocketAddr,
        index: u32,
    },
}

pub(crate) type PeerEventSender = UnboundedSender<PeerEvent>;
type PeerEventReceiver = UnboundedReceiver<PeerEvent>;

/// Torrent state shared with every peer session.
pub(crate) struct TorrentContext {
    pub id: TorrentId,
    /// The 20 byte wire form of the torrent's info hash.
    pub info_hash_wire: [u8; 20],
    pub client_id: PeerId,
    pub conf: TorrentConf,
    /// The channel on which sessions report events to the torrent.
    pub events: PeerEventSender,
    pub disk: DiskHandle,
    pub global_limiter: Arc<RateLimiter>,
    /// The torrent scoped rate limiter pair.
    pub limiter: Arc<RateLimiter>,
    /// The number of peer connections across the whole engine.
    pub global_peer_count: Arc<AtomicUsize>,
    /// The engine wide connection limit.
    pub max_global_peers: usize,
}

/// The download half of a torrent's shared state, existing only once the
/// metadata is known.
pub(crate) struct DownloadContext {
    pub storage: StorageInfo,
    pub picker: RwLock<PiecePicker>,
    /// The in-progress piece downloads, shared across sessions so an
    /// abandoned piece is continued rather than restarted.
    pub downloads: RwLock<HashMap<PieceIndex, Arc<RwLock<PieceDownload>>>>,
    /// The exact bencoded `info` dictionary, served to metadata requests.
    pub info_bytes: Arc<Vec<u8>>,
    /// The request granularity of this torrent.
    pub block_size: u32,
}

/// The controller's view of one peer.
struct Peer {
    chan: peer::Sender,
    peer_id: Option<PeerId>,
    /// Set once the session reports a successful handshake.
    connected: bool,
    /// Penalty points; at [`PEER_BAN_THRESHOLD`] the peer is banned.
    reliability: u32,
    download_rate: u64,
    upload_rate: u64,
    is_peer_interested: bool,
    /// Our choker's current verdict for the peer.
    is_choked: bool,
    /// Whether the peer advertised ut_metadata support and a metadata
    /// size.
    has_metadata: bool,
}

pub(crate) struct Torrent {
    ctx: Arc<TorrentContext>,
    state: TorrentState,
    /// The torrent's metadata, absent while a magnet bootstrap is running.
    metainfo: Option<Metainfo>,
    /// The magnet the torrent was started from, if any.
    magnet: Option<MagnetInfo>,
    /// The path of the original `.torrent` file, if any.
    torrent_file: Option<PathBuf>,
    download: Option<Arc<DownloadContext>>,
    metadata_exchange: Option<MetadataExchange>,
    peers: HashMap<SocketAddr, Peer>,
    /// Known but unconnected candidate endpoints.
    available_peers: VecDeque<SocketAddr>,
    /// Recently failed endpoints and when they failed, for the dial
    /// cool-down.
    recently_failed: HashMap<SocketAddr, Instant>,
    /// Peers banned for repeatedly contributing bad data.
    banned: HashSet<SocketAddr>,
    /// Which peers contributed blocks to each unverified piece.
    contributors: HashMap<PieceIndex, HashSet<SocketAddr>>,
    /// The last verification failure of a piece: when, and who contributed.
    last_hash_fail: HashMap<PieceIndex, (Instant, HashSet<SocketAddr>)>,
    cmd_port: Option<Receiver>,
    peer_event_port: Option<PeerEventReceiver>,
    /// Our end of the channel the disk task reports this torrent's events
    /// on; cloned into every disk allocation.
    disk_alert_chan: crate::disk::TorrentAlertSender,
    disk_alert_port: Option<TorrentAlertReceiver>,
    events: broadcast::Sender<Event>,
    checkpoint_store: Option<CheckpointStore>,
    /// Resume state to apply when the metadata becomes available.
    resume: Option<Checkpoint>,
    counters: ThruputCounters,
    /// Bytes carried over from the checkpoint's lifetime statistics.
    base_downloaded: u64,
    base_uploaded: u64,
    optimistic_unchoke: Option<SocketAddr>,
    last_choke: Instant,
    last_optimistic: Instant,
    last_checkpoint: Instant,
    checkpoint_dirty: bool,
    last_error: Option<String>,
    ip_filter: Arc<dyn IpFilter>,
}

impl Torrent {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: TorrentId,
        client_id: PeerId,
        params: TorrentParams,
        conf: TorrentConf,
        disk: DiskHandle,
        global_limiter: Arc<RateLimiter>,
        global_peer_count: Arc<AtomicUsize>,
        max_global_peers: usize,
        ip_filter: Arc<dyn IpFilter>,
        checkpoint_store: Option<CheckpointStore>,
        resume: Option<Checkpoint>,
    ) -> Result<(Self, TorrentHandle)> {
        let info_hash = params.source.info_hash();
        conf.validate(match &params.source {
            TorrentSource::Metainfo(metainfo) => Some(metainfo.piece_len),
            TorrentSource::Magnet(_) => None,
        })?;

        let (cmd_chan, cmd_port) = mpsc::unbounded_channel();
        let (event_chan, peer_event_port) = mpsc::unbounded_channel();
        let (disk_alert_chan, disk_alert_port) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(64);

        let limiter =
            Arc::new(RateLimiter::new(conf.down_kib, conf.up_kib));
        let ctx = Arc::new(TorrentContext {
            id,
            info_hash_wire: info_hash.wire(),
            client_id,
            conf,
            events: event_chan,
            disk,
            global_limiter,
            limiter,
            global_peer_count,
            max_global_peers,
        });

        let (metainfo, magnet) = match params.source {
            TorrentSource::Metainfo(metainfo) => (Some(metainfo), None),
            TorrentSource::Magnet(magnet) => (None, Some(magnet)),
        };

        let handle = TorrentHandle {
            id,
            info_hash,
            cmd_chan,
            events: events.clone(),
        };

        let now = Instant::now();
        // backdate the choker clocks so the first tick computes an unchoke
        // set instead of idling a full interval
        let last_choke = now
            .checked_sub(ctx.conf.network.unchoke_interval)
            .unwrap_or(now);
        let torrent = Self {
            ctx,
            state: TorrentState::Initializing,
            metainfo,
            magnet,
            torrent_file: params.torrent_file,
            download: None,
            metadata_exchange: None,
            peers: HashMap::new(),
            available_peers: VecDeque::new(),
            recently_failed: HashMap::new(),
            banned: resume
                .as_ref()
                .map(|cp| cp.banned_peers.iter().copied().collect())
                .unwrap_or_default(),
            contributors: HashMap::new(),
            last_hash_fail: HashMap::new(),
            cmd_port: Some(cmd_port),
            peer_event_port: Some(peer_event_port),
            disk_alert_chan,
            disk_alert_port: Some(disk_alert_port),
            events,
            checkpoint_store,
            base_downloaded: resume
                .as_ref()
                .map(|cp| cp.downloaded)
                .unwrap_or(0),
            base_uploaded: resume.as_ref().map(|cp| cp.uploaded).unwrap_or(0),
            resume,
            counters: ThruputCounters::default(),
            optimistic_unchoke: None,
            last_choke,
            last_optimistic: now,
            last_checkpoint: now,
            checkpoint_dirty: false,
            last_error: None,
            ip_filter,
        };
        Ok((torrent, handle))
    }

    /// Runs the torrent until it is removed or the engine shuts down.
    pub async fn start(&mut self) -> Result<()> {
        log::info!("Starting torrent {}", self.ctx.id);

        // a torrent started from a .torrent file can set up its files and
        // picker straight away; a magnet waits for the metadata exchange
        if let Some(metainfo) = self.metainfo.take() {
            self.install_metadata(metainfo).await?;
        }

        self.run().await
    }

    async fn run(&mut self) -> Result<()> {
        let mut cmd_port = self.cmd_port.take().ok_or(Error::Channel)?.fuse();
        let mut peer_event_port = self
            .peer_event_port
            .take()
            .ok_or(Error::Channel)?
            .fuse();
        let mut disk_alert_port = self
            .disk_alert_port
            .take()
            .ok_or(Error::Channel)?
            .fuse();
        let mut ticker = time::interval(Duration::from_secs(1)).fuse();

        loop {
            select! {
                cmd = cmd_port.select_next_some() => {
                    if !self.handle_cmd(cmd).await? {
                        break;
                    }
                }
                event = peer_event_port.select_next_some() => {
                    self.handle_peer_event(event).await?;
                }
                alert = disk_alert_port.select_next_some() => {
                    self.handle_disk_alert(alert).await?;
                }
                _ = ticker.select_next_some() => {
                    self.tick().await?;
                }
            }
        }

        log::info!("Torrent {} stopped", self.ctx.id);
        Ok(())
    }

    /// Sets up everything that depends on the torrent's metadata: storage,
    /// file selection, picker, disk allocation, and the shared download
    /// context. Transitions the state out of `Initializing`.
    async fn install_metadata(&mut self, metainfo: Metainfo) -> Result<()> {
        let conf = &self.ctx.conf;
        conf.validate(Some(metainfo.piece_len))?;

        let storage =
            StorageInfo::new(&metainfo, conf.download_dir.clone());

        // priorities come from the checkpoint if there is one, else from
        // BEP 53 magnet hints, else everything is downloaded normally
        let file_count = storage.files().len();
        let selection = self
            .resume
            .as_ref()
            .filter(|cp| cp.file_priorities.len() == file_count)
            .map(|cp| FileSelection::from_priorities(cp.file_priorities.clone()))
            .or_else(|| self.selection_from_magnet_hints(file_count))
            .unwrap_or_else(|| FileSelection::new(file_count));

        let mut own_pieces = self
            .resume
            .as_ref()
            .filter(|cp| cp.piece_count == storage.piece_count)
            .map(|cp| cp.bitfield())
            .unwrap_or_else(|| Bitfield::repeat(false, storage.piece_count));

        // hand the torrent's files to the disk task
        self.ctx
            .disk
            .allocate_new_torrent(
                self.ctx.id,
                storage.clone(),
                metainfo.piece_hashes.clone(),
                conf.disk.clone(),
                self.disk_alert_chan.clone(),
            )
            .map_err(|_| Error::Channel)?;

        // optionally spot-check some verified pieces before trusting the
        // resume bitfield
        let spot_check = conf.resume.integrity_check_pieces;
        if spot_check > 0 && own_pieces.any() {
            let picked: Vec<PieceIndex> = {
                let mut rng = rand::thread_rng();
                own_pieces
                    .iter()
                    .enumerate()
                    .filter(|(_, bit)| **bit)
                    .map(|(index, _)| index)
                    .choose_multiple(&mut rng, spot_check)
            };
            let results = self
                .ctx
                .disk
                .verify_pieces(self.ctx.id, picked)
                .await
                .map_err(|_| Error::Channel)?;
            for (index, is_valid) in results {
                if !is_valid {
                    log::warn!(
                        "Resume spot-check failed for piece {}",
                        index
                    );
                    own_pieces.set(index, false);
                }
            }
        }

        let picker = PiecePicker::new(
            own_pieces,
            &storage,
            selection,
            &conf.strategy,
        )?;
        let is_complete = picker.is_complete();

        let download = Arc::new(DownloadContext {
            storage,
            picker: RwLock::new(picker),
            downloads: RwLock::new(HashMap::new()),
            info_bytes: Arc::new(metainfo.info_bytes.clone()),
            block_size: conf.network.block_size,
        });
        self.download = Some(download.clone());
        self.metainfo = Some(metainfo);
        self.metadata_exchange = None;

        // sessions started during the magnet bootstrap switch over to
        // downloading
        for peer in self.peers.values() {
            peer.chan
                .send(peer::Command::MetadataInstalled(download.clone()))
                .ok();
        }

        self.state = if is_complete {
            TorrentState::Seeding
        } else {
            TorrentState::Downloading
        };
        log::info!(
            "Torrent {} initialized, state: {:?}",
            self.ctx.id,
            self.state
        );
        Ok(())
    }

    fn selection_from_magnet_hints(
        &self,
        file_count: usize,
    ) -> Option<FileSelection> {
        let magnet = self.magnet.as_ref()?;
        if file_count <= 1 {
            // selection hints are meaningless for single file torrents
            return None;
        }
        let mut selection = FileSelection::new(file_count);
        let mut hinted = false;

        if let Some(indices) = &magnet.selected_indices {
            let selected = magnet::clamp_indices(indices, file_count);
            for index in 0..file_count {
                selection.set(index, FilePriority::DoNotDownload);
            }
            for index in selected {
                selection.set(index, FilePriority::Normal);
            }
            hinted = true;
        }
        if let Some(priorities) = &magnet.priorities {
            for (index, priority) in priorities {
                if *index < file_count {
                    selection.set(*index, *priority);
                    hinted = true;
                }
            }
        }
        if hinted {
            Some(selection)
        } else {
            None
        }
    }

    /// Handles a command from the torrent's handle. Returns `false` when
    /// the torrent should stop.
    async fn handle_cmd(&mut self, cmd: Command) -> Result<bool> {
        match cmd {
            Command::AddPeers { peers, origin } => {
                self.add_peers(peers, origin);
                self.dial_peers();
            }
            Command::AddInbound { socket } => {
                self.add_inbound(socket);
            }
            Command::Pause => {
                if self.state != TorrentState::Paused
                    && self.state != TorrentState::Stopped
                {
                    log::info!("Pausing torrent {}", self.ctx.id);
                    self.disconnect_all_peers();
                    self.state = TorrentState::Paused;
                }
            }
            Command::Resume => {
                if self.state == TorrentState::Paused {
                    log::info!("Resuming torrent {}", self.ctx.id);
                    self.state = match &self.download {
                        Some(download) => {
                            if download.picker.read().await.is_complete() {
                                TorrentState::Seeding
                            } else {
                                TorrentState::Downloading
                            }
                        }
                        None => TorrentState::Initializing,
                    };
                    self.dial_peers();
                }
            }
            Command::SetFilePriorities { priorities } => {
                self.set_file_priorities(priorities).await;
            }
            Command::Status { chan } => {
                let status = self.status().await;
                chan.send(status).ok();
            }
            Command::Checkpoint { chan } => {
                let result = self.save_checkpoint(true).await;
                chan.send(result).ok();
            }
            Command::Remove { chan } => {
                log::info!("Removing torrent {}", self.ctx.id);
                self.disconnect_all_peers();
                self.save_checkpoint(true).await.ok();
                self.ctx.disk.tear_down_torrent(self.ctx.id).ok();
                self.state = TorrentState::Stopped;
                chan.send(()).ok();
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Registers candidate endpoints, filtering banned, blocked, connected
    /// and cooling down addresses.
    fn add_peers(&mut self, peers: Vec<SocketAddr>, origin: PeerOrigin) {
        // BEP 27: private torrents only use tracker and manual peers
        let private = self
            .metainfo
            .as_ref()
            .map(|metainfo| metainfo.private)
            .unwrap_or(false);
        if private
            && matches!(origin, PeerOrigin::Dht | PeerOrigin::Pex)
        {
            log::debug!(
                "Torrent {} is private, dropping {:?} peers",
                self.ctx.id,
                origin
            );
            return;
        }

        let now = Instant::now();
        for addr in peers {
            if self.banned.contains(&addr)
                || self.ip_filter.is_blocked(addr.ip())
                || self.peers.contains_key(&addr)
                || self.available_peers.contains(&addr)
            {
                continue;
            }
            if let Some(failed_at) = self.recently_failed.get(&addr) {
                if now.saturating_duration_since(*failed_at) < DIAL_COOLDOWN {
                    continue;
                }
            }
            log::debug!(
                "Torrent {} new candidate peer {} ({:?})",
                self.ctx.id,
                addr,
                origin
            );
            self.available_peers.push_back(addr);
        }
    }

    /// Dials candidates until the torrent is at its connection limit.
    fn dial_peers(&mut self) {
        if matches!(
            self.state,
            TorrentState::Paused | TorrentState::Stopped
        ) {
            return;
        }
        let max_peers = self.ctx.conf.network.max_peers_per_torrent;
        while self.peers.len() < max_peers {
            let addr = match self.available_peers.pop_front() {
                Some(addr) => addr,
                None => break,
            };
            if self.banned.contains(&addr) {
                continue;
            }
            self.spawn_session(addr, None);
        }
    }

    /// Accepts an inbound connection if the limits and the IP filter
    /// allow.
    fn add_inbound(&mut self, socket: TcpStream) {
        let addr = match socket.peer_addr() {
            Ok(addr) => addr,
            Err(_) => return,
        };
        if matches!(
            self.state,
            TorrentState::Paused | TorrentState::Stopped
        ) || self.peers.len() >= self.ctx.conf.network.max_peers_per_torrent
            || self.banned.contains(&addr)
            || self.ip_filter.is_blocked(addr.ip())
            || self.peers.contains_key(&addr)
        {
            log::debug!("Rejecting inbound connection from {}", addr);
            return;
        }
        self.spawn_session(addr, Some(socket));
    }

    /// Spawns a peer session task; inbound when a socket is given.
    fn spawn_session(&mut self, addr: SocketAddr, socket: Option<TcpStream>) {
        // the engine wide connection limit is a soft bound; when it is
        // reached new peers are dropped while existing ones continue
        let global = &self.ctx.global_peer_count;
        if global.load(Ordering::Relaxed) >= self.ctx.max_global_peers {
            log::debug!(
                "Global peer limit reached, dropping candidate {}",
                addr
            );
            return;
        }
        global.fetch_add(1, Ordering::Relaxed);

        let (mut session, chan) = match &socket {
            Some(_) => {
                PeerSession::inbound(self.ctx.clone(), self.download.clone(), addr)
            }
            None => PeerSession::outbound(
                self.ctx.clone(),
                self.download.clone(),
                addr,
            ),
        };
        self.peers.insert(
            addr,
            Peer {
                chan,
                peer_id: None,
                connected: false,
                reliability: 0,
                download_rate: 0,
                upload_rate: 0,
                is_peer_interested: false,
                is_choked: true,
                has_metadata: false,
            },
        );

        let events = self.ctx.events.clone();
        let global_peer_count = self.ctx.global_peer_count.clone();
        task::spawn(async move {
            let result = match socket {
                Some(socket) => session.start_inbound(socket).await,
                None => session.start().await,
            };
            global_peer_count.fetch_sub(1, Ordering::Relaxed);
            events.send(PeerEvent::SessionStopped { addr, result }).ok();
        });
    }

    fn disconnect_all_peers(&mut self) {
        for peer in self.peers.values() {
            peer.chan.send(peer::Command::Shutdown).ok();
        }
    }

    async fn set_file_priorities(
        &mut self,
        priorities: Vec<(FileIndex, FilePriority)>,
    ) {
        let download = match &self.download {
            Some(download) => download,
            None => {
                log::warn!("Cannot set file priorities before metadata");
                return;
            }
        };
        let dropped = {
            let mut picker = download.picker.write().await;
            let mut selection = picker.selection().clone();
            for (index, priority) in priorities {
                if index < selection.file_count() {
                    selection.set(index, priority);
                }
            }
            picker.apply_selection(selection)
        };
        // drop the in-flight downloads of pieces that are no longer wanted
        if !dropped.is_empty() {
            let mut downloads = download.downloads.write().await;
            for index in &dropped {
                downloads.remove(index);
            }
            log::info!(
                "Dropped {} no longer wanted piece download(s)",
                dropped.len()
            );
        }
        // completion is relative to the selection, so it may change
        if self.state == TorrentState::Downloading
            && download.picker.read().await.is_complete()
        {
            self.state = TorrentState::Seeding;
        } else if self.state == TorrentState::Seeding
            && !download.picker.read().await.is_complete()
        {
            self.state = TorrentState::Downloading;
        }
        self.checkpoint_dirty = true;
    }

    async fn handle_peer_event(&mut self, event: PeerEvent) -> Result<()> {
        match event {
            PeerEvent::Connected { addr, peer_id } => {
                if let Some(peer) = self.peers.get_mut(&addr) {
                    peer.peer_id = Some(peer_id);
                    peer.connected = true;
                }
                self.events.send(Event::PeerConnected { addr }).ok();
            }
            PeerEvent::SessionStopped { addr, result } => {
                self.peers.remove(&addr);
                self.recently_failed.insert(addr, Instant::now());
                if let Some(exchange) = &mut self.metadata_exchange {
                    exchange.forget_peer(&addr);
                }
                let reason = match &result {
                    Ok(()) => "closed".to_string(),
                    Err(e) => e.to_string(),
                };
                log::info!("Peer {} disconnected: {}", addr, reason);
                self.events
                    .send(Event::PeerDisconnected { addr, reason })
                    .ok();
                self.dial_peers();
            }
            PeerEvent::BlockReceived {
                addr,
                block,
                duplicate_requests,
            } => {
                self.counters.down.add(block.len as u64);
                self.contributors
                    .entry(block.piece_index)
                    .or_default()
                    .insert(addr);
                // endgame: first copy wins, the slower peers get CANCELs
                for dup in duplicate_requests {
                    if let Some(peer) = self.peers.get(&dup) {
                        peer.chan
                            .send(peer::Command::CancelBlock(block))
                            .ok();
                    }
                }
            }
            PeerEvent::RequestsTimedOut { addr, count } => {
                self.penalize(addr, count as u32 * TIMEOUT_PENALTY);
            }
            PeerEvent::Stats {
                addr,
                uploaded,
                download_rate,
                upload_rate,
                is_peer_interested,
                ..
            } => {
                self.counters.up.add(uploaded);
                if let Some(peer) = self.peers.get_mut(&addr) {
                    peer.download_rate = download_rate;
                    peer.upload_rate = upload_rate;
                    peer.is_peer_interested = is_peer_interested;
                }
            }
            PeerEvent::MetadataSize { addr, size } => {
                if let Some(peer) = self.peers.get_mut(&addr) {
                    peer.has_metadata = true;
                }
                if self.download.is_none()
                    && self.metadata_exchange.is_none()
                {
                    log::info!(
                        "Torrent {} starting metadata exchange ({} bytes)",
                        self.ctx.id,
                        size
                    );
                    self.metadata_exchange =
                        MetadataExchange::new(size as usize);
                }
                self.pump_metadata_requests();
            }
            PeerEvent::MetadataPiece { addr, index, data } => {
                self.handle_metadata_piece(addr, index, data).await?;
            }
            PeerEvent::MetadataReject { addr, index } => {
                if let Some(exchange) = &mut self.metadata_exchange {
                    exchange.on_reject(&addr, index);
                }
                self.pump_metadata_requests();
            }
        }
        Ok(())
    }

    /// Sends metadata piece requests to capable peers, respecting the
    /// exchange's dedupe rules.
    fn pump_metadata_requests(&mut self) {
        let exchange = match &mut self.metadata_exchange {
            Some(exchange) => exchange,
            None => return,
        };
        for (addr, peer) in self.peers.iter() {
            if !peer.has_metadata || !peer.connected {
                continue;
            }
            while let Some(index) = exchange.next_request(*addr) {
                peer.chan
                    .send(peer::Command::RequestMetadataPiece { index })
                    .ok();
            }
        }
    }

    async fn handle_metadata_piece(
        &mut self,
        addr: SocketAddr,
        index: u32,
        data: Vec<u8>,
    ) -> Result<()> {
        let info_hash = self.info_hash();
        let exchange = match &mut self.metadata_exchange {
            Some(exchange) => exchange,
            None => return Ok(()),
        };
        exchange.on_data(addr, index, &data);

        match exchange.try_assemble(&info_hash) {
            Some(Ok(info_bytes)) => {
                log::info!(
                    "Torrent {} metadata assembled ({} bytes)",
                    self.ctx.id,
                    info_bytes.len()
                );
                let trackers = self
                    .magnet
                    .as_ref()
                    .map(|magnet| magnet.trackers.clone())
                    .unwrap_or_default();
                match Metainfo::from_info_dict(&info_bytes, trackers) {
                    Ok(metainfo) if metainfo.info_hash == info_hash => {
                        self.events.send(Event::MetadataReceived).ok();
                        self.install_metadata(metainfo).await?;
                    }
                    _ => {
                        // parseable garbage that still hashed correctly is
                        // not possible; treat a parse failure as fatal
                        log::error!(
                            "Torrent {} metadata unparseable",
                            self.ctx.id
                        );
                        self.last_error =
                            Some("metadata unparseable".to_string());
                    }
                }
            }
            Some(Err(offenders)) => {
                log::warn!(
                    "Torrent {} metadata failed verification, \
                     blacklisting {} peer(s)",
                    self.ctx.id,
                    offenders.len()
                );
                for addr in offenders {
                    if let Some(peer) = self.peers.get(&addr) {
                        peer.chan.send(peer::Command::Shutdown).ok();
                    }
                }
                self.pump_metadata_requests();
            }
            None => self.pump_metadata_requests(),
        }
        Ok(())
    }

    async fn handle_disk_alert(&mut self, alert: TorrentAlert) -> Result<()> {
        match alert {
            TorrentAlert::Allocation(Ok(())) => {
                log::debug!("Torrent {} files allocated", self.ctx.id);
            }
            TorrentAlert::Allocation(Err(reason)) => {
                // without files the torrent cannot make progress
                log::error!(
                    "Torrent {} allocation failed: {}",
                    self.ctx.id,
                    reason
                );
                self.last_error = Some(reason);
                self.disconnect_all_peers();
                self.state = TorrentState::Paused;
            }
            TorrentAlert::PieceCompletion(PieceCompletion {
                index,
                is_valid,
            }) => {
                if is_valid {
                    self.handle_piece_verified(index).await;
                } else {
                    self.handle_piece_hash_failure(index).await;
                }
            }
            TorrentAlert::WriteFailure { index, error } => {
                self.handle_piece_write_failure(index, error).await;
            }
            TorrentAlert::BlockRejected { info, error } => {
                log::warn!("Block {} rejected by disk: {}", info, error);
            }
            TorrentAlert::ReadError { info, error } => {
                log::warn!("Block {} read failed: {}", info, error);
            }
        }
        Ok(())
    }

    async fn handle_piece_verified(&mut self, index: PieceIndex) {
        let download = match &self.download {
            Some(download) => download,
            None => return,
        };
        let is_complete = {
            let mut picker = download.picker.write().await;
            picker.received_piece(index);
            picker.is_complete()
        };
        // the download entry is usually removed by the completing session
        download.downloads.write().await.remove(&index);
        self.contributors.remove(&index);
        self.last_hash_fail.remove(&index);
        self.checkpoint_dirty = true;

        log::info!("Torrent {} verified piece {}", self.ctx.id, index);
        self.events.send(Event::PieceVerified { index }).ok();

        // everyone who doesn't have the piece gets a HAVE
        for peer in self.peers.values() {
            peer.chan
                .send(peer::Command::PieceCompleted { index })
                .ok();
        }

        if is_complete && self.state == TorrentState::Downloading {
            log::info!("Torrent {} complete", self.ctx.id);
            self.state = TorrentState::Seeding;
            self.events.send(Event::TorrentCompleted).ok();
            self.save_checkpoint(true).await.ok();
        }
    }

    async fn handle_piece_hash_failure(&mut self, index: PieceIndex) {
        let contributors =
            self.contributors.remove(&index).unwrap_or_default();
        log::warn!(
            "Torrent {} piece {} failed verification ({} contributor(s))",
            self.ctx.id,
            index,
            contributors.len()
        );

        // peers involved in two failures of the same piece within the
        // window are not trusted again
        let now = Instant::now();
        if let Some((failed_at, previous)) = self.last_hash_fail.get(&index) {
            if now.saturating_duration_since(*failed_at) < HASH_FAIL_WINDOW {
                let repeat_offenders: Vec<SocketAddr> = contributors
                    .intersection(previous)
                    .copied()
                    .collect();
                for addr in repeat_offenders {
                    self.ban_peer(addr);
                }
            }
        }
        for addr in contributors.iter() {
            self.penalize(*addr, HASH_FAIL_PENALTY);
        }
        self.last_hash_fail
            .insert(index, (now, contributors.clone()));

        // requeue the piece
        if let Some(download) = &self.download {
            download.picker.write().await.unmark_pending(index);
            download.downloads.write().await.remove(&index);
        }

        self.events
            .send(Event::PieceHashFailed {
                index,
                contributing_peers: contributors.into_iter().collect(),
            })
            .ok();
    }

    /// Handles a piece that verified but never landed on disk: the disk
    /// layer discarded the assembled piece, so it must be downloaded and
    /// written again. The contributing peers fed good data, so unlike
    /// a hash failure nobody is penalized; the error is surfaced through
    /// `status()` so a persistently failing disk doesn't stall silently.
    async fn handle_piece_write_failure(
        &mut self,
        index: PieceIndex,
        error: crate::disk::error::WriteError,
    ) {
        log::error!(
            "Torrent {} failed to write piece {}: {}",
            self.ctx.id,
            index,
            error
        );
        self.last_error = Some(error.to_string());
        self.contributors.remove(&index);

        // requeue the piece, as after a failed hash check: clear its
        // pending mark and drop the stale download entry so the next pump
        // re-requests its blocks
        if let Some(download) = &self.download {
            download.picker.write().await.unmark_pending(index);
            download.downloads.write().await.remove(&index);
        }
    }

    fn penalize(&mut self, addr: SocketAddr, points: u32) {
        if let Some(peer) = self.peers.get_mut(&addr) {
            peer.reliability += points;
            if peer.reliability >= PEER_BAN_THRESHOLD {
                self.ban_peer(addr);
            }
        }
    }

    fn ban_peer(&mut self, addr: SocketAddr) {
        if self.banned.insert(addr) {
            log::warn!("Banning peer {}", addr);
            self.checkpoint_dirty = true;
        }
        if let Some(peer) = self.peers.get(&addr) {
            peer.chan.send(peer::Command::Shutdown).ok();
        }
    }

    /// The torrent's one second heartbeat.
    async fn tick(&mut self) -> Result<()> {
        self.counters.tick();

        let now = Instant::now();
        let conf = &self.ctx.conf.network;

        // recompute the unchoke set
        if now.saturating_duration_since(self.last_choke)
            >= conf.unchoke_interval
        {
            self.last_choke = now;
            if now.saturating_duration_since(self.last_optimistic)
                >= conf.optimistic_unchoke_interval
            {
                self.last_optimistic = now;
                self.rotate_optimistic_unchoke();
            }
            self.recompute_unchokes();
        }

        // keep the metadata exchange moving
        if let Some(exchange) = &mut self.metadata_exchange {
            exchange.reap_timed_out_requests(METADATA_REQUEST_TIMEOUT, now);
        }
        self.pump_metadata_requests();

        // periodic, debounced checkpoint
        if self.checkpoint_dirty
            && self.ctx.conf.resume.checkpoint_enabled
            && now.saturating_duration_since(self.last_checkpoint)
                >= self.ctx.conf.resume.checkpoint_interval
        {
            self.save_checkpoint(false).await.ok();
        }

        // drop stale cool-down entries and refill connections
        self.recently_failed.retain(|_, failed_at| {
            now.saturating_duration_since(*failed_at) < DIAL_COOLDOWN
        });
        self.dial_peers();

        Ok(())
    }

    /// Ranks interested peers by rate and unchokes the top few plus the
    /// optimistic slot.
    fn recompute_unchokes(&mut self) {
        let seeding = self.state == TorrentState::Seeding;
        let mut ranked: Vec<(SocketAddr, u64)> = self
            .peers
            .iter()
            .filter(|(_, peer)| peer.connected && peer.is_peer_interested)
            .map(|(addr, peer)| {
                let rate = if seeding {
                    peer.upload_rate
                } else {
                    peer.download_rate
                };
                (*addr, rate)
            })
            .collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1));

        let unchoked: HashSet<SocketAddr> = ranked
            .iter()
            .take(UNCHOKE_SLOTS)
            .map(|(addr, _)| *addr)
            .chain(self.optimistic_unchoke.iter().copied())
            .collect();

        for (addr, peer) in self.peers.iter_mut() {
            let choke = !unchoked.contains(addr);
            if peer.is_choked != choke {
                peer.is_choked = choke;
                peer.chan.send(peer::Command::Choke(choke)).ok();
            }
        }
    }

    /// Moves the optimistic unchoke slot to a random interested peer that
    /// is currently choked.
    fn rotate_optimistic_unchoke(&mut self) {
        let mut rng = rand::thread_rng();
        self.optimistic_unchoke = self
            .peers
            .iter()
            .filter(|(_, peer)| {
                peer.connected && peer.is_peer_interested && peer.is_choked
            })
            .map(|(addr, _)| *addr)
            .choose(&mut rng);
        if let Some(addr) = self.optimistic_unchoke {
            log::debug!("Optimistic unchoke slot moves to {}", addr);
        }
    }

    fn info_hash(&self) -> InfoHash {
        self.metainfo
            .as_ref()
            .map(|metainfo| metainfo.info_hash)
            .or_else(|| self.magnet.as_ref().map(|magnet| magnet.info_hash))
            .expect("torrent has neither metainfo nor magnet")
    }

    fn name(&self) -> String {
        self.metainfo
            .as_ref()
            .map(|metainfo| metainfo.name.clone())
            .or_else(|| {
                self.magnet.as_ref().and_then(|magnet| magnet.name.clone())
            })
            .unwrap_or_else(|| self.info_hash().to_hex())
    }

    async fn status(&self) -> TorrentStatus {
        let (piece_count, verified_piece_count) = match &self.download {
            Some(download) => {
                let picker = download.picker.read().await;
                (picker.piece_count(), picker.own_pieces().count_ones())
            }
            None => (0, 0),
        };
        TorrentStatus {
            state: self.state,
            name: self.name(),
            info_hash: self.info_hash(),
            piece_count,
            verified_piece_count,
            downloaded: self.base_downloaded + self.counters.down.total(),
            uploaded: self.base_uploaded + self.counters.up.total(),
            download_rate: self.counters.down.avg(),
            upload_rate: self.counters.up.avg(),
            peak_download_rate: self.counters.down.peak(),
            connected_peer_count: self
                .peers
                .values()
                .filter(|peer| peer.connected)
                .count(),
            last_error: self.last_error.clone(),
        }
    }

    /// Builds and saves a checkpoint. Unless `force` is set, the save is
    /// debounced to the configured interval.
    async fn save_checkpoint(&mut self, force: bool) -> Result<()> {
        let conf = &self.ctx.conf.resume;
        let store = match &self.checkpoint_store {
            Some(store) if conf.checkpoint_enabled => store.clone(),
            _ => return Ok(()),
        };
        let now = Instant::now();
        if !force
            && now.saturating_duration_since(self.last_checkpoint)
                < conf.checkpoint_interval
        {
            return Ok(());
        }

        // everything the checkpoint claims verified must be durable first
        self.ctx
            .disk
            .flush(self.ctx.id)
            .await
            .map_err(|_| Error::Channel)?;

        let (bitfield, priorities) = match &self.download {
            Some(download) => {
                let picker = download.picker.read().await;
                (
                    picker.own_pieces().clone(),
                    picker.selection().priorities().to_vec(),
                )
            }
            None => (Bitfield::new(), Vec::new()),
        };

        let magnet_uri = self
            .magnet
            .as_ref()
            .map(|magnet| magnet.to_uri())
            .or_else(|| {
                // synthesize one so the metadata can be re-obtained even
                // if the original .torrent file disappears
                self.metainfo.as_ref().map(|metainfo| {
                    MagnetInfo {
                        info_hash: metainfo.info_hash,
                        name: Some(metainfo.name.clone()),
                        trackers: metainfo.trackers.clone(),
                        selected_indices: None,
                        priorities: None,
                    }
                    .to_uri()
                })
            });
        let (trackers, private) = match &self.metainfo {
            Some(metainfo) => {
                (metainfo.trackers.clone(), metainfo.private)
            }
            None => (
                self.magnet
                    .as_ref()
                    .map(|magnet| magnet.trackers.clone())
                    .unwrap_or_default(),
                false,
            ),
        };

        let mut checkpoint = Checkpoint {
            version: CHECKPOINT_VERSION,
            info_hash: self.info_hash(),
            name: self.name(),
            magnet_uri,
            torrent_file: self.torrent_file.clone(),
            trackers,
            dht_enabled: !private,
            private,
            piece_count: 0,
            bitfield_bytes: Vec::new(),
            file_priorities: priorities,
            downloaded: self.base_downloaded + self.counters.down.total(),
            uploaded: self.base_uploaded + self.counters.up.total(),
            banned_peers: self.banned.iter().copied().collect(),
            saved_at: 0,
        };
        checkpoint.set_bitfield(&bitfield);
        checkpoint.stamp();

        store.save(&checkpoint)?;
        self.last_checkpoint = now;
        self.checkpoint_dirty = false;
        self.events.send(Event::CheckpointSaved).ok();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        conf::RIPTORRENT_CLIENT_ID, disk, disk::error::WriteError,
        engine::NoIpFilter, BLOCK_LEN,
    };
    use sha1::{Digest, Sha1};

    const PIECE_LEN: u32 = BLOCK_LEN;

    fn make_metainfo(name: &str, data: &[u8]) -> Metainfo {
        let mut piece_hashes = Vec::new();
        for piece in data.chunks(PIECE_LEN as usize) {
            let hash: [u8; 20] = Sha1::digest(piece).into();
            piece_hashes.extend_from_slice(&hash);
        }
        let mut buf = Vec::new();
        buf.extend_from_slice(b"d4:infod");
        buf.extend_from_slice(format!("6:lengthi{}e", data.len()).as_bytes());
        buf.extend_from_slice(
            format!("4:name{}:{}", name.len(), name).as_bytes(),
        );
        buf.extend_from_slice(
            format!("12:piece lengthi{}e", PIECE_LEN).as_bytes(),
        );
        buf.extend_from_slice(
            format!("6:pieces{}:", piece_hashes.len()).as_bytes(),
        );
        buf.extend_from_slice(&piece_hashes);
        buf.extend_from_slice(b"ee");
        Metainfo::from_bytes(&buf).unwrap()
    }

    // A disk write failure must not strand the piece: its pending mark and
    // stale download entry are cleared so it is requested again, and the
    // error is surfaced in the status snapshot.
    #[tokio::test(threaded_scheduler)]
    async fn test_write_failure_requeues_piece() {
        let data: Vec<u8> =
            (0..2 * PIECE_LEN).map(|b| (b % 256) as u8).collect();
        let metainfo = make_metainfo("wf.bin", &data);
        let dir = tempfile::tempdir().unwrap();
        let (_, disk, _alerts) = disk::spawn().unwrap();

        let (mut torrent, _handle) = Torrent::new(
            0,
            *RIPTORRENT_CLIENT_ID,
            TorrentParams {
                source: TorrentSource::Metainfo(metainfo),
                conf: None,
                torrent_file: None,
                resume: None,
            },
            TorrentConf::new(dir.path()),
            disk,
            Arc::new(RateLimiter::new(0, 0)),
            Arc::new(AtomicUsize::new(0)),
            100,
            Arc::new(NoIpFilter),
            None,
            None,
        )
        .unwrap();

        let metainfo = torrent.metainfo.take().unwrap();
        torrent.install_metadata(metainfo).await.unwrap();
        assert_eq!(torrent.state, TorrentState::Downloading);
        let download = torrent.download.clone().unwrap();

        // a session picks a piece and opens a shared download for it
        let seed = Bitfield::repeat(true, 2);
        download
            .picker
            .write()
            .await
            .register_availability(&seed)
            .unwrap();
        let index =
            download.picker.write().await.pick_piece(&seed).unwrap();
        download.downloads.write().await.insert(
            index,
            Arc::new(RwLock::new(PieceDownload::new(
                index, PIECE_LEN, PIECE_LEN,
            ))),
        );

        // the disk reports that the assembled piece couldn't be written
        torrent
            .handle_disk_alert(TorrentAlert::WriteFailure {
                index,
                error: WriteError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "no space left on device",
                )),
            })
            .await
            .unwrap();

        // the stale download entry is gone and the piece is offered again
        assert!(download.downloads.read().await.get(&index).is_none());
        assert_eq!(
            download.picker.write().await.pick_piece(&seed),
            Some(index)
        );

        // the failure is machine visible rather than a silent stall
        let status = torrent.status().await;
        assert!(status
            .last_error
            .as_deref()
            .unwrap_or_default()
            .contains("no space left on device"));
        assert_eq!(status.state, TorrentState::Downloading);
    }
}
