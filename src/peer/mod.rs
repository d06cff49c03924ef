mod codec;

use {
    futures::{
        select,
        stream::{Fuse, SplitSink},
        SinkExt, StreamExt,
    },
    std::{
        collections::HashSet,
        net::SocketAddr,
        sync::Arc,
        time::{Duration, Instant},
    },
    tokio::{
        net::TcpStream,
        sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
        time,
    },
    tokio_util::codec::{Framed, FramedParts},
};

use {
    crate::{
        counter::ThruputCounters,
        download::BlockReceipt,
        error::PeerError,
        metadata::{
            ExtendedHandshake, UtMetadataMsg, LOCAL_UT_METADATA_ID,
            METADATA_PIECE_LEN, UT_MSG_DATA, UT_MSG_REJECT, UT_MSG_REQUEST,
        },
        torrent::{DownloadContext, PeerEvent, TorrentContext},
        Bitfield, BlockInfo, PeerId, PieceIndex,
    },
    codec::*,
};

/// How long to wait for a bitfield or first message after the handshake
/// before assuming the peer has no pieces.
const AVAILABILITY_TIMEOUT: Duration = Duration::from_secs(10);

/// If nothing was sent to the peer for this long, a keep alive is sent.
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(90);

type Result<T, E = PeerError> = std::result::Result<T, E>;
type MessageSink = SplitSink<Framed<TcpStream, PeerCodec>, Message>;

/// The channel on which other parts of the engine send a peer session
/// commands.
pub(crate) type Sender = UnboundedSender<Command>;
type Receiver = UnboundedReceiver<Command>;

/// The commands a peer session can receive.
pub(crate) enum Command {
    /// The result of a disk read issued for a remote request: serve the
    /// block to the peer.
    Block { info: BlockInfo, data: Vec<u8> },
    /// Send a CANCEL for the block if we still have an outstanding request
    /// for it (the block arrived through another peer during endgame).
    CancelBlock(BlockInfo),
    /// The upload choker's verdict for this peer: true chokes, false
    /// unchokes.
    Choke(bool),
    /// We verified a new piece: announce it with a HAVE message.
    PieceCompleted { index: PieceIndex },
    /// The magnet bootstrap produced the torrent's metadata; start
    /// downloading proper.
    MetadataInstalled(Arc<DownloadContext>),
    /// Request the given metadata exchange piece from this peer.
    RequestMetadataPiece { index: u32 },
    /// Eventually shut down the peer session.
    Shutdown,
}

/// The status of a peer session.
///
/// By default, both sides of the connection start off as choked and not
/// interested in the other.
#[derive(Clone, Copy, Debug)]
struct Status {
    /// The current state of the session.
    state: State,
    /// If we're choked, peer doesn't allow us to download pieces from them.
    is_choked: bool,
    /// If we're interested, peer has pieces that we don't have.
    is_interested: bool,
    /// If peer is choked, we don't allow them to download pieces from us.
    is_peer_choked: bool,
    /// If peer is interested in us, they mean to download pieces that we
    /// have.
    is_peer_interested: bool,
}

impl Default for Status {
    fn default() -> Self {
        Self {
            state: State::default(),
            is_choked: true,
            is_interested: false,
            is_peer_choked: true,
            is_peer_interested: false,
        }
    }
}

/// At any given time, a connection with a peer is in one of the below
/// states.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum State {
    /// The peer connection has not yet been connected or it had been
    /// connected before but has been stopped.
    Disconnected,
    /// The state during which the TCP connection is established.
    Connecting,
    /// The state after establishing the TCP connection and exchanging the
    /// initial BitTorrent handshake.
    Handshaking,
    /// This state is optional, it is used to verify that the bitfield
    /// exchange occurs after the handshake and not later. It is set once
    /// the handshakes are exchanged and changed as soon as we receive the
    /// bitfield or the first message that is not a bitfield. Any subsequent
    /// bitfield messages are rejected and the connection is dropped, as per
    /// the standard.
    AvailabilityExchange,
    /// This is the normal state of a peer session, in which any messages,
    /// apart from the 'handshake' and 'bitfield', may be exchanged.
    Connected,
    /// The session is being wound down: outstanding requests are cancelled
    /// and the socket is closed.
    Disconnecting,
}

impl Default for State {
    fn default() -> Self {
        Self::Disconnected
    }
}

/// Information about the peer we're connected to, set after a successful
/// handshake.
struct PeerInfo {
    /// Peer's 20 byte BitTorrent id.
    peer_id: PeerId,
    /// Whether the peer speaks the extension protocol (BEP 10).
    supports_extensions: bool,
    /// The extension id under which the peer accepts ut_metadata messages,
    /// learned from its extension handshake.
    ut_metadata_id: Option<u8>,
    /// The peer's DHT port, if it announced one.
    dht_port: Option<u16>,
}

pub(crate) struct PeerSession {
    /// Shared information and handles of the torrent.
    ctx: Arc<TorrentContext>,
    /// The download half of the torrent's state: piece picker, shared piece
    /// downloads, storage geometry. `None` until the torrent has metadata
    /// (i.e. during a magnet bootstrap).
    download: Option<Arc<DownloadContext>>,
    /// The port on which the peer session receives commands.
    cmd_port: Fuse<Receiver>,
    /// Our own command sender, handed to the disk task for read results.
    cmd_chan: Sender,
    /// The remote address of the peer.
    addr: SocketAddr,
    /// Whether we or the remote initiated the connection.
    is_outbound: bool,
    /// Session related status information.
    status: Status,
    /// Pending block requests we sent to the peer. If we receive a block
    /// that is not in this set, it is dropped.
    outgoing_requests: HashSet<BlockInfo>,
    /// Pending block requests the peer sent us, awaiting their disk reads.
    incoming_requests: HashSet<BlockInfo>,
    /// Information about the peer, set after a successful handshake.
    peer_info: Option<PeerInfo>,
    /// The pieces the peer has, learned from its bitfield and HAVE
    /// messages. Sized only once the torrent has metadata.
    peer_pieces: Option<Bitfield>,
    /// Download and upload statistics of this session.
    counters: ThruputCounters,
    /// When the last message from the peer arrived.
    last_incoming: Instant,
    /// When we last sent the peer anything.
    last_outgoing: Instant,
    /// When the session entered the availability exchange.
    connected_at: Option<Instant>,
}

impl PeerSession {
    /// Creates a new outbound session with the peer at the given address.
    pub fn outbound(
        ctx: Arc<TorrentContext>,
        download: Option<Arc<DownloadContext>>,
        addr: SocketAddr,
    ) -> (Self, Sender) {
        Self::new(ctx, download, addr, true)
    }

    /// Creates a session around a connection the peer initiated.
    pub fn inbound(
        ctx: Arc<TorrentContext>,
        download: Option<Arc<DownloadContext>>,
        addr: SocketAddr,
    ) -> (Self, Sender) {
        Self::new(ctx, download, addr, false)
    }

    fn new(
        ctx: Arc<TorrentContext>,
        download: Option<Arc<DownloadContext>>,
        addr: SocketAddr,
        is_outbound: bool,
    ) -> (Self, Sender) {
        let (cmd_chan, cmd_port) = mpsc::unbounded_channel();
        (
            Self {
                ctx,
                download,
                cmd_port: cmd_port.fuse(),
                cmd_chan: cmd_chan.clone(),
                addr,
                is_outbound,
                status: Status::default(),
                outgoing_requests: HashSet::new(),
                incoming_requests: HashSet::new(),
                peer_info: None,
                peer_pieces: None,
                counters: ThruputCounters::default(),
                last_incoming: Instant::now(),
                last_outgoing: Instant::now(),
                connected_at: None,
            },
            cmd_chan,
        )
    }

    /// Dials the peer and runs the session until the connection is closed
    /// or a session fatal error occurs.
    pub async fn start(&mut self) -> Result<()> {
        debug_assert!(self.is_outbound);
        log::info!("Connecting to peer {}", self.addr);
        self.status.state = State::Connecting;

        let timeout = self.ctx.conf.network.connection_timeout;
        let socket = time::timeout(timeout, TcpStream::connect(self.addr))
            .await
            .map_err(|_| PeerError::Timeout)??;
        log::info!("Connected to peer {}", self.addr);

        let result = self.establish_and_run(socket).await;
        self.shut_down().await;
        result
    }

    /// Runs the session on a connection the peer dialed in; the handshake
    /// order flips.
    pub async fn start_inbound(&mut self, socket: TcpStream) -> Result<()> {
        debug_assert!(!self.is_outbound);
        log::info!("Accepted connection from peer {}", self.addr);
        let result = self.establish_and_run(socket).await;
        self.shut_down().await;
        result
    }

    async fn establish_and_run(&mut self, socket: TcpStream) -> Result<()> {
        let mut socket = Framed::new(socket, HandshakeCodec);

        self.status.state = State::Handshaking;
        let handshake =
            Handshake::new(self.ctx.info_hash_wire, self.ctx.client_id);

        if self.is_outbound {
            log::debug!("Sending handshake to peer {}", self.addr);
            socket.send(handshake.clone()).await?;
        }

        let timeout = self.ctx.conf.network.connection_timeout;
        let peer_handshake =
            match time::timeout(timeout, socket.next()).await {
                Ok(Some(peer_handshake)) => peer_handshake?,
                Ok(None) => return Err(PeerError::InvalidHandshake),
                Err(_) => return Err(PeerError::Timeout),
            };
        log::debug!("Peer {} handshake: {:?}", self.addr, peer_handshake);

        // verify that the advertised torrent info hash is the same as ours
        if peer_handshake.info_hash != self.ctx.info_hash_wire {
            log::info!("Peer {} handshake invalid info hash", self.addr);
            return Err(PeerError::InvalidInfoHash);
        }
        // guard against connecting to ourselves
        if peer_handshake.peer_id == self.ctx.client_id {
            log::info!("Peer {} is ourselves", self.addr);
            return Err(PeerError::SelfConnection);
        }

        if !self.is_outbound {
            log::debug!("Answering handshake of peer {}", self.addr);
            socket.send(handshake).await?;
        }

        log::debug!(
            "Peer {} capabilities: extensions {}, dht {}, fast {}, v2 {}",
            self.addr,
            peer_handshake.supports_extension_protocol(),
            peer_handshake.supports_dht(),
            peer_handshake.supports_fast(),
            peer_handshake.supports_v2(),
        );
        self.peer_info = Some(PeerInfo {
            peer_id: peer_handshake.peer_id,
            supports_extensions: peer_handshake
                .supports_extension_protocol(),
            ut_metadata_id: None,
            dht_port: None,
        });

        self.ctx
            .events
            .send(PeerEvent::Connected {
                addr: self.addr,
                peer_id: peer_handshake.peer_id,
            })
            .ok();

        // Now that we have the handshake, we need to switch to the peer
        // message codec and save the socket in self (note that we need to
        // keep the buffer from the original codec as it may contain bytes
        // of any potential message the peer may have sent after the
        // handshake).
        let old_parts = socket.into_parts();
        let mut new_parts = FramedParts::new(old_parts.io, PeerCodec);
        // reuse buffers of previous codec
        new_parts.read_buf = old_parts.read_buf;
        new_parts.write_buf = old_parts.write_buf;
        let socket = Framed::from_parts(new_parts);

        self.status.state = State::AvailabilityExchange;
        self.connected_at = Some(Instant::now());
        log::info!("Peer {} session state: {:?}", self.addr, self.status.state);

        self.run(socket).await
    }

    /// Runs the session after the connection to the peer is established.
    ///
    /// This is the main session "loop" and performs the core of the session
    /// logic: exchange of messages, timeout logic, etc.
    async fn run(
        &mut self,
        socket: Framed<TcpStream, PeerCodec>,
    ) -> Result<()> {
        // split the sink and stream so that we can pass the sink while
        // holding a reference to the stream in the loop
        let (mut sink, stream) = socket.split();
        let mut stream = stream.fuse();

        // the extension handshake goes out first, advertising the metadata
        // size if we have the metadata (BEP 10)
        if self.peer_supports_extensions() {
            let metadata_size = self
                .download
                .as_ref()
                .map(|d| d.info_bytes.len() as u32);
            let payload =
                serde_bencode::to_bytes(&ExtendedHandshake::new(metadata_size))
                    .map_err(|_| PeerError::InvalidMessage)?;
            self.send(&mut sink, Message::Extended { id: 0, payload })
                .await?;
        }

        // advertise the pieces we have, if any
        if let Some(download) = &self.download {
            let own_pieces = download.picker.read().await.own_pieces().clone();
            if own_pieces.any() {
                self.send(&mut sink, Message::Bitfield(own_pieces)).await?;
            }
        }

        let mut ticker =
            time::interval(Duration::from_secs(1)).fuse();

        // start the loop for receiving messages from the peer and commands
        // from other parts of the engine
        loop {
            select! {
                msg = stream.select_next_some() => {
                    let msg = msg?;
                    self.last_incoming = Instant::now();
                    log::debug!(
                        "Received message {:?} from peer {}",
                        msg.id(),
                        self.addr
                    );

                    // handle the bitfield message separately as it may only
                    // be received directly after the handshake; keep alives
                    // and the extension handshake may precede it
                    if self.status.state == State::AvailabilityExchange {
                        match msg {
                            Message::Bitfield(bitfield) => {
                                self.handle_bitfield_msg(&mut sink, bitfield)
                                    .await?;
                                self.status.state = State::Connected;
                            }
                            msg @ Message::KeepAlive
                            | msg @ Message::Extended { .. } => {
                                self.handle_msg(&mut sink, msg).await?;
                            }
                            msg => {
                                // any other message means the peer has no
                                // pieces to announce
                                self.status.state = State::Connected;
                                self.handle_msg(&mut sink, msg).await?;
                            }
                        }
                        if self.status.state == State::Connected {
                            log::info!(
                                "Peer {} session state: {:?}",
                                self.addr,
                                self.status.state
                            );
                        }
                    } else {
                        self.handle_msg(&mut sink, msg).await?;
                    }
                }
                cmd = self.cmd_port.select_next_some() => {
                    if !self.handle_cmd(&mut sink, cmd).await? {
                        log::info!("Shutting down peer {} session", self.addr);
                        self.status.state = State::Disconnecting;
                        // best effort cancels for whatever is in flight
                        let outgoing: Vec<_> =
                            self.outgoing_requests.iter().copied().collect();
                        for block in outgoing {
                            self.send(&mut sink, Message::Cancel(block))
                                .await
                                .ok();
                        }
                        break;
                    }
                }
                _ = ticker.select_next_some() => {
                    self.tick(&mut sink).await?;
                }
            }
        }

        Ok(())
    }

    /// The session's one second heartbeat: timeouts, keep alives, request
    /// reaping, and statistics.
    async fn tick(&mut self, sink: &mut MessageSink) -> Result<()> {
        let now = Instant::now();

        // general inactivity timeout
        let peer_timeout = self.ctx.conf.network.peer_timeout;
        if now.saturating_duration_since(self.last_incoming) >= peer_timeout {
            log::info!("Peer {} timed out from inactivity", self.addr);
            return Err(PeerError::Timeout);
        }

        // a peer that never even sends a bitfield is assumed to have no
        // pieces
        if self.status.state == State::AvailabilityExchange {
            if let Some(connected_at) = self.connected_at {
                if now.saturating_duration_since(connected_at)
                    >= AVAILABILITY_TIMEOUT
                {
                    self.status.state = State::Connected;
                }
            }
        }

        // keep the connection alive
        if now.saturating_duration_since(self.last_outgoing)
            >= KEEP_ALIVE_INTERVAL
        {
            self.send(sink, Message::KeepAlive).await?;
        }

        // requeue blocks whose requests have been outstanding for too long
        // and report the lapse for the peer's reliability score
        let timed_out = self.reap_request_timeouts(now).await;
        if timed_out > 0 {
            log::info!(
                "{} request(s) to peer {} timed out",
                timed_out,
                self.addr
            );
            self.ctx
                .events
                .send(PeerEvent::RequestsTimedOut {
                    addr: self.addr,
                    count: timed_out,
                })
                .ok();
        }

        // the periodic pump: refill the request pipeline in case it ran
        // dry without a block arrival to trigger it (timeouts, endgame)
        self.make_requests(sink).await?;

        self.counters.tick();
        self.ctx
            .events
            .send(PeerEvent::Stats {
                addr: self.addr,
                downloaded: self.counters.down.round(),
                uploaded: self.counters.up.round(),
                download_rate: self.counters.down.avg(),
                upload_rate: self.counters.up.avg(),
                is_peer_interested: self.status.is_peer_interested,
                is_peer_choked: self.status.is_peer_choked,
            })
            .ok();

        Ok(())
    }

    /// Scans the shared downloads this session participates in and frees
    /// this peer's lapsed requests. Returns how many lapsed.
    async fn reap_request_timeouts(&mut self, now: Instant) -> usize {
        let download = match &self.download {
            Some(download) => download,
            None => return 0,
        };
        let timeout = self.ctx.conf.network.request_timeout;
        let pieces: HashSet<PieceIndex> = self
            .outgoing_requests
            .iter()
            .map(|block| block.piece_index)
            .collect();
        let mut reaped = Vec::new();
        {
            let downloads = download.downloads.read().await;
            for piece_index in pieces {
                if let Some(piece_download) = downloads.get(&piece_index) {
                    reaped.extend(
                        piece_download
                            .write()
                            .await
                            .free_timed_out_blocks_of(
                                &self.addr, timeout, now,
                            ),
                    );
                }
            }
        }
        for block in &reaped {
            self.outgoing_requests.remove(block);
        }
        reaped.len()
    }

    /// Handles the bitfield message sent directly after the handshake.
    async fn handle_bitfield_msg(
        &mut self,
        sink: &mut MessageSink,
        mut bitfield: Bitfield,
    ) -> Result<()> {
        debug_assert_eq!(self.status.state, State::AvailabilityExchange);
        log::info!("Handling peer {} Bitfield message", self.addr);

        if let Some(download) = self.download.clone() {
            let piece_count = download.storage.piece_count;
            // The bitfield raw data that is sent over the wire may be
            // longer than the logical pieces it represents, if the number
            // of pieces in torrent is not a multiple of 8. Therefore we
            // need to slice off the last part of the bitfield; a bitfield
            // shorter than the torrent is malformed.
            if bitfield.len() < piece_count
                || bitfield.len() >= piece_count + 8
            {
                return Err(PeerError::InvalidMessage);
            }
            bitfield.resize(piece_count, false);

            // register the peer's pieces with the piece picker and check if
            // we became interested
            let is_interested = download
                .picker
                .write()
                .await
                .register_availability(&bitfield)
                .map_err(|_| PeerError::InvalidMessage)?;
            self.peer_pieces = Some(bitfield);
            self.update_interest(sink, is_interested).await?;
        } else {
            // without metadata we can't size-check the bitfield; keep it
            // for when the metadata arrives
            self.peer_pieces = Some(bitfield);
        }

        Ok(())
    }

    /// Handles messages expected in the `Connected` state.
    async fn handle_msg(
        &mut self,
        sink: &mut MessageSink,
        msg: Message,
    ) -> Result<()> {
        match msg {
            Message::Bitfield(_) => {
                log::info!(
                    "Peer {} sent bitfield message not after handshake",
                    self.addr
                );
                return Err(PeerError::BitfieldNotAfterHandshake);
            }
            Message::KeepAlive => {
                log::debug!("Peer {} sent keep alive", self.addr);
            }
            Message::Choke => {
                if !self.status.is_choked {
                    log::info!("Peer {} choked us", self.addr);
                    self.status.is_choked = true;
                    // since we're choked we don't expect our pending
                    // requests to be served; free them for other peers
                    self.free_outgoing_requests().await;
                }
            }
            Message::Unchoke => {
                if self.status.is_choked {
                    log::info!("Peer {} unchoked us", self.addr);
                    self.status.is_choked = false;
                    // now that we are allowed to request blocks, start the
                    // download pipeline if we're interested
                    self.make_requests(sink).await?;
                }
            }
            Message::Interested => {
                if !self.status.is_peer_interested {
                    log::info!("Peer {} is interested", self.addr);
                    self.status.is_peer_interested = true;
                }
            }
            Message::NotInterested => {
                if self.status.is_peer_interested {
                    log::info!("Peer {} is not interested", self.addr);
                    self.status.is_peer_interested = false;
                }
            }
            Message::Block {
                piece_index,
                offset,
                data,
            } => {
                let block_info = BlockInfo {
                    piece_index,
                    offset,
                    len: data.len() as u32,
                };
                // downloads are shaped by charging the buckets before the
                // block is accepted; pacing requests does most of the work,
                // this delay covers the rest
                self.ctx.global_limiter.acquire_down(block_info.len).await;
                self.ctx.limiter.acquire_down(block_info.len).await;
                self.handle_block_msg(block_info, data).await?;

                // we may be able to make more requests now that a block has
                // arrived
                self.make_requests(sink).await?;
            }
            Message::Request(block) => {
                self.handle_request_msg(block).await?;
            }
            Message::Cancel(block) => {
                log::debug!(
                    "Peer {} cancelled request {}",
                    self.addr,
                    block
                );
                self.incoming_requests.remove(&block);
            }
            Message::Have { piece_index } => {
                self.handle_have_msg(sink, piece_index).await?;
            }
            Message::Port(port) => {
                log::debug!("Peer {} DHT port is {}", self.addr, port);
                if let Some(peer_info) = &mut self.peer_info {
                    peer_info.dht_port = Some(port);
                }
            }
            Message::Extended { id, payload } => {
                self.handle_extended_msg(sink, id, payload).await?;
            }
        }

        Ok(())
    }

    /// Handles a HAVE message: registers the piece with the picker and
    /// updates our interest.
    async fn handle_have_msg(
        &mut self,
        sink: &mut MessageSink,
        piece_index: PieceIndex,
    ) -> Result<()> {
        let download = match self.download.clone() {
            Some(download) => download,
            None => {
                // without metadata we can't validate the index; ignore
                log::debug!(
                    "Ignoring HAVE {} from {} pre metadata",
                    piece_index,
                    self.addr
                );
                return Ok(());
            }
        };
        let piece_count = download.storage.piece_count;
        if piece_index >= piece_count {
            log::warn!(
                "Peer {} sent HAVE with invalid index {}",
                self.addr,
                piece_index
            );
            return Err(PeerError::InvalidMessage);
        }

        let peer_pieces = self
            .peer_pieces
            .get_or_insert_with(|| Bitfield::repeat(false, piece_count));
        if peer_pieces[piece_index] {
            return Ok(());
        }
        peer_pieces.set(piece_index, true);

        let is_interested = download
            .picker
            .write()
            .await
            .register_piece_availability(piece_index)
            .map_err(|_| PeerError::InvalidMessage)?;
        if is_interested {
            self.update_interest(sink, true).await?;
            self.make_requests(sink).await?;
        }
        Ok(())
    }

    /// Handles a REQUEST message: validates it and hands it to the disk
    /// task, which will eventually answer on our command channel.
    async fn handle_request_msg(&mut self, block: BlockInfo) -> Result<()> {
        log::debug!("Peer {} requested {}", self.addr, block);

        // a choked peer must not send requests
        if self.status.is_peer_choked {
            log::warn!("Choked peer {} sent a request", self.addr);
            return Err(PeerError::RequestWhileChoked);
        }
        let download = match self.download.clone() {
            Some(download) => download,
            // we have nothing to serve without metadata
            None => return Ok(()),
        };
        // the request must address a block inside a piece we have verified
        let piece_len = download
            .storage
            .piece_len(block.piece_index)
            .map_err(|_| PeerError::InvalidMessage)?;
        let in_bounds = block
            .offset
            .checked_add(block.len)
            .map(|end| end <= piece_len)
            .unwrap_or(false);
        if !in_bounds {
            log::warn!(
                "Peer {} requested block crossing piece boundary",
                self.addr
            );
            return Err(PeerError::InvalidMessage);
        }
        if !download.picker.read().await.own_pieces()[block.piece_index] {
            log::warn!(
                "Peer {} requested piece {} we don't have",
                self.addr,
                block.piece_index
            );
            return Err(PeerError::InvalidMessage);
        }
        if !self.incoming_requests.insert(block) {
            log::debug!("Peer {} re-requested {}", self.addr, block);
            return Ok(());
        }

        self.ctx
            .disk
            .read_block(self.ctx.id, block, self.cmd_chan.clone())
            .map_err(|_| PeerError::Channel)
    }

    /// Verifies block validity, registers it with its shared piece download
    /// and hands it to the disk task.
    async fn handle_block_msg(
        &mut self,
        block_info: BlockInfo,
        data: Vec<u8>,
    ) -> Result<()> {
        log::debug!("Received block from peer {}: {}", self.addr, block_info);

        if !self.outgoing_requests.remove(&block_info) {
            // silently ignore blocks we didn't ask for; a peer could spam
            // these so the count goes into the reliability accounting
            log::info!(
                "Peer {} sent not requested block: {}",
                self.addr,
                block_info,
            );
            return Ok(());
        }

        let download = match self.download.clone() {
            Some(download) => download,
            None => return Ok(()),
        };

        // mark the block as received with its shared piece download
        let receipt = {
            let downloads = download.downloads.read().await;
            match downloads.get(&block_info.piece_index) {
                Some(piece_download) => piece_download
                    .write()
                    .await
                    .received_block(&block_info),
                None => {
                    // the download may have been dropped by a file
                    // deselection between request and arrival
                    log::debug!(
                        "Block {} has no active download",
                        block_info
                    );
                    return Ok(());
                }
            }
        };

        match receipt {
            BlockReceipt::Accepted { duplicate_requests } => {
                self.counters.down.add(block_info.len as u64);
                // the torrent tracks who contributed to each piece and
                // CANCELs duplicate endgame requests on other sessions
                self.ctx
                    .events
                    .send(PeerEvent::BlockReceived {
                        addr: self.addr,
                        block: block_info,
                        duplicate_requests,
                    })
                    .ok();
                // validate and save the block to disk
                self.ctx
                    .disk
                    .write_block(self.ctx.id, block_info, data)
                    .map_err(|_| PeerError::Channel)?;

                // if this completed the piece's blocks, the download is
                // done; verification decides its fate from here
                let mut downloads = download.downloads.write().await;
                if let Some(piece_download) =
                    downloads.get(&block_info.piece_index)
                {
                    if piece_download.read().await.is_complete() {
                        downloads.remove(&block_info.piece_index);
                        log::info!(
                            "Piece {} assembled via peer {}",
                            block_info.piece_index,
                            self.addr
                        );
                    }
                }
            }
            BlockReceipt::Duplicate => {
                log::debug!("Duplicate block {}", block_info);
            }
            BlockReceipt::Invalid => {
                log::warn!(
                    "Peer {} sent invalid block {}",
                    self.addr,
                    block_info
                );
                return Err(PeerError::InvalidMessage);
            }
        }

        Ok(())
    }

    /// Handles a BEP 10 extended message: the extension handshake or
    /// a ut_metadata message.
    async fn handle_extended_msg(
        &mut self,
        sink: &mut MessageSink,
        id: u8,
        payload: Vec<u8>,
    ) -> Result<()> {
        if id == 0 {
            let handshake: ExtendedHandshake =
                serde_bencode::from_bytes(&payload)
                    .map_err(|_| PeerError::InvalidMessage)?;
            log::debug!(
                "Peer {} extension handshake: {:?}",
                self.addr,
                handshake
            );
            let ut_metadata_id = handshake.ut_metadata_id();
            if let Some(peer_info) = &mut self.peer_info {
                peer_info.ut_metadata_id = ut_metadata_id;
            }
            // during a magnet bootstrap the advertised metadata size is
            // what lets the torrent start the exchange
            if self.download.is_none() {
                if let (Some(_), Some(size)) =
                    (ut_metadata_id, handshake.metadata_size)
                {
                    self.ctx
                        .events
                        .send(PeerEvent::MetadataSize {
                            addr: self.addr,
                            size,
                        })
                        .ok();
                }
            }
            return Ok(());
        }

        if id == LOCAL_UT_METADATA_ID {
            let (header, data) = UtMetadataMsg::decode(&payload)
                .ok_or(PeerError::InvalidMessage)?;
            match header.msg_type {
                UT_MSG_REQUEST => {
                    self.serve_metadata_piece(sink, header.piece).await?;
                }
                UT_MSG_DATA => {
                    self.ctx
                        .events
                        .send(PeerEvent::MetadataPiece {
                            addr: self.addr,
                            index: header.piece,
                            data: data.to_vec(),
                        })
                        .ok();
                }
                UT_MSG_REJECT => {
                    self.ctx
                        .events
                        .send(PeerEvent::MetadataReject {
                            addr: self.addr,
                            index: header.piece,
                        })
                        .ok();
                }
                _ => return Err(PeerError::InvalidMessage),
            }
            return Ok(());
        }

        log::debug!(
            "Peer {} sent message for unknown extension {}",
            self.addr,
            id
        );
        Ok(())
    }

    /// Answers a metadata request: a data message if we have the metadata,
    /// a reject otherwise.
    async fn serve_metadata_piece(
        &mut self,
        sink: &mut MessageSink,
        index: u32,
    ) -> Result<()> {
        let remote_id = match self
            .peer_info
            .as_ref()
            .and_then(|info| info.ut_metadata_id)
        {
            Some(id) => id,
            // the peer asks for metadata without advertising the extension
            // itself: nowhere to send the answer
            None => return Ok(()),
        };

        let payload = match &self.download {
            Some(download) => {
                let info_bytes = &download.info_bytes;
                let start = index as usize * METADATA_PIECE_LEN;
                if start < info_bytes.len() {
                    let end =
                        (start + METADATA_PIECE_LEN).min(info_bytes.len());
                    UtMetadataMsg {
                        msg_type: UT_MSG_DATA,
                        piece: index,
                        total_size: Some(info_bytes.len() as u32),
                    }
                    .encode(Some(&info_bytes[start..end]))
                } else {
                    UtMetadataMsg::reject(index).encode(None)
                }
            }
            None => UtMetadataMsg::reject(index).encode(None),
        };
        self.send(
            sink,
            Message::Extended {
                id: remote_id,
                payload,
            },
        )
        .await
    }

    /// Handles a command from the torrent. Returns `false` when the session
    /// should shut down.
    async fn handle_cmd(
        &mut self,
        sink: &mut MessageSink,
        cmd: Command,
    ) -> Result<bool> {
        match cmd {
            Command::Block { info, data } => {
                // the peer may have cancelled the request while the disk
                // read was in flight
                if self.incoming_requests.remove(&info) {
                    // uploads are shaped at the source
                    self.ctx.global_limiter.acquire_up(info.len).await;
                    self.ctx.limiter.acquire_up(info.len).await;
                    self.counters.up.add(info.len as u64);
                    self.send(
                        sink,
                        Message::Block {
                            piece_index: info.piece_index,
                            offset: info.offset,
                            data,
                        },
                    )
                    .await?;
                }
            }
            Command::CancelBlock(block) => {
                if self.outgoing_requests.remove(&block) {
                    self.send(sink, Message::Cancel(block)).await?;
                }
            }
            Command::Choke(choke) => {
                if self.status.is_peer_choked != choke {
                    self.status.is_peer_choked = choke;
                    let msg = if choke {
                        // a choked peer's queued requests are implicitly
                        // dropped
                        self.incoming_requests.clear();
                        Message::Choke
                    } else {
                        Message::Unchoke
                    };
                    self.send(sink, msg).await?;
                }
            }
            Command::PieceCompleted { index } => {
                let peer_has = self
                    .peer_pieces
                    .as_ref()
                    .map(|pieces| {
                        pieces.get(index).map(|bit| *bit).unwrap_or(false)
                    })
                    .unwrap_or(false);
                if !peer_has {
                    self.send(sink, Message::Have { piece_index: index })
                        .await?;
                }
            }
            Command::MetadataInstalled(download) => {
                self.install_download(sink, download).await?;
            }
            Command::RequestMetadataPiece { index } => {
                if let Some(remote_id) = self
                    .peer_info
                    .as_ref()
                    .and_then(|info| info.ut_metadata_id)
                {
                    let payload = UtMetadataMsg::request(index).encode(None);
                    self.send(
                        sink,
                        Message::Extended {
                            id: remote_id,
                            payload,
                        },
                    )
                    .await?;
                }
            }
            Command::Shutdown => return Ok(false),
        }
        Ok(true)
    }

    /// Transitions a magnet bootstrap session into a downloading one once
    /// the metadata is known.
    async fn install_download(
        &mut self,
        sink: &mut MessageSink,
        download: Arc<DownloadContext>,
    ) -> Result<()> {
        let piece_count = download.storage.piece_count;
        self.download = Some(download.clone());

        // the bitfield received before the metadata can now be sized and
        // registered
        if let Some(mut peer_pieces) = self.peer_pieces.take() {
            if peer_pieces.len() < piece_count
                || peer_pieces.len() >= piece_count + 8
            {
                return Err(PeerError::InvalidMessage);
            }
            peer_pieces.resize(piece_count, false);
            let is_interested = download
                .picker
                .write()
                .await
                .register_availability(&peer_pieces)
                .map_err(|_| PeerError::InvalidMessage)?;
            self.peer_pieces = Some(peer_pieces);
            self.update_interest(sink, is_interested).await?;
            self.make_requests(sink).await?;
        }
        Ok(())
    }

    /// Fills the session's download pipeline with up to `pipeline_depth`
    /// outstanding requests, sourcing blocks first from the piece downloads
    /// this torrent already has in progress and then from fresh pieces
    /// picked for this peer.
    async fn make_requests(&mut self, sink: &mut MessageSink) -> Result<()> {
        if self.status.is_choked || !self.status.is_interested {
            return Ok(());
        }
        let download = match self.download.clone() {
            Some(download) => download,
            None => return Ok(()),
        };
        let peer_pieces = match &self.peer_pieces {
            Some(peer_pieces) => peer_pieces.clone(),
            None => return Ok(()),
        };

        let pipeline_depth = self.ctx.conf.network.pipeline_depth;
        let endgame_duplicates = self.ctx.conf.strategy.endgame_duplicates;
        let mut blocks = Vec::new();

        let in_endgame = download.picker.read().await.in_endgame();

        // If there are active downloads, prefer to continue those. This
        // will result in fewer in-progress pieces.
        {
            let downloads = download.downloads.read().await;
            for (piece_index, piece_download) in downloads.iter() {
                if self.outgoing_requests.len() + blocks.len()
                    >= pipeline_depth
                {
                    break;
                }
                if !peer_pieces
                    .get(*piece_index)
                    .map(|bit| *bit)
                    .unwrap_or(false)
                {
                    continue;
                }
                // cheap pre-check before taking the write lock
                if !piece_download.read().await.has_pickable_blocks(
                    &self.addr,
                    in_endgame,
                    endgame_duplicates,
                ) {
                    continue;
                }
                let mut piece_download = piece_download.write().await;
                let to_request = pipeline_depth
                    - self.outgoing_requests.len()
                    - blocks.len();
                piece_download.pick_blocks(
                    to_request,
                    self.addr,
                    in_endgame,
                    endgame_duplicates,
                    &mut blocks,
                );
            }
        }

        // while we can make more requests we start new download(s)
        loop {
            let to_request = pipeline_depth
                .saturating_sub(self.outgoing_requests.len() + blocks.len());
            if to_request == 0 {
                break;
            }

            let index = {
                let mut picker = download.picker.write().await;
                picker.pick_piece(&peer_pieces)
            };
            let index = match index {
                Some(index) => index,
                None => break,
            };
            log::info!("Session {} picked piece {}", self.addr, index);

            let piece_len = download
                .storage
                .piece_len(index)
                .map_err(|_| PeerError::InvalidMessage)?;
            let mut downloads = download.downloads.write().await;
            let piece_download = downloads
                .entry(index)
                .or_insert_with(|| {
                    Arc::new(tokio::sync::RwLock::new(
                        crate::download::PieceDownload::new(
                            index,
                            piece_len,
                            download.block_size,
                        ),
                    ))
                })
                .clone();
            drop(downloads);

            piece_download.write().await.pick_blocks(
                to_request,
                self.addr,
                in_endgame,
                endgame_duplicates,
                &mut blocks,
            );
        }

        // save the current volley of requests and make them, pacing each by
        // the download buckets
        for block in blocks {
            self.outgoing_requests.insert(block);
            self.ctx.global_limiter.acquire_down(block.len).await;
            self.ctx.limiter.acquire_down(block.len).await;
            self.send(sink, Message::Request(block)).await?;
        }

        Ok(())
    }

    /// Frees all our outstanding requests in the torrent's shared piece
    /// downloads so other peers can pick them up.
    async fn free_outgoing_requests(&mut self) {
        let download = match &self.download {
            Some(download) => download,
            None => {
                self.outgoing_requests.clear();
                return;
            }
        };
        let pieces: HashSet<PieceIndex> = self
            .outgoing_requests
            .iter()
            .map(|block| block.piece_index)
            .collect();
        let downloads = download.downloads.read().await;
        for piece_index in pieces {
            if let Some(piece_download) = downloads.get(&piece_index) {
                piece_download.write().await.free_blocks_of(&self.addr);
            }
        }
        drop(downloads);
        self.outgoing_requests.clear();
    }

    /// If our interest in the peer changed, record it and tell the peer.
    async fn update_interest(
        &mut self,
        sink: &mut MessageSink,
        is_interested: bool,
    ) -> Result<()> {
        if !self.status.is_interested && is_interested {
            self.status.is_interested = true;
            log::info!("Interested in peer {}", self.addr);
            self.send(sink, Message::Interested).await?;
        } else if self.status.is_interested && !is_interested {
            self.status.is_interested = false;
            self.send(sink, Message::NotInterested).await?;
        }
        Ok(())
    }

    /// Sends the message, tracking the time for the keep alive logic.
    async fn send(
        &mut self,
        sink: &mut MessageSink,
        msg: Message,
    ) -> Result<()> {
        log::debug!("Sending {:?} to peer {}", msg.id(), self.addr);
        self.last_outgoing = Instant::now();
        sink.send(msg).await
    }

    /// Releases everything this session holds in the torrent's shared
    /// state. Run on every exit path.
    async fn shut_down(&mut self) {
        self.status.state = State::Disconnected;
        self.free_outgoing_requests().await;
        if let (Some(download), Some(peer_pieces)) =
            (&self.download, &self.peer_pieces)
        {
            if peer_pieces.len() == download.storage.piece_count {
                download
                    .picker
                    .write()
                    .await
                    .unregister_availability(peer_pieces);
            }
        }
    }

    fn peer_supports_extensions(&self) -> bool {
        self.peer_info
            .as_ref()
            .map(|info| info.supports_extensions)
            .unwrap_or(false)
    }
}
