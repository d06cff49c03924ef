//! The engine is the composition root of the crate: it owns the disk task,
//! the global rate limiter and connection budget, and the torrents it was
//! asked to run. It does not decide *which* torrents to run, and it does
//! not discover peers; trackers, DHT, and listeners live in the host
//! application and feed the engine through [`TorrentHandle`]s.

use std::{
    collections::HashMap,
    net::IpAddr,
    sync::{atomic::AtomicUsize, Arc},
};

use tokio::task;

use crate::{
    checkpoint::CheckpointStore,
    conf::Conf,
    disk,
    error::*,
    rate_limiter::RateLimiter,
    torrent::{Torrent, TorrentHandle, TorrentParams},
    TorrentId,
};

/// The IP filter consulted before dialing and when accepting inbound
/// connections. The host application typically backs this with a block
/// list; the default implementation blocks nothing.
pub trait IpFilter: Send + Sync {
    fn is_blocked(&self, ip: IpAddr) -> bool;
}

/// The default filter: everything is allowed.
pub struct NoIpFilter;

impl IpFilter for NoIpFilter {
    fn is_blocked(&self, _: IpAddr) -> bool {
        false
    }
}

pub struct Engine {
    conf: Conf,
    disk: disk::DiskHandle,
    torrents: HashMap<TorrentId, TorrentHandle>,
    next_torrent_id: TorrentId,
    global_limiter: Arc<RateLimiter>,
    global_peer_count: Arc<AtomicUsize>,
    ip_filter: Arc<dyn IpFilter>,
}

impl Engine {
    /// Creates the engine, spawning its disk task. Must be called within
    /// an async runtime.
    pub fn new(conf: Conf) -> Result<Self> {
        let (_, disk, mut alert_port) =
            disk::spawn().map_err(|_| Error::Channel)?;

        // global disk alerts are only informational at the engine level;
        // torrents get their results on their own channels
        task::spawn(async move {
            while let Some(alert) = alert_port.recv().await {
                log::debug!("Disk alert: {:?}", alert);
            }
        });

        let global_limiter = Arc::new(RateLimiter::new(
            conf.engine.global_down_kib,
            conf.engine.global_up_kib,
        ));

        Ok(Self {
            disk,
            torrents: HashMap::new(),
            next_torrent_id: 0,
            global_limiter,
            global_peer_count: Arc::new(AtomicUsize::new(0)),
            ip_filter: Arc::new(NoIpFilter),
            conf,
        })
    }

    /// Installs an IP filter. Applies to torrents created afterwards.
    pub fn set_ip_filter(&mut self, ip_filter: Arc<dyn IpFilter>) {
        self.ip_filter = ip_filter;
    }

    /// Creates and starts a torrent, returning the handle it is driven
    /// through.
    pub fn create_torrent(
        &mut self,
        mut params: TorrentParams,
    ) -> Result<TorrentHandle> {
        let conf = params
            .conf
            .take()
            .unwrap_or_else(|| self.conf.torrent.clone());
        let info_hash = params.source.info_hash();

        let checkpoint_store = if conf.resume.checkpoint_enabled {
            conf.resume
                .checkpoint_dir
                .as_ref()
                .map(CheckpointStore::new)
        } else {
            None
        };
        // an explicitly provided resume state wins over the stored one
        let resume = match params.resume.take() {
            Some(resume) => Some(resume),
            None => match &checkpoint_store {
                Some(store) => store.load(&info_hash).unwrap_or_else(|e| {
                    log::warn!(
                        "Ignoring unusable checkpoint for {}: {}",
                        info_hash,
                        e
                    );
                    None
                }),
                None => None,
            },
        };

        let id = self.next_torrent_id;
        self.next_torrent_id += 1;

        let (mut torrent, handle) = Torrent::new(
            id,
            self.conf.engine.client_id,
            params,
            conf,
            self.disk.clone(),
            self.global_limiter.clone(),
            self.global_peer_count.clone(),
            self.conf.engine.max_global_peers,
            self.ip_filter.clone(),
            checkpoint_store,
            resume,
        )?;

        task::spawn(async move {
            if let Err(e) = torrent.start().await {
                log::error!("Torrent {} stopped with error: {}", id, e);
            }
        });

        log::info!("Created torrent {} ({})", id, info_hash);
        self.torrents.insert(id, handle.clone());
        Ok(handle)
    }

    pub fn torrent(&self, id: TorrentId) -> Option<&TorrentHandle> {
        self.torrents.get(&id)
    }

    /// Removes every torrent (saving final checkpoints) and stops the disk
    /// task.
    pub async fn shutdown(mut self) -> Result<()> {
        for (_, handle) in self.torrents.drain() {
            handle.remove().await.ok();
        }
        self.disk.shutdown().map_err(|_| Error::Channel)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        checkpoint::{Checkpoint, CHECKPOINT_VERSION},
        metainfo::Metainfo,
        torrent::{Event, PeerOrigin, TorrentSource, TorrentState},
        Bitfield,
    };
    use sha1::{Digest, Sha1};
    use std::{fs, time::Duration};
    use tokio::{net::TcpListener, sync::broadcast, time};

    const PIECE_LEN: u32 = 0x4000;

    /// Builds a single file torrent over the given content and returns its
    /// parsed metainfo.
    fn make_metainfo(name: &str, data: &[u8]) -> Metainfo {
        let mut piece_hashes = Vec::new();
        for piece in data.chunks(PIECE_LEN as usize) {
            let hash: [u8; 20] = Sha1::digest(piece).into();
            piece_hashes.extend_from_slice(&hash);
        }
        let mut buf = Vec::new();
        buf.extend_from_slice(b"d4:infod");
        buf.extend_from_slice(
            format!("6:lengthi{}e", data.len()).as_bytes(),
        );
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

    fn seed_checkpoint(metainfo: &Metainfo) -> Checkpoint {
        let mut checkpoint = Checkpoint {
            version: CHECKPOINT_VERSION,
            info_hash: metainfo.info_hash,
            name: metainfo.name.clone(),
            magnet_uri: None,
            torrent_file: None,
            trackers: Vec::new(),
            dht_enabled: true,
            private: false,
            piece_count: 0,
            bitfield_bytes: Vec::new(),
            file_priorities: Vec::new(),
            downloaded: 0,
            uploaded: 0,
            banned_peers: Vec::new(),
            saved_at: 0,
        };
        checkpoint
            .set_bitfield(&Bitfield::repeat(true, metainfo.piece_count()));
        checkpoint
    }

    async fn wait_for_completion(
        events: &mut broadcast::Receiver<Event>,
    ) -> Result<(), &'static str> {
        let waited = time::timeout(Duration::from_secs(60), async {
            loop {
                match events.recv().await {
                    Ok(Event::TorrentCompleted) => break Ok(()),
                    Ok(_) => {}
                    Err(broadcast::RecvError::Lagged(_)) => {}
                    Err(broadcast::RecvError::Closed) => {
                        break Err("event channel closed")
                    }
                }
            }
        })
        .await;
        match waited {
            Ok(result) => result,
            Err(_) => Err("timed out waiting for completion"),
        }
    }

    fn deterministic_content(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    /// Serves a torrent from one engine to another over a real socket:
    /// a 64 KiB single file torrent is seeded from a resume checkpoint and
    /// downloaded in full by a second engine.
    #[tokio::test(threaded_scheduler)]
    async fn test_download_single_file_from_seed() {
        let data = deterministic_content(4 * PIECE_LEN as usize);
        let metainfo = make_metainfo("test.bin", &data);

        // the seeder's file is already on disk and its checkpoint claims
        // every piece, so it starts seeding without rehashing
        let seed_dir = tempfile::tempdir().unwrap();
        fs::write(seed_dir.path().join("test.bin"), &data).unwrap();
        let mut seed_engine =
            Engine::new(Conf::new(seed_dir.path())).unwrap();
        let seed_handle = seed_engine
            .create_torrent(TorrentParams {
                source: TorrentSource::Metainfo(metainfo.clone()),
                conf: None,
                torrent_file: None,
                resume: Some(seed_checkpoint(&metainfo)),
            })
            .unwrap();

        // the host application's listener: accepted sockets are handed to
        // the torrent
        let mut listener = TcpListener::bind(
            "127.0.0.1:0".parse::<std::net::SocketAddr>().unwrap(),
        )
        .await
        .unwrap();
        let seed_addr = listener.local_addr().unwrap();
        let acceptor = seed_handle.clone();
        task::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                acceptor.add_inbound_peer(socket).ok();
            }
        });

        let status = seed_handle.status().await.unwrap();
        assert_eq!(status.state, TorrentState::Seeding);
        assert_eq!(status.verified_piece_count, 4);

        // the downloading engine learns of the seed through add_peers
        let download_dir = tempfile::tempdir().unwrap();
        let mut engine = Engine::new(Conf::new(download_dir.path())).unwrap();
        let handle = engine
            .create_torrent(TorrentParams {
                source: TorrentSource::Metainfo(metainfo),
                conf: None,
                torrent_file: None,
                resume: None,
            })
            .unwrap();
        let mut events = handle.subscribe();
        handle
            .add_peers(vec![seed_addr], PeerOrigin::Manual)
            .unwrap();

        wait_for_completion(&mut events).await.unwrap();

        let status = handle.status().await.unwrap();
        assert_eq!(status.state, TorrentState::Seeding);
        assert_eq!(status.verified_piece_count, 4);
        assert_eq!(status.piece_count, 4);
        assert!(status.downloaded >= data.len() as u64);

        // the downloaded file is byte identical
        let downloaded =
            fs::read(download_dir.path().join("test.bin")).unwrap();
        assert_eq!(downloaded, data);

        engine.shutdown().await.unwrap();
        seed_engine.shutdown().await.unwrap();
    }

    /// A paused and checkpointed torrent resumes without re-requesting the
    /// pieces the checkpoint already covers.
    #[tokio::test(threaded_scheduler)]
    async fn test_resume_from_checkpoint_skips_verified_pieces() {
        let data = deterministic_content(4 * PIECE_LEN as usize);
        let metainfo = make_metainfo("resume.bin", &data);

        let download_dir = tempfile::tempdir().unwrap();
        // the first half of the file is already on disk and checkpointed
        fs::write(download_dir.path().join("resume.bin"), &data).unwrap();
        let mut partial = Bitfield::repeat(false, 4);
        partial.set(0, true);
        partial.set(1, true);
        let mut checkpoint = seed_checkpoint(&metainfo);
        checkpoint.set_bitfield(&partial);

        let mut conf = crate::conf::TorrentConf::new(download_dir.path());
        // spot-check everything the checkpoint claims
        conf.resume.integrity_check_pieces = 2;

        let mut engine = Engine::new(Conf::new(download_dir.path())).unwrap();
        let handle = engine
            .create_torrent(TorrentParams {
                source: TorrentSource::Metainfo(metainfo),
                conf: Some(conf),
                torrent_file: None,
                resume: Some(checkpoint),
            })
            .unwrap();

        let status = handle.status().await.unwrap();
        assert_eq!(status.state, TorrentState::Downloading);
        // the spot-check passes since the data on disk is intact, so the
        // two checkpointed pieces are trusted without rehashing the rest
        assert_eq!(status.verified_piece_count, 2);

        engine.shutdown().await.unwrap();
    }

    /// File names that would escape the download directory are refused at
    /// the metainfo parsing boundary.
    #[test]
    fn test_unsafe_paths_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(b"d4:infod");
        buf.extend_from_slice(b"6:lengthi16384e");
        buf.extend_from_slice(b"4:name10:../../evil");
        buf.extend_from_slice(b"12:piece lengthi16384e");
        buf.extend_from_slice(b"6:pieces20:");
        buf.extend_from_slice(&[0u8; 20]);
        buf.extend_from_slice(b"ee");
        assert!(Metainfo::from_bytes(&buf).is_err());
    }

    /// Checkpoints survive the engine being torn down and recreated.
    #[tokio::test(threaded_scheduler)]
    async fn test_checkpoint_round_trip_through_store() {
        let data = deterministic_content(2 * PIECE_LEN as usize);
        let metainfo = make_metainfo("cp.bin", &data);
        let download_dir = tempfile::tempdir().unwrap();
        let checkpoint_dir = tempfile::tempdir().unwrap();
        fs::write(download_dir.path().join("cp.bin"), &data).unwrap();

        let mut conf = crate::conf::TorrentConf::new(download_dir.path());
        conf.resume.checkpoint_dir =
            Some(checkpoint_dir.path().to_path_buf());

        let info_hash = metainfo.info_hash;
        {
            let mut engine =
                Engine::new(Conf::new(download_dir.path())).unwrap();
            let handle = engine
                .create_torrent(TorrentParams {
                    source: TorrentSource::Metainfo(metainfo.clone()),
                    conf: Some(conf.clone()),
                    torrent_file: None,
                    resume: Some(seed_checkpoint(&metainfo)),
                })
                .unwrap();
            handle.checkpoint().await.unwrap();
            engine.shutdown().await.unwrap();
        }

        // a fresh engine finds the stored checkpoint by info hash and
        // resumes seeding
        let mut engine = Engine::new(Conf::new(download_dir.path())).unwrap();
        let handle = engine
            .create_torrent(TorrentParams {
                source: TorrentSource::Metainfo(metainfo),
                conf: Some(conf),
                torrent_file: None,
                resume: None,
            })
            .unwrap();
        let status = handle.status().await.unwrap();
        assert_eq!(status.state, TorrentState::Seeding);
        assert_eq!(status.info_hash, info_hash);

        engine.shutdown().await.unwrap();
    }
}
