mod file;
mod piece;
mod torrent;

use std::collections::HashMap;

use crate::TorrentId;

use super::{
    error::*, Alert, AlertReceiver, AlertSender, Command, CommandReceiver,
    CommandSender, TorrentAlert,
};
use torrent::Torrent;

/// The entity responsible for saving downloaded file blocks to disk and
/// verifying whether downloaded pieces are valid.
pub(super) struct Disk {
    /// Each torrent in engine has a corresponding entry in this hashmap,
    /// which includes various metadata about torrent and the torrent
    /// specific alert channel.
    torrents: HashMap<TorrentId, Torrent>,
    /// Port on which disk IO commands are received.
    cmd_port: CommandReceiver,
    /// Channel on which `Disk` sends alerts to the torrent engine.
    alert_chan: AlertSender,
}

impl Disk {
    /// Creates a new `Disk` instance and returns a command sender and an
    /// alert receiver.
    pub(super) fn new() -> Result<(Self, CommandSender, AlertReceiver)> {
        let (alert_chan, alert_port) = tokio::sync::mpsc::unbounded_channel();
        let (cmd_chan, cmd_port) = tokio::sync::mpsc::unbounded_channel();
        Ok((
            Self {
                torrents: HashMap::new(),
                cmd_port,
                alert_chan,
            },
            cmd_chan,
            alert_port,
        ))
    }

    /// Starts the disk event loop which is run until shutdown or an
    /// unrecoverable error occurs (e.g. mpsc channel failure).
    pub(super) async fn start(&mut self) -> Result<()> {
        log::info!("Starting disk IO event loop");
        while let Some(cmd) = self.cmd_port.recv().await {
            match cmd {
                Command::NewTorrent {
                    id,
                    storage,
                    piece_hashes,
                    conf,
                    torrent_chan,
                } => {
                    if self.torrents.contains_key(&id) {
                        log::warn!("Torrent {} already allocated", id);
                        self.alert_chan.send(Alert::TorrentAllocation {
                            id,
                            result: Err(NewTorrentError::AlreadyExists),
                        })?;
                        continue;
                    }

                    // NOTE: Do _NOT_ return on failure, we don't want to kill
                    // the disk task due to potential disk IO errors: we just
                    // want to log it and notify the torrent of it.
                    match Torrent::new(
                        storage,
                        piece_hashes,
                        conf,
                        torrent_chan.clone(),
                    ) {
                        Ok(torrent) => {
                            log::info!("Torrent {} successfully allocated", id);
                            self.torrents.insert(id, torrent);
                            torrent_chan
                                .send(TorrentAlert::Allocation(Ok(())))
                                .ok();
                            self.alert_chan.send(Alert::TorrentAllocation {
                                id,
                                result: Ok(()),
                            })?;
                        }
                        Err(e) => {
                            log::warn!(
                                "Torrent {} allocation failure: {}",
                                id,
                                e
                            );
                            torrent_chan
                                .send(TorrentAlert::Allocation(Err(
                                    e.to_string()
                                )))
                                .ok();
                            self.alert_chan.send(Alert::TorrentAllocation {
                                id,
                                result: Err(e),
                            })?;
                        }
                    }
                }
                Command::WriteBlock { id, info, data } => {
                    // an unknown id means the torrent was just removed while
                    // its peers were still delivering; drop the block
                    match self.torrents.get_mut(&id) {
                        Some(torrent) => {
                            torrent.write_block(info, data).await?
                        }
                        None => log::warn!("Torrent {} not found", id),
                    }
                }
                Command::ReadBlock {
                    id,
                    info,
                    result_chan,
                } => {
                    if let Some(torrent) = self.torrents.get_mut(&id) {
                        torrent.read_block(info, result_chan).await?;
                    }
                }
                Command::Flush { id, chan } => {
                    let result = match self.torrents.get_mut(&id) {
                        Some(torrent) => torrent.flush().await,
                        None => Ok(()),
                    };
                    chan.send(result).ok();
                }
                Command::VerifyPieces { id, pieces, chan } => {
                    if let Some(torrent) = self.torrents.get_mut(&id) {
                        let results = torrent.verify_pieces(pieces).await;
                        chan.send(results).ok();
                    } else {
                        chan.send(Vec::new()).ok();
                    }
                }
                Command::TearDown { id } => {
                    // wait out in-flight writes so nothing touches the files
                    // after removal
                    if let Some(mut torrent) = self.torrents.remove(&id) {
                        torrent.flush().await.ok();
                        log::info!("Torrent {} disk state torn down", id);
                    }
                }
                Command::Shutdown => {
                    log::info!("Shutting down disk event loop");
                    for (_, torrent) in self.torrents.iter_mut() {
                        torrent.flush().await.ok();
                    }
                    break;
                }
            }
        }
        Ok(())
    }
}
