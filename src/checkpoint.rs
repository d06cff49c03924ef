//! Persisted resume state.
//!
//! A checkpoint captures the minimum a torrent needs for a cold restart
//! without re-hashing: the verified piece bitfield, the file selection, the
//! peers banned for bad data, and a way to re-obtain the metadata (magnet
//! URI or `.torrent` path). Checkpoints are written atomically in a compact
//! binary form guarded by a CRC, with an optional human readable JSON
//! mirror for diagnostics.

use std::{
    fs,
    io::Write,
    net::SocketAddr,
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use thiserror::Error;

use crate::{storage_info::FilePriority, Bitfield, InfoHash};

/// The current checkpoint format version. Loading refuses anything newer.
pub const CHECKPOINT_VERSION: u32 = 1;

/// The leading magic of the binary encoding.
const MAGIC: &[u8; 4] = b"rtcp";

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint is corrupt: {0}")]
    Corrupt(&'static str),
    #[error("checkpoint version {0} is newer than supported")]
    UnsupportedVersion(u32),
    #[error("checkpoint encoding failed: {0}")]
    Encode(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// The resume state of one torrent.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub version: u32,
    pub info_hash: InfoHash,
    pub name: String,
    /// A magnet URI the metadata can be re-obtained with, for torrents
    /// started from one.
    pub magnet_uri: Option<String>,
    /// The path of the original `.torrent` file, if any.
    pub torrent_file: Option<PathBuf>,
    pub trackers: Vec<String>,
    pub dht_enabled: bool,
    pub private: bool,
    pub piece_count: usize,
    /// The verified piece bitfield, in wire byte order.
    pub bitfield_bytes: Vec<u8>,
    pub file_priorities: Vec<FilePriority>,
    /// Cumulative payload bytes downloaded over the torrent's lifetime.
    pub downloaded: u64,
    /// Cumulative payload bytes uploaded over the torrent's lifetime.
    pub uploaded: u64,
    /// Peers banned for repeatedly contributing bad data; re-banned on
    /// resume.
    pub banned_peers: Vec<SocketAddr>,
    /// Seconds since the unix epoch at save time.
    pub saved_at: u64,
}

impl Checkpoint {
    /// Reconstructs the verified piece bitfield.
    pub fn bitfield(&self) -> Bitfield {
        let mut bitfield = Bitfield::from_vec(self.bitfield_bytes.clone());
        bitfield.resize(self.piece_count, false);
        bitfield
    }

    /// Stores the bitfield in its compact byte form.
    pub fn set_bitfield(&mut self, bitfield: &Bitfield) {
        self.piece_count = bitfield.len();
        self.bitfield_bytes = bitfield.as_slice().to_vec();
    }

    /// Stamps the checkpoint with the current wall clock time.
    pub(crate) fn stamp(&mut self) {
        self.saved_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs())
            .unwrap_or(0);
    }
}

/// Loads and saves checkpoints under a directory, one pair of files per
/// torrent, named by the info hash:
/// `<dir>/<info_hash_hex>.cp` (binary) and `<dir>/<info_hash_hex>.json`.
#[derive(Clone, Debug)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn binary_path(&self, info_hash: &InfoHash) -> PathBuf {
        self.dir.join(format!("{}.cp", info_hash.to_hex()))
    }

    fn json_path(&self, info_hash: &InfoHash) -> PathBuf {
        self.dir.join(format!("{}.json", info_hash.to_hex()))
    }

    /// Saves the checkpoint in the binary form, atomically: the bytes are
    /// written to a temporary file which is fsynced and renamed over the
    /// final path.
    pub fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        fs::create_dir_all(&self.dir)?;

        let payload = bincode::serialize(checkpoint)
            .map_err(|e| CheckpointError::Encode(e.to_string()))?;
        let crc = crc32(&payload);

        let mut bytes =
            Vec::with_capacity(MAGIC.len() + 8 + payload.len());
        bytes.extend_from_slice(MAGIC);
        bytes.extend_from_slice(&crc.to_be_bytes());
        bytes.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        bytes.extend_from_slice(&payload);

        let path = self.binary_path(&checkpoint.info_hash);
        atomic_write(&path, &bytes)?;
        log::debug!("Saved checkpoint {:?}", path);
        Ok(())
    }

    /// Additionally emits the human readable JSON mirror.
    pub fn save_json(
        &self,
        checkpoint: &Checkpoint,
    ) -> Result<(), CheckpointError> {
        fs::create_dir_all(&self.dir)?;
        let bytes = serde_json::to_vec_pretty(checkpoint)
            .map_err(|e| CheckpointError::Encode(e.to_string()))?;
        atomic_write(&self.json_path(&checkpoint.info_hash), &bytes)?;
        Ok(())
    }

    /// Loads the checkpoint for the torrent, preferring the binary form
    /// and falling back to the JSON mirror. Returns `Ok(None)` if neither
    /// exists.
    pub fn load(
        &self,
        info_hash: &InfoHash,
    ) -> Result<Option<Checkpoint>, CheckpointError> {
        let path = self.binary_path(info_hash);
        if path.exists() {
            return self.load_binary(&path).map(Some);
        }
        let path = self.json_path(info_hash);
        if path.exists() {
            let bytes = fs::read(path)?;
            let checkpoint: Checkpoint = serde_json::from_slice(&bytes)
                .map_err(|_| CheckpointError::Corrupt("invalid json"))?;
            Self::check_version(&checkpoint)?;
            return Ok(Some(checkpoint));
        }
        Ok(None)
    }

    fn load_binary(&self, path: &Path) -> Result<Checkpoint, CheckpointError> {
        let bytes = fs::read(path)?;
        if bytes.len() < MAGIC.len() + 8 || &bytes[..4] != MAGIC {
            return Err(CheckpointError::Corrupt("bad magic"));
        }
        let mut crc_bytes = [0; 4];
        crc_bytes.copy_from_slice(&bytes[4..8]);
        let crc = u32::from_be_bytes(crc_bytes);
        let mut len_bytes = [0; 4];
        len_bytes.copy_from_slice(&bytes[8..12]);
        let payload_len = u32::from_be_bytes(len_bytes) as usize;

        let payload = bytes
            .get(12..12 + payload_len)
            .ok_or(CheckpointError::Corrupt("truncated payload"))?;
        if crc32(payload) != crc {
            return Err(CheckpointError::Corrupt("crc mismatch"));
        }
        let checkpoint: Checkpoint = bincode::deserialize(payload)
            .map_err(|_| CheckpointError::Corrupt("undecodable payload"))?;
        Self::check_version(&checkpoint)?;
        Ok(checkpoint)
    }

    fn check_version(checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        if checkpoint.version > CHECKPOINT_VERSION {
            Err(CheckpointError::UnsupportedVersion(checkpoint.version))
        } else {
            Ok(())
        }
    }

    /// Removes the torrent's checkpoint files, if any.
    pub fn remove(&self, info_hash: &InfoHash) -> Result<(), CheckpointError> {
        for path in
            [self.binary_path(info_hash), self.json_path(info_hash)].iter()
        {
            if path.exists() {
                fs::remove_file(path)?;
            }
        }
        Ok(())
    }
}

fn crc32(bytes: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(bytes);
    hasher.finalize()
}

fn atomic_write(path: &Path, bytes: &[u8]) -> Result<(), CheckpointError> {
    let tmp_path = path.with_extension("tmp");
    {
        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp_path, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn checkpoint() -> Checkpoint {
        let mut bitfield = Bitfield::repeat(false, 10);
        for index in 0..5 {
            bitfield.set(index, true);
        }
        let mut checkpoint = Checkpoint {
            version: CHECKPOINT_VERSION,
            info_hash: InfoHash::V1([0x7f; 20]),
            name: "some torrent".into(),
            magnet_uri: Some(format!(
                "magnet:?xt=urn:btih:{}",
                hex::encode([0x7f; 20])
            )),
            torrent_file: None,
            trackers: vec!["udp://tracker.example:1337/announce".into()],
            dht_enabled: true,
            private: false,
            piece_count: 0,
            bitfield_bytes: Vec::new(),
            file_priorities: vec![FilePriority::Normal; 3],
            downloaded: 123456,
            uploaded: 654321,
            banned_peers: vec!["10.1.2.3:6881".parse().unwrap()],
            saved_at: 0,
        };
        checkpoint.set_bitfield(&bitfield);
        checkpoint.stamp();
        checkpoint
    }

    #[test]
    fn test_binary_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let checkpoint = checkpoint();

        store.save(&checkpoint).unwrap();
        let loaded = store.load(&checkpoint.info_hash).unwrap().unwrap();
        assert_eq!(loaded, checkpoint);

        // the reconstructed bitfield matches the saved one
        let bitfield = loaded.bitfield();
        assert_eq!(bitfield.len(), 10);
        assert_eq!(bitfield.count_ones(), 5);
        assert!(bitfield[4]);
        assert!(!bitfield[5]);
    }

    #[test]
    fn test_missing_checkpoint_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        assert!(store.load(&InfoHash::V1([1; 20])).unwrap().is_none());
    }

    #[test]
    fn test_json_mirror_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let checkpoint = checkpoint();

        store.save_json(&checkpoint).unwrap();
        let loaded = store.load(&checkpoint.info_hash).unwrap().unwrap();
        assert_eq!(loaded, checkpoint);
    }

    #[test]
    fn test_corrupt_checkpoint_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let checkpoint = checkpoint();
        store.save(&checkpoint).unwrap();

        // flip a payload byte: the crc check must refuse the file
        let path = dir
            .path()
            .join(format!("{}.cp", checkpoint.info_hash.to_hex()));
        let mut bytes = fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        fs::write(&path, bytes).unwrap();

        assert!(matches!(
            store.load(&checkpoint.info_hash),
            Err(CheckpointError::Corrupt(_))
        ));
    }

    #[test]
    fn test_newer_version_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let mut checkpoint = checkpoint();
        checkpoint.version = CHECKPOINT_VERSION + 1;
        store.save(&checkpoint).unwrap();

        assert!(matches!(
            store.load(&checkpoint.info_hash),
            Err(CheckpointError::UnsupportedVersion(_))
        ));
    }

    #[test]
    fn test_consecutive_saves_are_identical() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let checkpoint = checkpoint();
        let path = dir
            .path()
            .join(format!("{}.cp", checkpoint.info_hash.to_hex()));

        store.save(&checkpoint).unwrap();
        let first = fs::read(&path).unwrap();
        store.save(&checkpoint).unwrap();
        let second = fs::read(&path).unwrap();
        // with no state change (and the same timestamp) the bytes match
        assert_eq!(first, second);
    }

    #[test]
    fn test_remove() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let checkpoint = checkpoint();
        store.save(&checkpoint).unwrap();
        store.save_json(&checkpoint).unwrap();

        store.remove(&checkpoint.info_hash).unwrap();
        assert!(store.load(&checkpoint.info_hash).unwrap().is_none());
    }
}
