use std::{
    fs::{self, File, OpenOptions},
    io,
    os::unix::io::AsRawFd,
    path::Path,
};

use nix::sys::uio::{preadv, pwritev, IoVec};

use crate::{conf::Preallocation, storage_info::FileInfo};

use super::super::error::{NewTorrentError, ReadError, WriteError};

/// An open file of a torrent, addressed by positioned vectored IO so that
/// concurrent accesses to disjoint ranges need no seeking or external
/// synchronization beyond the per-file lock.
pub(super) struct TorrentFile {
    pub info: FileInfo,
    pub handle: File,
}

impl TorrentFile {
    /// Opens, and on first creation preallocates, the file under the
    /// download directory, creating missing parent directories.
    pub fn new(
        download_dir: &Path,
        info: FileInfo,
        preallocate: Preallocation,
    ) -> Result<Self, NewTorrentError> {
        let path = download_dir.join(&info.path);
        debug_assert!(!info.path.is_absolute());

        if let Some(subdir) = path.parent() {
            if !subdir.exists() {
                log::info!("Creating torrent subdir {:?}", subdir);
                fs::create_dir_all(subdir).map_err(|e| {
                    log::error!("Failed to create subdir {:?}", subdir);
                    NewTorrentError::Io(e)
                })?;
            }
        }

        let existed = path.exists();
        let handle = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .map_err(|e| {
                log::warn!("Failed to open file {:?}", path);
                NewTorrentError::Io(e)
            })?;

        if !existed {
            match preallocate {
                Preallocation::None => {}
                Preallocation::Sparse => handle.set_len(info.len)?,
                Preallocation::Full => {
                    if let Err(e) = Self::allocate_full(&handle, info.len) {
                        // not all filesystems support fallocate; fall back
                        // to just extending the file
                        log::debug!(
                            "fallocate of {:?} failed ({}), using set_len",
                            path,
                            e
                        );
                        handle.set_len(info.len)?;
                    }
                }
            }
            if info.executable {
                use std::os::unix::fs::PermissionsExt;
                let mut perms = handle.metadata()?.permissions();
                perms.set_mode(perms.mode() | 0o111);
                fs::set_permissions(&path, perms)?;
            }
        }

        Ok(Self { info, handle })
    }

    #[cfg(target_os = "linux")]
    fn allocate_full(handle: &File, len: u64) -> io::Result<()> {
        nix::fcntl::fallocate(
            handle.as_raw_fd(),
            nix::fcntl::FallocateFlags::empty(),
            0,
            len as i64,
        )
        .map_err(nix_to_io)
    }

    #[cfg(not(target_os = "linux"))]
    fn allocate_full(handle: &File, len: u64) -> io::Result<()> {
        handle.set_len(len)
    }

    /// Writes the buffers at the file offset with a single `pwritev` call,
    /// returning how many bytes the kernel took. The caller loops on short
    /// writes.
    pub fn write_vectored_at(
        &self,
        iovecs: &[IoVec<&[u8]>],
        offset: u64,
    ) -> Result<usize, WriteError> {
        pwritev(self.handle.as_raw_fd(), iovecs, offset as i64).map_err(|e| {
            log::warn!("File {:?} write error: {}", self.info.path, e);
            WriteError::Io(nix_to_io(e))
        })
    }

    /// Reads into the buffers from the file offset with a single `preadv`
    /// call, returning how many bytes were read. The caller loops on short
    /// reads; a zero return means the file doesn't contain the data.
    pub fn read_vectored_at(
        &self,
        iovecs: &[IoVec<&mut [u8]>],
        offset: u64,
    ) -> Result<usize, ReadError> {
        preadv(self.handle.as_raw_fd(), iovecs, offset as i64).map_err(|e| {
            log::warn!("File {:?} read error: {}", self.info.path, e);
            ReadError::Io(nix_to_io(e))
        })
    }

    /// Syncs file contents and metadata to disk.
    pub fn sync(&self) -> io::Result<()> {
        self.handle.sync_all()
    }
}

fn nix_to_io(e: nix::Error) -> io::Error {
    match e.as_errno() {
        Some(errno) => io::Error::from_raw_os_error(errno as i32),
        None => io::Error::new(io::ErrorKind::Other, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn file_info(path: &str, len: u64) -> FileInfo {
        FileInfo {
            path: PathBuf::from(path),
            len,
            torrent_offset: 0,
            executable: false,
        }
    }

    #[test]
    fn test_create_with_subdirs_and_sparse_length() {
        let dir = tempfile::tempdir().unwrap();
        let info = file_info("sub/dir/file.bin", 4096);
        let file =
            TorrentFile::new(dir.path(), info, Preallocation::Sparse).unwrap();
        assert_eq!(file.handle.metadata().unwrap().len(), 4096);
        assert!(dir.path().join("sub/dir/file.bin").exists());
    }

    #[test]
    fn test_positioned_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let info = file_info("file.bin", 64);
        let file =
            TorrentFile::new(dir.path(), info, Preallocation::Sparse).unwrap();

        let payload = b"hello, positioned world";
        let iovecs = [IoVec::from_slice(&payload[..])];
        let written = file.write_vectored_at(&iovecs, 8).unwrap();
        assert_eq!(written, payload.len());

        let mut buf = vec![0u8; payload.len()];
        let iovecs = [IoVec::from_mut_slice(&mut buf)];
        let read = file.read_vectored_at(&iovecs, 8).unwrap();
        assert_eq!(read, payload.len());
        assert_eq!(&buf, payload);
    }

    #[test]
    fn test_executable_attribute() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let mut info = file_info("tool", 16);
        info.executable = true;
        let file =
            TorrentFile::new(dir.path(), info, Preallocation::None).unwrap();
        let mode = file.handle.metadata().unwrap().permissions().mode();
        assert_ne!(mode & 0o111, 0);
    }
}
