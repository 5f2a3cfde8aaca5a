//! Advisory file locks
//!
//! Tunnel liveness is derived from `flock`: the helper holds an
//! exclusive lock for the lifetime of its SSH session, and the router
//! blocks on the same lock to observe teardown. The kernel releases the
//! lock when the holder dies, so no cooperative cleanup is required.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

#[cfg(unix)]
use std::os::unix::io::AsRawFd;

/// An open file holding an advisory lock. The lock is released when the
/// guard is dropped (or when the process dies).
pub struct LockFile {
    file: File,
    path: PathBuf,
}

fn flock(file: &File, operation: libc::c_int) -> io::Result<()> {
    let rc = unsafe { libc::flock(file.as_raw_fd(), operation) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

impl LockFile {
    /// Open `path` (creating it if needed) and take the exclusive lock,
    /// blocking until it is available.
    pub fn lock_exclusive(path: &Path) -> io::Result<Self> {
        Self::lock(path, libc::LOCK_EX)
    }

    /// Non-blocking variant; fails with `WouldBlock` when the lock is held.
    pub fn try_lock_exclusive(path: &Path) -> io::Result<Self> {
        Self::lock(path, libc::LOCK_EX | libc::LOCK_NB)
    }

    fn lock(path: &Path, operation: libc::c_int) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        flock(&file, operation)?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    /// Release the lock and delete the lock file.
    pub fn unlock_and_remove(self) -> io::Result<()> {
        flock(&self.file, libc::LOCK_UN)?;
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        if let Err(e) = flock(&self.file, libc::LOCK_UN) {
            tracing::debug!("releasing lock on {:?} failed: {}", self.path, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn test_exclusive_lock_blocks_second_locker() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tunnel.lock");

        let first = LockFile::lock_exclusive(&path).unwrap();
        assert!(LockFile::try_lock_exclusive(&path).is_err());

        drop(first);
        assert!(LockFile::try_lock_exclusive(&path).is_ok());
    }

    #[test]
    fn test_release_wakes_blocked_locker() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tunnel.lock");

        let first = LockFile::lock_exclusive(&path).unwrap();

        let (tx, rx) = std::sync::mpsc::channel();
        let blocked_path = path.clone();
        let handle = std::thread::spawn(move || {
            let lock = LockFile::lock_exclusive(&blocked_path).unwrap();
            tx.send(()).unwrap();
            drop(lock);
        });

        // the second locker must still be parked
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

        drop(first);
        rx.recv_timeout(Duration::from_secs(2))
            .expect("blocked locker never woke");
        handle.join().unwrap();
    }

    #[test]
    fn test_unlock_and_remove_deletes_the_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tunnel.lock");

        let lock = LockFile::lock_exclusive(&path).unwrap();
        assert!(path.exists());
        lock.unlock_and_remove().unwrap();
        assert!(!path.exists());
    }
}
