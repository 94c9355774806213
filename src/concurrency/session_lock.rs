//! Cross-process session lock using advisory file locking (fs2 flock).
//!
//! Serializes snapshot creation and rollback for one session across threads
//! and processes, so a rollback never restores from a half-written snapshot
//! and two rollbacks never interleave their filesystem writes.

use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

/// Advisory file lock guarding one session's snapshot directory.
#[derive(Debug, Clone)]
pub struct SessionLock {
    path: PathBuf,
}

/// RAII guard that releases the lock on drop.
#[derive(Debug)]
pub struct SessionLockGuard {
    file: File,
}

impl Drop for SessionLockGuard {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

impl SessionLock {
    /// Lock backed by the file at `path`. The parent directory is created on
    /// first acquire.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open(&self) -> io::Result<File> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.path)
    }

    /// Blocking acquire: waits until the lock is available.
    pub fn acquire(&self) -> io::Result<SessionLockGuard> {
        let file = self.open()?;
        file.lock_exclusive()?;
        Ok(SessionLockGuard { file })
    }

    /// Non-blocking try-acquire: returns `None` if another holder has it.
    pub fn try_acquire(&self) -> io::Result<Option<SessionLockGuard>> {
        let file = self.open()?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(SessionLockGuard { file })),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            // EAGAIN(11) / EWOULDBLOCK(35 on macOS)
            #[cfg(unix)]
            Err(ref e) if e.raw_os_error() == Some(35) || e.raw_os_error() == Some(11) => Ok(None),
            Err(e) => Err(e),
        }
    }
}
