//! Advisory writer lock on the store file.
//!
//! `refresh` and `accept` write to the store and take an exclusive
//! `flock()` on `<db path>.lock` for their whole run. A second writer fails
//! fast with [`Error::Locked`] instead of interleaving batches. Readers
//! (`query`, `stats`) never lock; SQLite's WAL mode gives them the last
//! committed snapshot.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

#[cfg(unix)]
use std::os::unix::io::AsRawFd;

use crate::error::{Error, Result};

/// A held lock. Released on drop.
pub struct WriterLock {
    file: File,
    path: PathBuf,
}

impl WriterLock {
    /// Path of the lock file guarding `db_path`.
    pub fn lock_path(db_path: &Path) -> PathBuf {
        let mut name = db_path.as_os_str().to_owned();
        name.push(".lock");
        PathBuf::from(name)
    }

    /// Take the lock without waiting.
    pub fn try_acquire(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let path = Self::lock_path(db_path);
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        match try_lock_exclusive(&file) {
            Ok(()) => {
                tracing::debug!(lock = %path.display(), "acquired writer lock");
                Ok(Self { file, path })
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                Err(Error::Locked(db_path.to_path_buf()))
            }
            Err(e) => Err(Error::Io(e)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(unix)]
fn try_lock_exclusive(file: &File) -> io::Result<()> {
    let fd = file.as_raw_fd();
    let result = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };
    if result != 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::WouldBlock
            || err.raw_os_error() == Some(libc::EWOULDBLOCK)
            || err.raw_os_error() == Some(libc::EAGAIN)
        {
            return Err(io::Error::new(io::ErrorKind::WouldBlock, "store is locked"));
        }
        return Err(err);
    }
    Ok(())
}

// No advisory locking off unix; single-writer is then a documented assumption.
#[cfg(not(unix))]
fn try_lock_exclusive(_file: &File) -> io::Result<()> {
    Ok(())
}

#[cfg(unix)]
impl Drop for WriterLock {
    fn drop(&mut self) {
        let fd = self.file.as_raw_fd();
        unsafe { libc::flock(fd, libc::LOCK_UN) };
    }
}
