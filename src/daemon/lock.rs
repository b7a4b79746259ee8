//! Singleton-per-user lockfile enforcement (§6), grounded on
//! `ProcessPipe::InitializeServerPipe`'s create-or-detect-stale dance: a would-be server takes an
//! exclusive lock to prove nobody else holds one, then downgrades to a shared lock so later
//! launches' exclusive-lock probes keep failing while any number of clients can take their own
//! shared lock concurrently just to check liveness.

use crate::error::Error;
use nix::fcntl::{flock, FlockArg};
use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

/// Default lock path, mirroring `$XDG_DATA_HOME/FEX/Server/Server.lock` (§6) under this crate's
/// own name.
pub fn default_lock_path() -> PathBuf {
    let data_home = std::env::var_os("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(std::env::var_os("HOME").unwrap_or_default()).join(".local/share"));
    data_home.join("dbtx/Server/Server.lock")
}

/// An acquired server lock. Dropping it releases the shared lock, letting the next launch's
/// exclusive-lock probe succeed.
pub struct ServerLock {
    file: File,
}

impl ServerLock {
    /// Attempts to become the one `dbtx-server` instance for this lock path. Returns `Ok(None)`
    /// if another instance already holds the lock (not an error — the caller should connect to
    /// the existing instance instead of starting a new one).
    pub fn acquire(path: &Path) -> Result<Option<Self>, Error> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().read(true).write(true).create(true).open(path)?;
        let fd = file.as_raw_fd();

        match flock(fd, FlockArg::LockExclusiveNonblock) {
            Ok(()) => {}
            Err(nix::errno::Errno::EWOULDBLOCK) => return Ok(None),
            Err(err) => return Err(err.into()),
        }

        // Downgrade to shared so future liveness probes (also shared locks) succeed, while a
        // future server's exclusive-lock probe still blocks on us.
        flock(fd, FlockArg::LockSharedNonblock)?;

        Ok(Some(Self { file }))
    }

    /// Checks whether a server appears to be alive at `path` without taking ownership: succeeds
    /// in taking (and immediately releasing) an exclusive lock only when nobody holds the shared
    /// lock a running server keeps.
    pub fn is_server_alive(path: &Path) -> bool {
        let Ok(file) = OpenOptions::new().read(true).write(true).open(path) else {
            return false;
        };
        let fd = file.as_raw_fd();
        match flock(fd, FlockArg::LockExclusiveNonblock) {
            Ok(()) => {
                let _ = flock(fd, FlockArg::UnlockNonblock);
                false
            }
            Err(_) => true,
        }
    }
}

impl Drop for ServerLock {
    fn drop(&mut self) {
        let _ = flock(self.file.as_raw_fd(), FlockArg::UnlockNonblock);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_on_the_same_path_fails_while_the_first_is_held() {
        let dir = std::env::temp_dir().join(format!("dbtx-lock-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("Server.lock");

        let first = ServerLock::acquire(&path).unwrap();
        assert!(first.is_some());
        assert!(ServerLock::is_server_alive(&path));

        let second = ServerLock::acquire(&path).unwrap();
        assert!(second.is_none());

        drop(first);
        assert!(!ServerLock::is_server_alive(&path));

        let _ = std::fs::remove_dir_all(&dir);
    }
}
