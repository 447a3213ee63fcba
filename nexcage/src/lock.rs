//! Advisory file locking for the mapping and state stores.
//!
//! Multiple concurrent invocations on the same host are expected; mutating
//! operations take an exclusive `flock`, read-only operations a shared one.
//! Locks sit on sibling `.lock` files so data files can be atomically
//! replaced (temp + rename) while the lock is held.

use std::fs::OpenOptions;
use std::path::Path;

use nix::fcntl::{Flock, FlockArg};

/// Held advisory lock; released on drop.
#[derive(Debug)]
pub(crate) struct FileLock {
    _flock: Flock<std::fs::File>,
}

impl FileLock {
    /// Blocks until an exclusive lock on `path` is held.
    pub(crate) fn exclusive(path: &Path) -> std::io::Result<Self> {
        Self::acquire(path, FlockArg::LockExclusive)
    }

    /// Blocks until a shared lock on `path` is held.
    pub(crate) fn shared(path: &Path) -> std::io::Result<Self> {
        Self::acquire(path, FlockArg::LockShared)
    }

    fn acquire(path: &Path, arg: FlockArg) -> std::io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)?;
        let flock = Flock::lock(file, arg).map_err(|(_, errno)| std::io::Error::from(errno))?;
        Ok(Self { _flock: flock })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn exclusive_then_reacquire() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("x.lock");
        let lock = FileLock::exclusive(&path).unwrap();
        drop(lock);
        // Released on drop; a second acquisition must not deadlock.
        let _again = FileLock::exclusive(&path).unwrap();
    }

    #[test]
    fn shared_locks_coexist() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("x.lock");
        let _a = FileLock::shared(&path).unwrap();
        let _b = FileLock::shared(&path).unwrap();
    }
}
