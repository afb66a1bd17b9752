use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::thread;

use fs2::FileExt;
use tracing::debug;

use crate::config::LockPolicy;
use crate::error::StorageError;

/// Exclusive per-cell write lock backed by an advisory lock (`flock(2)`) on a
/// dedicated lock file.
///
/// The lock file is removed when the guard is dropped, before the descriptor
/// is closed. A peer that was waiting on the removed inode notices the
/// mismatch after acquiring it and retries on the fresh file.
#[derive(Debug)]
pub struct CellLock {
    path: PathBuf,
    _file: File,
}

/// Bound on immediate retries when the lock file is replaced under us.
const STALE_RETRIES: u32 = 16;

impl CellLock {
    /// Try to acquire the lock without blocking. Returns `Ok(None)` if
    /// another writer holds it.
    pub fn try_acquire(path: &Path) -> Result<Option<Self>, StorageError> {
        for _ in 0..STALE_RETRIES {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(path)?;

            if file.try_lock_exclusive().is_err() {
                return Ok(None);
            }

            if same_inode(path, &file)? {
                return Ok(Some(Self {
                    path: path.to_path_buf(),
                    _file: file,
                }));
            }
            debug!(path = %path.display(), "lock file replaced while acquiring, retrying");
        }
        Ok(None)
    }

    /// Acquire the lock, retrying with the policy's backoff.
    ///
    /// Gives up with [`StorageError::Locked`] after `policy.open_retries`
    /// failed attempts; waits indefinitely when that bound is `None`.
    pub fn acquire(path: &Path, policy: &LockPolicy) -> Result<Self, StorageError> {
        let mut attempts = 0u32;
        loop {
            if let Some(lock) = Self::try_acquire(path)? {
                return Ok(lock);
            }
            attempts += 1;
            if policy.open_retries.is_some_and(|max| attempts >= max) {
                return Err(StorageError::Locked(path.to_path_buf()));
            }
            thread::sleep(policy.backoff());
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Whether `path` still names the inode `file` refers to.
fn same_inode(path: &Path, file: &File) -> Result<bool, StorageError> {
    let held = file.metadata()?;
    match fs::metadata(path) {
        Ok(current) => Ok(current.dev() == held.dev() && current.ino() == held.ino()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

impl Drop for CellLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                debug!(path = %self.path.display(), error = %e, "failed to remove lock file");
            }
        }
        // The advisory lock is released when `_file` is closed.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_exclusive_lock() {
        let dir = tempdir().unwrap();
        let lock_path = dir.path().join("cell.tab.lock");

        let lock = CellLock::try_acquire(&lock_path).unwrap().unwrap();
        assert!(lock_path.exists());
        // flock is per open file description, so a second open conflicts.
        assert!(CellLock::try_acquire(&lock_path).unwrap().is_none());
        drop(lock);
    }

    #[test]
    fn test_lock_file_removed_on_drop() {
        let dir = tempdir().unwrap();
        let lock_path = dir.path().join("cell.tab.lock");

        {
            let _lock = CellLock::try_acquire(&lock_path).unwrap().unwrap();
        }
        assert!(!lock_path.exists());
        let _again = CellLock::try_acquire(&lock_path).unwrap().unwrap();
    }

    #[test]
    fn test_bounded_acquire_gives_up() {
        let dir = tempdir().unwrap();
        let lock_path = dir.path().join("cell.tab.lock");
        let _held = CellLock::try_acquire(&lock_path).unwrap().unwrap();

        let policy = LockPolicy {
            backoff_ms: 1,
            open_retries: Some(3),
            ..LockPolicy::default()
        };
        match CellLock::acquire(&lock_path, &policy) {
            Err(StorageError::Locked(p)) => assert_eq!(p, lock_path),
            other => panic!("expected Locked, got {other:?}"),
        }
    }

    #[test]
    fn test_waiter_acquires_after_release() {
        let dir = tempdir().unwrap();
        let lock_path = dir.path().join("cell.tab.lock");
        let held = CellLock::try_acquire(&lock_path).unwrap().unwrap();

        let p = lock_path.clone();
        let waiter = std::thread::spawn(move || {
            let policy = LockPolicy {
                backoff_ms: 1,
                ..LockPolicy::default()
            };
            CellLock::acquire(&p, &policy).map(|_| ())
        });
        std::thread::sleep(std::time::Duration::from_millis(20));
        drop(held);
        waiter.join().unwrap().unwrap();
    }
}
