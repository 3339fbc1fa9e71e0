//! Advisory locks scoped to a backend data directory.
//!
//! A [`DirLock`] combines an in-process async mutex (one per directory) with an
//! exclusive OS file lock on `<dir>/.codevec.lock`, so writers in this process
//! and in other processes are serialized. Both are released on drop.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::OwnedMutexGuard;

use crate::error::{Result, StoreError};

pub const LOCK_FILE_NAME: &str = ".codevec.lock";

#[derive(Debug, Default)]
pub struct LockManager {
    locks: Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>,
}

impl LockManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn mutex_for(&self, dir: &Path) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(dir.to_path_buf()).or_default())
    }

    /// Acquire the lock for `dir`, creating the directory if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock file cannot be created or locked.
    pub async fn lock(&self, dir: &Path) -> Result<DirLock> {
        let guard = self.mutex_for(dir).lock_owned().await;
        let lock_path = dir.join(LOCK_FILE_NAME);
        let file = tokio::task::spawn_blocking(move || -> Result<File> {
            if let Some(parent) = lock_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new()
                .create(true)
                .truncate(false)
                .write(true)
                .open(&lock_path)?;
            fs4::fs_std::FileExt::lock_exclusive(&file)
                .map_err(|e| StoreError::Lock(format!("{}: {e}", lock_path.display())))?;
            Ok(file)
        })
        .await
        .map_err(|e| StoreError::Lock(e.to_string()))??;
        tracing::trace!(dir = %dir.display(), "directory lock acquired");
        Ok(DirLock {
            file,
            _guard: guard,
        })
    }
}

/// Held for the duration of one mutating backend call.
#[derive(Debug)]
pub struct DirLock {
    file: File,
    _guard: OwnedMutexGuard<()>,
}

impl Drop for DirLock {
    fn drop(&mut self) {
        if let Err(e) = fs4::fs_std::FileExt::unlock(&self.file) {
            tracing::warn!("failed to release directory lock: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn lock_creates_lock_file() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("db");
        let manager = LockManager::new();
        let lock = manager.lock(&db).await.unwrap();
        assert!(db.join(LOCK_FILE_NAME).exists());
        drop(lock);
        // reacquire after release
        let _again = manager.lock(&db).await.unwrap();
    }

    #[tokio::test]
    async fn same_directory_is_serialized() {
        let dir = tempfile::tempdir().unwrap();
        let manager = Arc::new(LockManager::new());
        let first = manager.lock(dir.path()).await.unwrap();

        let waiter = {
            let manager = Arc::clone(&manager);
            let path = dir.path().to_path_buf();
            tokio::spawn(async move { manager.lock(&path).await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        drop(first);
        tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn different_directories_do_not_block() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        let manager = LockManager::new();
        let _first = manager.lock(a.path()).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), manager.lock(b.path()))
            .await
            .unwrap()
            .unwrap();
    }
}
