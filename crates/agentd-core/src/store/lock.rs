//! Per-path write locks
//!
//! One async mutex per file path. Callers must route every read-modify-write
//! of a persisted file through the lock for that path; paths are compared as
//! given, so all access must go through [`UserPaths`](super::UserPaths).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};

/// Lock table keyed by file path
#[derive(Default)]
pub struct PathLocks {
    locks: std::sync::Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl PathLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for a path, creating it on first use
    pub async fn lock(&self, path: impl AsRef<Path>) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap();
            locks
                .entry(path.as_ref().to_path_buf())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}
