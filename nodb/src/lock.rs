use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Shared lock for one file on disk.
pub type FileLock = Arc<RwLock<()>>;

/// Registry of read-write locks keyed by file path.
///
/// Every handle that touches a given file asks the registry for its lock,
/// so load, mutate and persist on that file happen as one unit. Writers take
/// the write half; readers take the read half and therefore wait for any
/// in-flight write.
#[derive(Debug, Default)]
pub struct LockRegistry {
    locks: Mutex<HashMap<PathBuf, FileLock>>,
}

static GLOBAL: Lazy<LockRegistry> = Lazy::new(LockRegistry::new);

impl LockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The registry shared by every database handle in this process.
    pub fn global() -> &'static LockRegistry {
        &GLOBAL
    }

    /// Get the lock for `path`, creating it on first use.
    pub fn get_lock(&self, path: &Path) -> FileLock {
        let mut locks = self.locks.lock();
        locks
            .entry(path.to_path_buf())
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }
}
