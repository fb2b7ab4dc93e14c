//! Log store creation and lookup by id.
//!
//! The manager owns a directory of log-store files named
//! `store_<id>.log`. Ids recorded in a replica-set superblock are resolved
//! back to their stores here after restart.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use blockrepl_common::{LogStoreId, ReplError, ReplResult};

use super::FileLogStore;

/// Creates, opens, and removes log stores under one directory.
pub struct LogStoreManager {
    dir: PathBuf,
    next_id: AtomicU32,
    open: Mutex<HashMap<LogStoreId, Arc<FileLogStore>>>,
}

impl LogStoreManager {
    /// Opens a manager over `dir`, creating it if needed. Existing store
    /// files determine the next id to hand out.
    pub fn open(dir: impl AsRef<Path>) -> ReplResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let mut max_id = 0u32;
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            if let Some(id) = Self::parse_store_id(&entry.path()) {
                max_id = max_id.max(id + 1);
            }
        }

        Ok(Self {
            dir,
            next_id: AtomicU32::new(max_id),
            open: Mutex::new(HashMap::new()),
        })
    }

    /// Creates a new empty log store and returns its id and handle.
    pub fn create(&self) -> ReplResult<(LogStoreId, Arc<FileLogStore>)> {
        let id = LogStoreId::new(self.next_id.fetch_add(1, Ordering::AcqRel));
        let store = Arc::new(FileLogStore::open(self.store_path(id))?);
        self.open.lock().insert(id, Arc::clone(&store));
        Ok((id, store))
    }

    /// Opens the log store with the given id, replaying its records.
    ///
    /// Returns the already-open handle if the store is in use.
    pub fn open_store(&self, id: LogStoreId) -> ReplResult<Arc<FileLogStore>> {
        let mut open = self.open.lock();
        if let Some(store) = open.get(&id) {
            return Ok(Arc::clone(store));
        }

        let path = self.store_path(id);
        if !path.exists() {
            return Err(ReplError::invalid_argument(format!(
                "log store {id} does not exist"
            )));
        }
        let store = Arc::new(FileLogStore::open(path)?);
        open.insert(id, Arc::clone(&store));
        Ok(store)
    }

    /// Closes and physically removes the log store with the given id.
    pub fn remove(&self, id: LogStoreId) -> ReplResult<()> {
        if let Some(store) = self.open.lock().remove(&id) {
            store.close()?;
        }
        let path = self.store_path(id);
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }

    /// Returns the directory this manager owns.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn store_path(&self, id: LogStoreId) -> PathBuf {
        self.dir.join(format!("store_{:08}.log", id.as_u32()))
    }

    fn parse_store_id(path: &Path) -> Option<u32> {
        let name = path.file_name()?.to_str()?;
        let id = name.strip_prefix("store_")?.strip_suffix(".log")?;
        id.parse().ok()
    }
}
