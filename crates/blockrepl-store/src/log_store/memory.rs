//! In-memory log store for testing.
//!
//! Behaves like the file store minus durability, and supports failure
//! injection so tests can exercise the journal-write failure path.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use parking_lot::RwLock;

use blockrepl_common::{ReplError, ReplResult, StoreLsn};

use super::LogStore;

/// In-memory log store for tests.
#[derive(Debug, Default)]
pub struct MemoryLogStore {
    records: RwLock<BTreeMap<u64, Bytes>>,
    /// When set, the next append fails with `LogStoreFailure`.
    fail_next_append: AtomicBool,
}

impl MemoryLogStore {
    /// Creates a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next append fail, then clears the flag.
    pub fn fail_next_append(&self) {
        self.fail_next_append.store(true, Ordering::Release);
    }

    /// Returns the number of records.
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// Returns true if the store holds no records.
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

impl LogStore for MemoryLogStore {
    fn append(&self, lsn: StoreLsn, payload: Bytes) -> ReplResult<()> {
        if self.fail_next_append.swap(false, Ordering::AcqRel) {
            return Err(ReplError::log_store("injected append failure"));
        }
        self.records.write().insert(lsn.as_u64(), payload);
        Ok(())
    }

    fn scan(
        &self,
        from: StoreLsn,
        visitor: &mut dyn FnMut(StoreLsn, &[u8]) -> bool,
    ) -> ReplResult<()> {
        let records = self.records.read();
        for (&lsn, payload) in records.range(from.as_u64()..) {
            if !visitor(StoreLsn::new(lsn), payload) {
                break;
            }
        }
        Ok(())
    }

    fn truncate_upto(&self, upto: StoreLsn) -> ReplResult<()> {
        let mut records = self.records.write();
        *records = records.split_off(&(upto.as_u64() + 1));
        Ok(())
    }

    fn sync_upto(&self, _upto: Option<StoreLsn>) -> ReplResult<()> {
        Ok(())
    }

    fn last_lsn(&self) -> Option<StoreLsn> {
        self.records
            .read()
            .keys()
            .next_back()
            .map(|&lsn| StoreLsn::new(lsn))
    }
}
