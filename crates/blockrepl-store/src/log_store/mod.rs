//! Append-only, index-addressed durable log stores.
//!
//! A log store is addressed by [`StoreLsn`] and survives restart with
//! entries in the order they were written. It backs both the consensus data
//! journal and the free-PBA journal.

mod file;
mod manager;
mod memory;

pub use file::FileLogStore;
pub use manager::LogStoreManager;
pub use memory::MemoryLogStore;

use bytes::Bytes;

use blockrepl_common::{ReplResult, StoreLsn};

/// Trait for durable, index-addressed log stores.
///
/// Writes are buffered and non-blocking; durability is established by
/// [`LogStore::sync_upto`]. Appending at an index that already holds a
/// record overwrites it — replay after a crash re-issues writes for the
/// same index and must be idempotent.
pub trait LogStore: Send + Sync {
    /// Appends a record at the given index.
    ///
    /// The payload buffer is released when the write completes; callers must
    /// not assume durability until a sync covering this index returns.
    fn append(&self, lsn: StoreLsn, payload: Bytes) -> ReplResult<()>;

    /// Scans records in ascending index order starting at `from` (inclusive).
    ///
    /// The visitor returns `true` to continue, `false` to stop.
    fn scan(
        &self,
        from: StoreLsn,
        visitor: &mut dyn FnMut(StoreLsn, &[u8]) -> bool,
    ) -> ReplResult<()>;

    /// Physically removes all records at index <= `upto`.
    fn truncate_upto(&self, upto: StoreLsn) -> ReplResult<()>;

    /// Forces durability of all records at index <= `upto`.
    ///
    /// `None` means there is nothing to sync and is a no-op.
    fn sync_upto(&self, upto: Option<StoreLsn>) -> ReplResult<()>;

    /// Returns the highest index holding a record, if any.
    fn last_lsn(&self) -> Option<StoreLsn>;
}
