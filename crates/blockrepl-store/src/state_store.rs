//! Per-replica-set state-machine store.
//!
//! Owns the replica set's superblock and its free-PBA journal. The
//! in-memory superblock copy sits behind a read/write lock; the commit LSN
//! is additionally published through an atomic so the hot read path takes
//! no lock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use blockrepl_common::{GroupId, LogStoreId, Lsn, Pba, PbaList, ReplResult};

use crate::free_pba::FreePbaJournal;
use crate::log_store::LogStoreManager;
use crate::superblock::{ReplicaSuperblock, SuperblockStore};

/// Durable state of one replica set: superblock plus free-PBA journal.
pub struct StateStore {
    sb_store: Arc<SuperblockStore>,
    sb_in_mem: RwLock<ReplicaSuperblock>,
    commit_lsn: AtomicU64,
    journal: FreePbaJournal,
}

impl StateStore {
    /// Creates the durable state for a brand-new replica set.
    ///
    /// Allocates the free-PBA log store, records its id in a fresh
    /// superblock together with the data-journal id, and persists the
    /// superblock.
    pub fn create(
        sb_store: Arc<SuperblockStore>,
        manager: &LogStoreManager,
        uuid: GroupId,
        data_journal_id: LogStoreId,
    ) -> ReplResult<Self> {
        let (free_pba_store_id, free_pba_store) = manager.create()?;
        tracing::debug!(%uuid, %free_pba_store_id, "created free-pba record log store");

        let sb = ReplicaSuperblock::new(uuid, free_pba_store_id, data_journal_id);
        sb_store.persist(&sb)?;

        Ok(Self {
            sb_store,
            commit_lsn: AtomicU64::new(sb.commit_lsn.as_u64()),
            sb_in_mem: RwLock::new(sb),
            journal: FreePbaJournal::new(free_pba_store),
        })
    }

    /// Builds the state over an externally supplied free-PBA log store.
    ///
    /// This is the seam for embedders whose log stores come from an
    /// external backend rather than the in-tree manager; the superblock
    /// must already name the store.
    pub fn with_journal_store(
        sb_store: Arc<SuperblockStore>,
        sb: ReplicaSuperblock,
        journal_store: Arc<dyn crate::log_store::LogStore>,
    ) -> Self {
        Self {
            sb_store,
            commit_lsn: AtomicU64::new(sb.commit_lsn.as_u64()),
            sb_in_mem: RwLock::new(sb),
            journal: FreePbaJournal::new(journal_store),
        }
    }

    /// Opens the durable state of an existing replica set from its
    /// superblock.
    pub fn open(
        sb_store: Arc<SuperblockStore>,
        manager: &LogStoreManager,
        sb: ReplicaSuperblock,
    ) -> ReplResult<Self> {
        tracing::debug!(uuid = %sb.uuid, store = %sb.free_pba_store_id,
            "opening free-pba record log store");
        let free_pba_store = manager.open_store(sb.free_pba_store_id)?;

        Ok(Self {
            sb_store,
            commit_lsn: AtomicU64::new(sb.commit_lsn.as_u64()),
            sb_in_mem: RwLock::new(sb),
            journal: FreePbaJournal::new(free_pba_store),
        })
    }

    /// Uuid of the replica set.
    pub fn group_id(&self) -> GroupId {
        self.sb_in_mem.read().uuid
    }

    /// Log store id of the data journal.
    pub fn data_journal_id(&self) -> LogStoreId {
        self.sb_in_mem.read().data_journal_id
    }

    /// LSN up to which this replica has committed. Lock-free.
    pub fn last_commit_lsn(&self) -> Lsn {
        Lsn::new(self.commit_lsn.load(Ordering::Acquire))
    }

    /// Advances the in-memory commit LSN.
    ///
    /// Only stages the superblock; call [`StateStore::persist_superblock`]
    /// to make it durable.
    pub fn set_commit_lsn(&self, lsn: Lsn) {
        self.sb_in_mem.write().commit_lsn = lsn;
        self.commit_lsn.store(lsn.as_u64(), Ordering::Release);
    }

    /// LSN up to which this replica has checkpointed.
    pub fn checkpoint_lsn(&self) -> Lsn {
        self.sb_in_mem.read().checkpoint_lsn
    }

    /// Stages a new checkpoint LSN.
    pub fn set_checkpoint_lsn(&self, lsn: Lsn) {
        self.sb_in_mem.write().checkpoint_lsn = lsn;
    }

    /// Persists the staged superblock.
    pub fn persist_superblock(&self) -> ReplResult<()> {
        let sb = self.sb_in_mem.read().clone();
        self.sb_store.persist(&sb)
    }

    /// Records the PBAs released at `lsn`. Must be durable (see
    /// [`StateStore::flush_free_pba_records`]) before any of them is
    /// physically freed.
    pub fn add_free_pba_record(&self, lsn: Lsn, pbas: &[Pba]) -> ReplResult<()> {
        self.journal.append(lsn, pbas)
    }

    /// Replays free-PBA records with `start_lsn <= lsn < end_lsn`.
    pub fn get_free_pba_records(
        &self,
        start_lsn: Lsn,
        end_lsn: Lsn,
        visitor: &mut dyn FnMut(Lsn, PbaList),
    ) -> ReplResult<()> {
        self.journal.replay(start_lsn, end_lsn, visitor)
    }

    /// Drops free-PBA records with `lsn <= upto` after a checkpoint.
    pub fn remove_free_pba_records_upto(&self, upto: Lsn) -> ReplResult<()> {
        self.journal.truncate_upto(upto)
    }

    /// Forces durability of appended free-PBA records.
    pub fn flush_free_pba_records(&self) -> ReplResult<()> {
        self.journal.sync()
    }

    /// Physically removes the replica set's durable state: the free-PBA
    /// log store and the superblock.
    pub fn destroy(&self, manager: &LogStoreManager) -> ReplResult<()> {
        let sb = self.sb_in_mem.read().clone();
        tracing::debug!(uuid = %sb.uuid, store = %sb.free_pba_store_id,
            "removing replica set state");
        manager.remove(sb.free_pba_store_id)?;
        self.sb_store.remove(sb.uuid)
    }
}

impl std::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStore")
            .field("group_id", &self.group_id())
            .field("commit_lsn", &self.last_commit_lsn())
            .finish()
    }
}
