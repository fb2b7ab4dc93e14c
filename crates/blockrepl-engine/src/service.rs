//! Replication service: the replica-set directory.
//!
//! Owns the storage engine, the log-store manager, and the superblock
//! directory. At startup it scans for surviving superblocks, asks the
//! consumer for a listener for each replica set it finds, and re-opens
//! them — recovery runs before each set's consensus log starts.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use blockrepl_common::config::{EngineKind, ReplicationConfig};
use blockrepl_common::{GroupId, ReplError, ReplResult};
use blockrepl_store::{
    FileStorageEngine, LogStoreManager, ReplicaSuperblock, StateStore, StorageEngine,
    SuperblockStore,
};

use crate::consensus::InProcessConsensusLog;
use crate::data_channel::DataChannel;
use crate::listener::ReplicaSetListener;
use crate::replica_set::ReplicaSet;

/// Builds the listener for a replica set, invoked when a set is created or
/// re-identified at startup.
pub type ListenerFactory =
    Box<dyn Fn(&Arc<ReplicaSet>) -> Box<dyn ReplicaSetListener> + Send + Sync>;

/// Directory and lifecycle owner of this replica's replica sets.
pub struct ReplicationService {
    config: ReplicationConfig,
    engine: Arc<dyn StorageEngine>,
    channel: Arc<dyn DataChannel>,
    manager: Arc<LogStoreManager>,
    sb_store: Arc<SuperblockStore>,
    listener_factory: ListenerFactory,
    sets: Mutex<HashMap<GroupId, Arc<ReplicaSet>>>,
}

impl ReplicationService {
    /// Opens the service, building the configured engine backend and
    /// re-opening every replica set whose superblock survives on disk.
    pub fn open(
        config: ReplicationConfig,
        channel: Arc<dyn DataChannel>,
        listener_factory: ListenerFactory,
    ) -> ReplResult<Arc<Self>> {
        config.validate().map_err(ReplError::invalid_argument)?;

        let engine = Self::build_engine(&config)?;
        if config.engine == EngineKind::File {
            // The file backend brings its own log stores; the log-store
            // selection only matters when an external engine is linked.
            tracing::debug!(selected = ?config.log_store, "log store selection ignored");
        }
        let manager = Arc::new(LogStoreManager::open(config.data_dir.join("logs"))?);
        let sb_store = Arc::new(SuperblockStore::open(config.data_dir.join("superblocks"))?);

        let service = Arc::new(Self {
            config,
            engine,
            channel,
            manager,
            sb_store,
            listener_factory,
            sets: Mutex::new(HashMap::new()),
        });

        let surviving = service.sb_store.scan()?;
        tracing::info!(
            replica = %service.config.replica_id,
            replica_sets = surviving.len(),
            "replication service opening"
        );
        for sb in surviving {
            service.reopen_replica_set(sb)?;
        }

        Ok(service)
    }

    /// Creates a new replica set with the given uuid.
    pub fn create_replica_set(&self, uuid: GroupId) -> ReplResult<Arc<ReplicaSet>> {
        if self.sets.lock().contains_key(&uuid) {
            return Err(ReplError::invalid_argument(format!(
                "replica set {uuid} already exists"
            )));
        }

        let (data_journal_id, data_journal) = self.manager.create()?;
        let state_store = Arc::new(StateStore::create(
            Arc::clone(&self.sb_store),
            &self.manager,
            uuid,
            data_journal_id,
        )?);
        let consensus = InProcessConsensusLog::new(data_journal, true);

        tracing::info!(group = %uuid, "created replica set");
        self.assemble(state_store, consensus)
    }

    /// Looks up a replica set by uuid.
    pub fn lookup_replica_set(&self, uuid: GroupId) -> Option<Arc<ReplicaSet>> {
        self.sets.lock().get(&uuid).cloned()
    }

    /// Visits every replica set in the directory.
    pub fn iterate_replica_sets(&self, visitor: &mut dyn FnMut(&Arc<ReplicaSet>)) {
        for set in self.sets.lock().values() {
            visitor(set);
        }
    }

    /// Stops a replica set and removes its durable state.
    pub fn remove_replica_set(&self, uuid: GroupId) -> ReplResult<()> {
        let set = self
            .sets
            .lock()
            .remove(&uuid)
            .ok_or(ReplError::ReplicaSetNotFound { group_id: uuid })?;
        set.destroy(&self.manager)
    }

    /// Stops every replica set.
    pub fn shutdown(&self) -> ReplResult<()> {
        let sets: Vec<_> = self.sets.lock().values().cloned().collect();
        for set in sets {
            set.stop()?;
        }
        self.engine.flush()?;
        tracing::info!(replica = %self.config.replica_id, "replication service stopped");
        Ok(())
    }

    /// The storage engine backing this service.
    pub fn engine(&self) -> &Arc<dyn StorageEngine> {
        &self.engine
    }

    /// The log-store manager backing this service.
    pub fn manager(&self) -> &Arc<LogStoreManager> {
        &self.manager
    }

    fn build_engine(config: &ReplicationConfig) -> ReplResult<Arc<dyn StorageEngine>> {
        match config.engine {
            EngineKind::File => {
                let engine = FileStorageEngine::open(
                    config.data_dir.join("engine"),
                    config.storage.block_size,
                    config.storage.capacity_blocks,
                    config.storage.sync_writes,
                )?;
                Ok(engine)
            }
            EngineKind::Home | EngineKind::Jungle => Err(ReplError::not_supported(format!(
                "storage engine backend {:?} is not linked into this build",
                config.engine
            ))),
        }
    }

    fn reopen_replica_set(&self, sb: ReplicaSuperblock) -> ReplResult<Arc<ReplicaSet>> {
        tracing::info!(group = %sb.uuid, commit_lsn = %sb.commit_lsn, "re-opening replica set");
        let data_journal = self.manager.open_store(sb.data_journal_id)?;
        let state_store = Arc::new(StateStore::open(
            Arc::clone(&self.sb_store),
            &self.manager,
            sb,
        )?);
        let consensus = InProcessConsensusLog::new(data_journal, true);
        self.assemble(state_store, consensus)
    }

    fn assemble(
        &self,
        state_store: Arc<StateStore>,
        consensus: Arc<InProcessConsensusLog>,
    ) -> ReplResult<Arc<ReplicaSet>> {
        let set = ReplicaSet::new(
            self.config.replica_id(),
            Arc::clone(&self.engine),
            Arc::clone(&self.channel),
            consensus,
            state_store,
            self.config.journal.clone(),
            self.config.fetch_timeout(),
        )?;

        let listener = (self.listener_factory)(&set);
        set.attach_listener(listener);
        set.start()?;

        self.sets.lock().insert(set.group_id(), Arc::clone(&set));
        Ok(set)
    }
}

impl std::fmt::Debug for ReplicationService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicationService")
            .field("replica", &self.config.replica_id)
            .field("replica_sets", &self.sets.lock().len())
            .finish()
    }
}
