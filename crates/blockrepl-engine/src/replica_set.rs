//! Replica set: the write entrypoint and lifecycle of one replicated
//! group.
//!
//! A write travels two channels. The payload is placed in the local
//! storage engine and pushed to peers over the data channel; only
//! `{header, key, pbas}` goes through consensus. PBAs allocated for a
//! write that never reaches a log entry are freed immediately.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use blockrepl_common::config::JournalConfig;
use blockrepl_common::constants::MAX_WRITE_SIZE;
use blockrepl_common::{
    FullyQualifiedPba, GroupId, Lsn, Pba, ReplError, ReplResult, ReplicaId,
};
use blockrepl_store::{LogStoreManager, SgList, StateStore, StorageEngine};

use crate::consensus::ConsensusLog;
use crate::data_channel::DataChannel;
use crate::entry::LogEntry;
use crate::listener::{ReplicaSetListener, UserCtx};
use crate::resolver::PbaResolver;
use crate::state_machine::ReplicaStateMachine;

/// One replicated group on this replica.
pub struct ReplicaSet {
    group_id: GroupId,
    replica_id: ReplicaId,
    engine: Arc<dyn StorageEngine>,
    channel: Arc<dyn DataChannel>,
    consensus: Arc<dyn ConsensusLog>,
    state_machine: Arc<ReplicaStateMachine>,
    resolver: Arc<PbaResolver>,
    state_store: Arc<StateStore>,
    span: tracing::Span,
    stopped: AtomicBool,
}

impl ReplicaSet {
    /// Assembles a replica set from its collaborators and wires the state
    /// machine into the consensus log.
    ///
    /// The set is not live until a listener is attached and
    /// [`ReplicaSet::start`] has run.
    pub fn new(
        replica_id: ReplicaId,
        engine: Arc<dyn StorageEngine>,
        channel: Arc<dyn DataChannel>,
        consensus: Arc<dyn ConsensusLog>,
        state_store: Arc<StateStore>,
        journal_cfg: JournalConfig,
        fetch_timeout: Duration,
    ) -> ReplResult<Arc<Self>> {
        let group_id = state_store.group_id();
        let resolver = Arc::new(PbaResolver::new(
            Arc::clone(&engine),
            Arc::clone(&channel),
            fetch_timeout,
        ));
        let state_machine = ReplicaStateMachine::new(
            group_id,
            Arc::clone(&state_store),
            Arc::clone(&engine),
            Arc::clone(&resolver),
            journal_cfg,
        )?;
        consensus.attach(state_machine.clone());

        Ok(Arc::new(Self {
            group_id,
            replica_id,
            engine,
            channel,
            consensus,
            state_machine,
            resolver,
            state_store,
            span: tracing::info_span!("replica_set", group = %group_id),
            stopped: AtomicBool::new(false),
        }))
    }

    /// Attaches the consumer listener.
    pub fn attach_listener(&self, listener: Box<dyn ReplicaSetListener>) {
        self.state_machine.attach_listener(listener);
    }

    /// Runs recovery and starts the consensus log.
    ///
    /// Recovery replays free-PBA records up to the committed frontier back
    /// into the engine, then lets consensus redeliver entries beyond it.
    pub fn start(&self) -> ReplResult<()> {
        let _guard = self.span.enter();
        self.state_machine.recover()?;
        self.consensus
            .start(self.state_store.last_commit_lsn().next())
    }

    /// Replicates a write to the replica set.
    ///
    /// Allocates PBAs for the payload, writes locally and pushes to peers
    /// concurrently, then appends `{header, key, pbas}` to the consensus
    /// log. Resolves with the entry's LSN once it is ordered; commit is
    /// reported through the listener (see
    /// [`ReplicaSet::wait_for_commit`]).
    pub async fn write(
        &self,
        header: Bytes,
        key: Bytes,
        value: SgList,
        ctx: UserCtx,
    ) -> ReplResult<Lsn> {
        if self.stopped.load(Ordering::Acquire) || self.state_machine.is_poisoned() {
            return Err(ReplError::Closed);
        }
        if value.len() > MAX_WRITE_SIZE {
            return Err(ReplError::invalid_argument(format!(
                "payload of {} bytes exceeds the write limit",
                value.len()
            )));
        }

        let pbas = self.engine.alloc_pbas(value.len())?;

        let write = self.engine.write(&pbas, &value);
        let push = self.channel.push(self.group_id, &pbas, &value);
        if let Err(e) = tokio::try_join!(write, push) {
            self.release_unreferenced(&pbas);
            return Err(e);
        }

        let entry = LogEntry::new(
            self.replica_id.clone(),
            header,
            key,
            pbas.clone(),
        );
        match self.consensus.append(entry, ctx).await {
            Ok(lsn) => {
                tracing::trace!(parent: &self.span, %lsn, "write ordered");
                Ok(lsn)
            }
            Err(e) => {
                self.release_unreferenced(&pbas);
                Err(e)
            }
        }
    }

    /// Resolves a fully-qualified (possibly remote) PBA to a local PBA,
    /// fetching and materializing the payload on a miss.
    pub async fn map_pba(&self, fqpba: FullyQualifiedPba) -> ReplResult<Pba> {
        self.resolver.map_pba(&fqpba).await
    }

    /// Transfers ownership of listener-held PBAs back to the engine; they
    /// are journaled at `lsn` and freed through the release pipeline.
    pub fn transfer_pba_ownership(&self, lsn: Lsn, pbas: &[Pba]) -> ReplResult<()> {
        self.state_machine.transfer_pba_ownership(lsn, pbas)
    }

    /// Checkpoints through `upto`, truncating the free-PBA journal.
    pub fn checkpoint(&self, upto: Lsn) -> ReplResult<()> {
        let _guard = self.span.enter();
        self.state_machine.checkpoint(upto)
    }

    /// Adds a member to the replica set.
    pub fn add_member(&self, replica: ReplicaId) -> ReplResult<()> {
        self.consensus.add_member(replica)
    }

    /// Waits until the committed frontier reaches `lsn`.
    pub async fn wait_for_commit(&self, lsn: Lsn) {
        self.state_machine.wait_for_commit(lsn).await;
    }

    /// Uuid of this replica set.
    pub fn group_id(&self) -> GroupId {
        self.group_id
    }

    /// Identity of the local replica.
    pub fn replica_id(&self) -> ReplicaId {
        self.replica_id.clone()
    }

    /// LSN up to which this replica has committed.
    pub fn commit_lsn(&self) -> Lsn {
        self.state_store.last_commit_lsn()
    }

    /// The remote→local resolution cache.
    pub fn resolver(&self) -> &Arc<PbaResolver> {
        &self.resolver
    }

    /// The durable state of this replica set.
    pub fn state_store(&self) -> &Arc<StateStore> {
        &self.state_store
    }

    /// Stops the replica set: no new writes, consensus stopped, commit
    /// thread drained, journal flushed, superblock persisted, listener
    /// notified.
    pub fn stop(&self) -> ReplResult<()> {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let _guard = self.span.enter();
        tracing::debug!("stopping replica set");
        self.consensus.stop()?;
        self.state_machine.stop()
    }

    /// Stops the replica set and removes its durable state: the free-PBA
    /// store, the data journal, and the superblock.
    pub fn destroy(&self, manager: &LogStoreManager) -> ReplResult<()> {
        self.stop()?;
        let _guard = self.span.enter();
        tracing::debug!("destroying replica set state");

        let data_journal_id = self.state_store.data_journal_id();
        self.state_store.destroy(manager)?;
        if data_journal_id.is_valid() {
            manager.remove(data_journal_id)?;
        }
        Ok(())
    }

    fn release_unreferenced(&self, pbas: &[Pba]) {
        // These blocks were never named by a log entry; no journal record
        // is needed before freeing them.
        for &pba in pbas {
            if let Err(e) = self.engine.free_pba(pba) {
                tracing::warn!(parent: &self.span, %pba, error = %e,
                    "failed to free unreferenced pba");
            }
        }
    }
}

impl std::fmt::Debug for ReplicaSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicaSet")
            .field("group_id", &self.group_id)
            .field("replica_id", &self.replica_id)
            .field("commit_lsn", &self.commit_lsn())
            .finish()
    }
}
