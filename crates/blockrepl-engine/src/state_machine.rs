//! Replica state machine.
//!
//! Receives the consensus hooks, owns the user listener, and enforces the
//! PBA release pipeline: PBAs a listener returns from `on_commit` are
//! journaled durably before the commit LSN advances and before the storage
//! engine is ever told to free them. Commits are applied by one dedicated
//! thread per replica set, in strictly increasing LSN order.

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, SyncSender};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;
use tokio::sync::watch;

use blockrepl_common::config::{JournalConfig, SyncPolicy};
use blockrepl_common::constants::COMMIT_QUEUE_DEPTH;
use blockrepl_common::{FullyQualifiedPba, GroupId, Lsn, Pba, ReplError, ReplResult};
use blockrepl_store::{StateStore, StorageEngine};

use crate::consensus::StateMachineHooks;
use crate::entry::LogEntry;
use crate::listener::{ReplicaSetListener, UserCtx};
use crate::resolver::PbaResolver;

enum CommitMsg {
    Commit { lsn: Lsn, entry: LogEntry },
    Flush { reply: mpsc::Sender<ReplResult<()>> },
    Stop,
}

struct StateMachineInner {
    group_id: GroupId,
    listener: Mutex<Option<Box<dyn ReplicaSetListener>>>,
    state_store: Arc<StateStore>,
    engine: Arc<dyn StorageEngine>,
    resolver: Arc<PbaResolver>,
    journal_cfg: JournalConfig,
    /// Highest index whose pre-commit has fired; guards index ordering.
    precommitted: Mutex<u64>,
    /// Leader-side write contexts awaiting their commit, keyed by LSN.
    pending_ctx: Mutex<HashMap<u64, Arc<dyn Any + Send + Sync>>>,
    /// Physical frees deferred until the journal is known durable.
    pending_frees: Mutex<Vec<Pba>>,
    commits_since_persist: AtomicU64,
    /// Set after a commit-thread failure; the replica set stops advancing.
    poisoned: AtomicBool,
    commit_watch: watch::Sender<u64>,
}

impl StateMachineInner {
    fn do_pre_commit(&self, lsn: Lsn, entry: &LogEntry) {
        let mut last = self.precommitted.lock();
        if lsn.as_u64() <= *last {
            return;
        }

        let ctx = self.pending_ctx.lock().get(&lsn.as_u64()).map(Arc::clone);
        if let Some(listener) = self.listener.lock().as_mut() {
            listener.on_pre_commit(lsn, &entry.header, &entry.key, ctx);
        }
        *last = lsn.as_u64();
    }

    fn do_rollback(&self, lsn: Lsn, entry: &LogEntry) {
        let mut last = self.precommitted.lock();
        let ctx = self.pending_ctx.lock().remove(&lsn.as_u64());
        if let Some(listener) = self.listener.lock().as_mut() {
            listener.on_rollback(lsn, &entry.header, &entry.key, ctx);
        }
        // The index will be redelivered with a new entry.
        if *last >= lsn.as_u64() {
            *last = lsn.as_u64() - 1;
        }
    }

    /// Applies one commit on the commit thread.
    fn apply_commit(&self, lsn: Lsn, entry: &LogEntry) -> ReplResult<()> {
        self.do_pre_commit(lsn, entry);

        let ctx = self.pending_ctx.lock().remove(&lsn.as_u64());
        let released = match self.listener.lock().as_mut() {
            Some(listener) => {
                listener.on_commit(lsn, &entry.header, &entry.key, &entry.pbas, ctx)
            }
            None => Vec::new(),
        };
        let freed: Vec<Pba> = released.iter().map(|&(pba, _)| pba).collect();

        // The record must exist (and under EveryCommit, be durable) before
        // the commit LSN moves and before any physical free.
        self.state_store.add_free_pba_record(lsn, &freed)?;
        if self.journal_cfg.sync_policy == SyncPolicy::EveryCommit {
            self.state_store.flush_free_pba_records()?;
        }

        self.state_store.set_commit_lsn(lsn);
        let committed = self.commits_since_persist.fetch_add(1, Ordering::AcqRel) + 1;
        if committed >= self.journal_cfg.superblock_flush_interval {
            self.state_store.flush_free_pba_records()?;
            self.state_store.persist_superblock()?;
            self.commits_since_persist.store(0, Ordering::Release);
        }

        match self.journal_cfg.sync_policy {
            SyncPolicy::EveryCommit => {
                for pba in freed {
                    self.engine.free_pba(pba)?;
                }
            }
            SyncPolicy::Checkpoint => {
                self.pending_frees.lock().extend(freed);
            }
        }

        // The local copy is canonical once the entry commits.
        for &pba in &entry.pbas {
            self.resolver
                .evict(&FullyQualifiedPba::new(entry.origin.clone(), pba));
        }

        self.commit_watch.send_replace(lsn.as_u64());
        tracing::trace!(group = %self.group_id, %lsn, "commit applied");
        Ok(())
    }

    /// Makes journaled state durable and applies deferred frees.
    fn flush(&self) -> ReplResult<()> {
        self.state_store.flush_free_pba_records()?;

        let frees: Vec<Pba> = std::mem::take(&mut *self.pending_frees.lock());
        for pba in frees {
            self.engine.free_pba(pba)?;
        }

        self.engine.flush()?;
        self.state_store.persist_superblock()?;
        self.commits_since_persist.store(0, Ordering::Release);
        Ok(())
    }

    fn run_commit_loop(&self, rx: mpsc::Receiver<CommitMsg>) {
        let mut last_committed = self.state_store.last_commit_lsn().as_u64();

        while let Ok(msg) = rx.recv() {
            match msg {
                CommitMsg::Commit { lsn, entry } => {
                    if self.poisoned.load(Ordering::Acquire) {
                        tracing::warn!(group = %self.group_id, %lsn,
                            "dropping commit on poisoned replica set");
                        continue;
                    }
                    if lsn.as_u64() <= last_committed {
                        // Redelivery of an already applied entry.
                        continue;
                    }

                    match self.apply_commit(lsn, &entry) {
                        Ok(()) => last_committed = lsn.as_u64(),
                        Err(e) => {
                            tracing::error!(group = %self.group_id, %lsn, error = %e,
                                "commit failed; halting replica set");
                            self.poisoned.store(true, Ordering::Release);
                        }
                    }
                }
                CommitMsg::Flush { reply } => {
                    let _ = reply.send(self.flush());
                }
                CommitMsg::Stop => break,
            }
        }
    }
}

/// Per-replica-set state machine driven by the consensus log.
pub struct ReplicaStateMachine {
    inner: Arc<StateMachineInner>,
    commit_tx: Mutex<Option<SyncSender<CommitMsg>>>,
    commit_thread: Mutex<Option<JoinHandle<()>>>,
    commit_watch_rx: watch::Receiver<u64>,
}

impl ReplicaStateMachine {
    /// Creates the state machine and spawns its commit thread.
    pub fn new(
        group_id: GroupId,
        state_store: Arc<StateStore>,
        engine: Arc<dyn StorageEngine>,
        resolver: Arc<PbaResolver>,
        journal_cfg: JournalConfig,
    ) -> ReplResult<Arc<Self>> {
        let initial_commit = state_store.last_commit_lsn().as_u64();
        let (watch_tx, watch_rx) = watch::channel(initial_commit);

        let inner = Arc::new(StateMachineInner {
            group_id,
            listener: Mutex::new(None),
            state_store,
            engine,
            resolver,
            journal_cfg,
            precommitted: Mutex::new(initial_commit),
            pending_ctx: Mutex::new(HashMap::new()),
            pending_frees: Mutex::new(Vec::new()),
            commits_since_persist: AtomicU64::new(0),
            poisoned: AtomicBool::new(false),
            commit_watch: watch_tx,
        });

        let (tx, rx) = mpsc::sync_channel(COMMIT_QUEUE_DEPTH);
        let thread_inner = Arc::clone(&inner);
        let thread = std::thread::Builder::new()
            .name(format!("commit-{group_id}"))
            .spawn(move || thread_inner.run_commit_loop(rx))?;

        Ok(Arc::new(Self {
            inner,
            commit_tx: Mutex::new(Some(tx)),
            commit_thread: Mutex::new(Some(thread)),
            commit_watch_rx: watch_rx,
        }))
    }

    /// Attaches the user listener. Hooks arriving before this are applied
    /// without listener callbacks.
    pub fn attach_listener(&self, listener: Box<dyn ReplicaSetListener>) {
        *self.inner.listener.lock() = Some(listener);
    }

    /// Replays the free-PBA journal up to the committed frontier, handing
    /// each recorded PBA back to the engine. Frees are idempotent, so
    /// records covering already-freed blocks are harmless.
    pub fn recover(&self) -> ReplResult<()> {
        let commit_lsn = self.inner.state_store.last_commit_lsn();
        if !commit_lsn.is_valid() {
            return Ok(());
        }

        let engine = Arc::clone(&self.inner.engine);
        let mut replayed = 0usize;
        let mut free_err = None;
        self.inner.state_store.get_free_pba_records(
            Lsn::FIRST,
            commit_lsn.next(),
            &mut |_, pbas| {
                for pba in pbas {
                    if let Err(e) = engine.free_pba(pba) {
                        free_err.get_or_insert(e);
                    }
                    replayed += 1;
                }
            },
        )?;

        if let Some(e) = free_err {
            return Err(e);
        }
        tracing::debug!(group = %self.inner.group_id, %commit_lsn, replayed,
            "replayed free-pba records");
        Ok(())
    }

    /// LSN up to which this replica has committed.
    pub fn commit_lsn(&self) -> Lsn {
        self.inner.state_store.last_commit_lsn()
    }

    /// Returns true after a fatal commit-thread error.
    pub fn is_poisoned(&self) -> bool {
        self.inner.poisoned.load(Ordering::Acquire)
    }

    /// Waits until the committed frontier reaches `lsn`.
    pub async fn wait_for_commit(&self, lsn: Lsn) {
        let mut rx = self.commit_watch_rx.clone();
        while *rx.borrow() < lsn.as_u64() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Hands PBAs owned by the listener back to the engine outside a
    /// commit. They are journaled at `lsn` and freed through the same
    /// release pipeline.
    pub fn transfer_pba_ownership(&self, lsn: Lsn, pbas: &[Pba]) -> ReplResult<()> {
        self.inner.state_store.add_free_pba_record(lsn, pbas)?;
        match self.inner.journal_cfg.sync_policy {
            SyncPolicy::EveryCommit => {
                self.inner.state_store.flush_free_pba_records()?;
                for &pba in pbas {
                    self.inner.engine.free_pba(pba)?;
                }
            }
            SyncPolicy::Checkpoint => {
                self.inner.pending_frees.lock().extend_from_slice(pbas);
            }
        }
        Ok(())
    }

    /// Flushes journaled state through the commit thread, so the flush
    /// serializes after every commit already queued.
    pub fn flush(&self) -> ReplResult<()> {
        let tx = self
            .commit_tx
            .lock()
            .clone()
            .ok_or(ReplError::Closed)?;
        let (reply_tx, reply_rx) = mpsc::channel();
        tx.send(CommitMsg::Flush { reply: reply_tx })
            .map_err(|_| ReplError::Closed)?;
        reply_rx.recv().map_err(|_| ReplError::Closed)?
    }

    /// Checkpoints through `upto`: flushes, truncates the free-PBA journal,
    /// and persists the new checkpoint LSN.
    pub fn checkpoint(&self, upto: Lsn) -> ReplResult<()> {
        self.flush()?;
        self.inner.state_store.remove_free_pba_records_upto(upto)?;
        self.inner.state_store.set_checkpoint_lsn(upto);
        self.inner.state_store.persist_superblock()
    }

    /// Drains the commit thread, flushes the journal, persists the
    /// superblock, and notifies the listener.
    pub fn stop(&self) -> ReplResult<()> {
        let tx = self.commit_tx.lock().take();
        let Some(tx) = tx else {
            return Ok(()); // already stopped
        };
        let _ = tx.send(CommitMsg::Stop);
        drop(tx);
        if let Some(thread) = self.commit_thread.lock().take() {
            let _ = thread.join();
        }

        self.inner.flush()?;
        if let Some(listener) = self.inner.listener.lock().as_mut() {
            listener.on_replica_stop();
        }
        tracing::debug!(group = %self.inner.group_id, "replica state machine stopped");
        Ok(())
    }
}

impl StateMachineHooks for ReplicaStateMachine {
    fn on_leader_pre_commit(&self, lsn: Lsn, entry: &LogEntry, ctx: UserCtx) {
        if let Some(ctx) = ctx {
            self.inner.pending_ctx.lock().insert(lsn.as_u64(), ctx);
        }
        self.inner.do_pre_commit(lsn, entry);
    }

    fn on_pre_commit(&self, lsn: Lsn, entry: &LogEntry) {
        self.inner.do_pre_commit(lsn, entry);
    }

    fn on_commit(&self, lsn: Lsn, entry: LogEntry) {
        let tx = self.commit_tx.lock().clone();
        match tx {
            Some(tx) => {
                if tx.send(CommitMsg::Commit { lsn, entry }).is_err() {
                    tracing::error!(group = %self.inner.group_id, %lsn,
                        "commit thread is gone; entry dropped");
                }
            }
            None => {
                tracing::warn!(group = %self.inner.group_id, %lsn,
                    "commit delivered after stop; entry dropped");
            }
        }
    }

    fn on_rollback(&self, lsn: Lsn, entry: &LogEntry) {
        self.inner.do_rollback(lsn, entry);
    }
}

impl std::fmt::Debug for ReplicaStateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicaStateMachine")
            .field("group_id", &self.inner.group_id)
            .field("commit_lsn", &self.commit_lsn())
            .field("poisoned", &self.is_poisoned())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_channel::DataFabric;
    use crate::listener::{ListenerEvent, RecordingListener};
    use blockrepl_common::config::JournalConfig;
    use blockrepl_common::{GroupId, LogStoreId};
    use blockrepl_store::{LogStoreManager, MemoryStorageEngine, SuperblockStore};
    use bytes::Bytes;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Fixture {
        _tmp: TempDir,
        engine: Arc<MemoryStorageEngine>,
        sm: Arc<ReplicaStateMachine>,
    }

    fn fixture(journal_cfg: JournalConfig) -> (Fixture, crate::listener::RecordingHandle) {
        let tmp = TempDir::new().unwrap();
        let sb_store = Arc::new(SuperblockStore::open(tmp.path().join("sb")).unwrap());
        let manager = LogStoreManager::open(tmp.path().join("logs")).unwrap();
        let state_store = Arc::new(
            StateStore::create(sb_store, &manager, GroupId::generate(), LogStoreId::INVALID)
                .unwrap(),
        );

        let engine = MemoryStorageEngine::for_testing();
        let fabric = DataFabric::new(4096);
        let channel = fabric.endpoint("srv-a");
        let engine_dyn: Arc<dyn StorageEngine> = engine.clone();
        let resolver = Arc::new(PbaResolver::new(
            engine_dyn.clone(),
            channel,
            Duration::from_millis(100),
        ));

        let sm = ReplicaStateMachine::new(
            state_store.group_id(),
            state_store,
            engine_dyn,
            resolver,
            journal_cfg,
        )
        .unwrap();
        let (listener, handle) = RecordingListener::releasing_own();
        sm.attach_listener(Box::new(listener));

        (
            Fixture {
                _tmp: tmp,
                engine,
                sm,
            },
            handle,
        )
    }

    fn entry(engine: &MemoryStorageEngine, key: &str) -> (LogEntry, Vec<Pba>) {
        let pbas = engine.alloc_pbas(16).unwrap();
        (
            LogEntry::new(
                "srv-a",
                Bytes::from_static(&[0x01]),
                Bytes::copy_from_slice(key.as_bytes()),
                pbas.clone(),
            ),
            pbas,
        )
    }

    #[tokio::test]
    async fn test_commit_releases_through_journal() {
        let (fx, handle) = fixture(JournalConfig {
            sync_policy: SyncPolicy::EveryCommit,
            superblock_flush_interval: 1,
        });
        let (entry, pbas) = entry(&fx.engine, "k");

        fx.sm.on_pre_commit(Lsn::FIRST, &entry);
        fx.sm.on_commit(Lsn::FIRST, entry);
        fx.sm.wait_for_commit(Lsn::FIRST).await;

        assert_eq!(fx.sm.commit_lsn(), Lsn::FIRST);
        // The releasing_own listener returned the entry's pbas; they were
        // journaled and physically freed.
        assert!(!fx.engine.is_allocated(pbas[0]));
        assert_eq!(handle.committed_lsns(), vec![Lsn::FIRST]);
    }

    #[tokio::test]
    async fn test_commit_order_and_exactly_one_precommit() {
        let (fx, handle) = fixture(JournalConfig::default());

        for i in 1..=3u64 {
            let (entry, _) = entry(&fx.engine, &format!("k{i}"));
            fx.sm.on_pre_commit(Lsn::new(i), &entry);
            fx.sm.on_commit(Lsn::new(i), entry);
        }
        fx.sm.wait_for_commit(Lsn::new(3)).await;

        let events = handle.events();
        let pre: Vec<_> = events
            .iter()
            .filter(|e| matches!(e, ListenerEvent::PreCommit { .. }))
            .collect();
        assert_eq!(pre.len(), 3);
        assert_eq!(
            handle.committed_lsns(),
            vec![Lsn::new(1), Lsn::new(2), Lsn::new(3)]
        );
    }

    #[tokio::test]
    async fn test_redelivered_commit_is_ignored() {
        let (fx, handle) = fixture(JournalConfig::default());
        let (entry1, _) = entry(&fx.engine, "k");

        fx.sm.on_pre_commit(Lsn::FIRST, &entry1);
        fx.sm.on_commit(Lsn::FIRST, entry1.clone());
        fx.sm.wait_for_commit(Lsn::FIRST).await;

        // Same LSN again, as after a crash-replay race.
        fx.sm.on_commit(Lsn::FIRST, entry1);
        fx.sm.flush().unwrap();

        assert_eq!(handle.committed_lsns(), vec![Lsn::FIRST]);
    }

    #[tokio::test]
    async fn test_rollback_then_recommit() {
        let (fx, handle) = fixture(JournalConfig::default());
        let (old_entry, _) = entry(&fx.engine, "old");
        let (new_entry, _) = entry(&fx.engine, "new");

        fx.sm.on_pre_commit(Lsn::new(1), &old_entry);
        fx.sm.on_rollback(Lsn::new(1), &old_entry);
        fx.sm.on_pre_commit(Lsn::new(1), &new_entry);
        fx.sm.on_commit(Lsn::new(1), new_entry);
        fx.sm.wait_for_commit(Lsn::new(1)).await;

        assert_eq!(handle.rolled_back_lsns(), vec![Lsn::new(1)]);
        let committed_keys: Vec<_> = handle
            .events()
            .iter()
            .filter_map(|e| match e {
                ListenerEvent::Commit { key, .. } => Some(key.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(committed_keys, vec![Bytes::from_static(b"new")]);
    }

    #[tokio::test]
    async fn test_deferred_frees_wait_for_flush() {
        let (fx, _handle) = fixture(JournalConfig {
            sync_policy: SyncPolicy::Checkpoint,
            superblock_flush_interval: 1000,
        });
        let (entry1, pbas) = entry(&fx.engine, "k");

        fx.sm.on_pre_commit(Lsn::FIRST, &entry1);
        fx.sm.on_commit(Lsn::FIRST, entry1);
        fx.sm.wait_for_commit(Lsn::FIRST).await;

        // Released but not yet physically freed.
        assert!(fx.engine.is_allocated(pbas[0]));

        fx.sm.flush().unwrap();
        assert!(!fx.engine.is_allocated(pbas[0]));
    }

    #[tokio::test]
    async fn test_stop_notifies_listener() {
        let (fx, handle) = fixture(JournalConfig::default());
        fx.sm.stop().unwrap();
        assert_eq!(handle.events(), vec![ListenerEvent::Stop]);
        // Idempotent.
        fx.sm.stop().unwrap();
    }
}
