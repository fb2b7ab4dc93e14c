//! Consensus log: the header channel.
//!
//! The consensus engine itself is an external collaborator; the core only
//! consumes the [`ConsensusLog`] trait and implements the
//! [`StateMachineHooks`] it drives. [`InProcessConsensusLog`] is the
//! in-process implementation used by single-node deployments and tests: it
//! assigns LSNs, persists entries to a data-journal log store, and invokes
//! the hooks with the same ordering guarantees a real consensus engine
//! provides.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use blockrepl_common::{Lsn, ReplError, ReplResult, ReplicaId};
use blockrepl_store::{BoxFuture, LogStore};

use crate::entry::LogEntry;
use crate::listener::UserCtx;

/// State-machine hooks invoked by the consensus log.
///
/// Ordering contract: `on_pre_commit` calls are serialized in log-index
/// order; for every delivered index exactly one of `on_commit` or
/// `on_rollback` follows; `on_commit` calls arrive in strictly increasing
/// LSN order.
pub trait StateMachineHooks: Send + Sync {
    /// The leader's own entry was ordered; invoked on the appending
    /// thread with the caller's context (the leader optimization).
    fn on_leader_pre_commit(&self, lsn: Lsn, entry: &LogEntry, ctx: UserCtx);

    /// An entry was ordered on a follower, or replayed during recovery.
    fn on_pre_commit(&self, lsn: Lsn, entry: &LogEntry);

    /// Consensus committed the entry.
    fn on_commit(&self, lsn: Lsn, entry: LogEntry);

    /// The entry at this index is being overwritten.
    fn on_rollback(&self, lsn: Lsn, entry: &LogEntry);
}

/// Trait for the consensus-replicated header channel.
pub trait ConsensusLog: Send + Sync {
    /// Wires the state machine whose hooks this log drives. Must be called
    /// before `append` or `start`.
    fn attach(&self, hooks: Arc<dyn StateMachineHooks>);

    /// Appends an entry for replication.
    ///
    /// Resolves with the assigned LSN once the entry is ordered; the
    /// leader's pre-commit hook has fired by then. There is no timeout —
    /// consensus is authoritative.
    fn append(&self, entry: LogEntry, ctx: UserCtx) -> BoxFuture<'static, ReplResult<Lsn>>;

    /// Replays surviving entries with `lsn >= replay_from` into the hooks
    /// and starts the log.
    fn start(&self, replay_from: Lsn) -> ReplResult<()>;

    /// Stops the log; pending appends are rejected afterwards.
    fn stop(&self) -> ReplResult<()>;

    /// Adds a member to the replica set.
    fn add_member(&self, replica: ReplicaId) -> ReplResult<()>;

    /// Current membership.
    fn members(&self) -> Vec<ReplicaId>;
}

#[derive(Debug, Default)]
struct LogState {
    /// Next LSN to assign; 0 means "derive from the store at start".
    next_lsn: u64,
    /// Ordered but uncommitted entries (manual-commit mode only).
    pending: BTreeMap<u64, LogEntry>,
    /// Commit frontier.
    committed: u64,
}

/// In-process consensus log over a data-journal log store.
///
/// In auto-commit mode (a quorum of one) every appended entry commits as
/// soon as it is durable. With auto-commit off the caller drives the commit
/// frontier explicitly — tests use this to model a follower whose leader
/// may still overwrite ordered entries.
pub struct InProcessConsensusLog {
    store: Arc<dyn LogStore>,
    hooks: RwLock<Option<Arc<dyn StateMachineHooks>>>,
    /// Guards LSN assignment, persistence, and hook delivery so ordering
    /// is structural.
    state: Mutex<LogState>,
    auto_commit: bool,
    started: AtomicBool,
    stopped: AtomicBool,
    members: Mutex<Vec<ReplicaId>>,
}

impl InProcessConsensusLog {
    /// Creates a log over the given data journal.
    pub fn new(store: Arc<dyn LogStore>, auto_commit: bool) -> Arc<Self> {
        let next_lsn = store
            .last_lsn()
            .map(|slsn| slsn.to_repl().next().as_u64())
            .unwrap_or(Lsn::FIRST.as_u64());

        Arc::new(Self {
            store,
            hooks: RwLock::new(None),
            state: Mutex::new(LogState {
                next_lsn,
                ..LogState::default()
            }),
            auto_commit,
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            members: Mutex::new(Vec::new()),
        })
    }

    /// Delivers an entry ordered by the (simulated) leader. Manual-commit
    /// mode only; assigns the next index and fires the pre-commit hook.
    pub fn deliver(&self, entry: LogEntry) -> ReplResult<Lsn> {
        self.check_active()?;
        let hooks = self.require_hooks()?;

        let mut state = self.state.lock();
        let lsn = Lsn::new(state.next_lsn);
        self.store
            .append(lsn.to_store(), entry.encode())
            .map_err(reject)?;
        state.next_lsn += 1;
        state.pending.insert(lsn.as_u64(), entry.clone());
        hooks.on_pre_commit(lsn, &entry);
        Ok(lsn)
    }

    /// Overwrites the pending entry at `lsn` with a new one, firing the
    /// rollback hook for the old entry and pre-commit for its replacement.
    ///
    /// Only the highest pending index can be overwritten.
    pub fn overwrite(&self, lsn: Lsn, entry: LogEntry) -> ReplResult<()> {
        self.check_active()?;
        let hooks = self.require_hooks()?;

        let mut state = self.state.lock();
        if lsn.as_u64() <= state.committed {
            return Err(ReplError::invalid_argument(format!(
                "cannot overwrite committed lsn {lsn}"
            )));
        }
        let last_pending = state.pending.keys().next_back().copied();
        if last_pending != Some(lsn.as_u64()) {
            return Err(ReplError::invalid_argument(format!(
                "lsn {lsn} is not the last pending entry"
            )));
        }

        let old = state
            .pending
            .remove(&lsn.as_u64())
            .ok_or_else(|| ReplError::invalid_argument(format!("no pending entry at {lsn}")))?;
        hooks.on_rollback(lsn, &old);

        self.store
            .append(lsn.to_store(), entry.encode())
            .map_err(reject)?;
        state.pending.insert(lsn.as_u64(), entry.clone());
        hooks.on_pre_commit(lsn, &entry);
        Ok(())
    }

    /// Advances the commit frontier, committing pending entries in order.
    pub fn commit_upto(&self, upto: Lsn) -> ReplResult<()> {
        if !upto.is_valid() {
            return Err(ReplError::InvalidLsn { lsn: upto });
        }
        self.check_active()?;
        let hooks = self.require_hooks()?;

        let mut state = self.state.lock();
        self.store.sync_upto(Some(upto.to_store())).map_err(reject)?;

        let to_commit: Vec<u64> = state
            .pending
            .range(..=upto.as_u64())
            .map(|(&lsn, _)| lsn)
            .collect();
        for lsn in to_commit {
            let entry = state
                .pending
                .remove(&lsn)
                .ok_or_else(|| ReplError::internal("pending entry vanished"))?;
            state.committed = lsn;
            hooks.on_commit(Lsn::new(lsn), entry);
        }
        Ok(())
    }

    /// Current commit frontier.
    pub fn commit_frontier(&self) -> Lsn {
        Lsn::new(self.state.lock().committed)
    }

    fn check_active(&self) -> ReplResult<()> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(ReplError::ConsensusRejected {
                reason: "consensus log is stopped".to_string(),
            });
        }
        Ok(())
    }

    fn require_hooks(&self) -> ReplResult<Arc<dyn StateMachineHooks>> {
        self.hooks.read().clone().ok_or_else(|| ReplError::ConsensusRejected {
            reason: "no state machine attached".to_string(),
        })
    }

    fn append_inner(&self, entry: LogEntry, ctx: UserCtx) -> ReplResult<Lsn> {
        self.check_active()?;
        let hooks = self.require_hooks()?;

        let mut state = self.state.lock();
        let lsn = Lsn::new(state.next_lsn);
        self.store
            .append(lsn.to_store(), entry.encode())
            .map_err(reject)?;
        state.next_lsn += 1;

        hooks.on_leader_pre_commit(lsn, &entry, ctx);

        if self.auto_commit {
            // A quorum of one: durable means committed.
            self.store.sync_upto(Some(lsn.to_store())).map_err(reject)?;
            state.committed = lsn.as_u64();
            hooks.on_commit(lsn, entry);
        } else {
            state.pending.insert(lsn.as_u64(), entry);
        }
        Ok(lsn)
    }
}

fn reject(e: ReplError) -> ReplError {
    ReplError::ConsensusRejected {
        reason: format!("data journal write failed: {e}"),
    }
}

impl ConsensusLog for InProcessConsensusLog {
    fn attach(&self, hooks: Arc<dyn StateMachineHooks>) {
        *self.hooks.write() = Some(hooks);
    }

    fn append(&self, entry: LogEntry, ctx: UserCtx) -> BoxFuture<'static, ReplResult<Lsn>> {
        let result = self.append_inner(entry, ctx);
        Box::pin(async move { result })
    }

    fn start(&self, replay_from: Lsn) -> ReplResult<()> {
        let hooks = self.require_hooks()?;
        if self.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        // Decode surviving entries first; replay happens in index order.
        let mut entries = Vec::new();
        let mut decode_err = None;
        self.store.scan(replay_from.to_store(), &mut |slsn, raw| {
            match LogEntry::decode(raw) {
                Ok(entry) => {
                    entries.push((slsn.to_repl(), entry));
                    true
                }
                Err(e) => {
                    decode_err = Some(e);
                    false
                }
            }
        })?;
        if let Some(e) = decode_err {
            return Err(e);
        }

        let mut state = self.state.lock();
        state.committed = replay_from.prev().as_u64();
        state.next_lsn = self
            .store
            .last_lsn()
            .map(|slsn| slsn.to_repl().next().as_u64())
            .max(Some(replay_from.as_u64()))
            .unwrap_or(Lsn::FIRST.as_u64());

        for (lsn, entry) in &entries {
            hooks.on_pre_commit(*lsn, entry);
        }

        if self.auto_commit {
            // Everything persisted was committed by the quorum of one.
            for (lsn, entry) in entries {
                state.committed = lsn.as_u64();
                hooks.on_commit(lsn, entry);
            }
        } else {
            for (lsn, entry) in entries {
                state.pending.insert(lsn.as_u64(), entry);
            }
        }

        tracing::debug!(
            replay_from = %replay_from,
            next_lsn = state.next_lsn,
            "consensus log started"
        );
        Ok(())
    }

    fn stop(&self) -> ReplResult<()> {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let last = self.store.last_lsn();
        self.store.sync_upto(last)
    }

    fn add_member(&self, replica: ReplicaId) -> ReplResult<()> {
        self.check_active()?;
        let mut members = self.members.lock();
        if !members.contains(&replica) {
            members.push(replica);
        }
        Ok(())
    }

    fn members(&self) -> Vec<ReplicaId> {
        self.members.lock().clone()
    }
}

impl std::fmt::Debug for InProcessConsensusLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("InProcessConsensusLog")
            .field("auto_commit", &self.auto_commit)
            .field("next_lsn", &state.next_lsn)
            .field("committed", &state.committed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blockrepl_common::Pba;
    use blockrepl_store::MemoryLogStore;
    use bytes::Bytes;

    #[derive(Default)]
    struct RecordingHooks {
        calls: Mutex<Vec<String>>,
    }

    impl RecordingHooks {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }
    }

    impl StateMachineHooks for RecordingHooks {
        fn on_leader_pre_commit(&self, lsn: Lsn, _entry: &LogEntry, _ctx: UserCtx) {
            self.calls.lock().push(format!("leader_pre:{lsn}"));
        }

        fn on_pre_commit(&self, lsn: Lsn, _entry: &LogEntry) {
            self.calls.lock().push(format!("pre:{lsn}"));
        }

        fn on_commit(&self, lsn: Lsn, _entry: LogEntry) {
            self.calls.lock().push(format!("commit:{lsn}"));
        }

        fn on_rollback(&self, lsn: Lsn, _entry: &LogEntry) {
            self.calls.lock().push(format!("rollback:{lsn}"));
        }
    }

    fn entry(key: &str) -> LogEntry {
        LogEntry::new(
            "srv-a",
            Bytes::from_static(&[0x01]),
            Bytes::copy_from_slice(key.as_bytes()),
            vec![Pba::new(100)],
        )
    }

    #[tokio::test]
    async fn test_auto_commit_fires_pre_then_commit() {
        let log = InProcessConsensusLog::new(Arc::new(MemoryLogStore::new()), true);
        let hooks = Arc::new(RecordingHooks::default());
        log.attach(hooks.clone());
        log.start(Lsn::FIRST).unwrap();

        let lsn = log.append(entry("k"), None).await.unwrap();
        assert_eq!(lsn, Lsn::FIRST);
        assert_eq!(hooks.calls(), vec!["leader_pre:1", "commit:1"]);
    }

    #[tokio::test]
    async fn test_manual_commit_flow() {
        let log = InProcessConsensusLog::new(Arc::new(MemoryLogStore::new()), false);
        let hooks = Arc::new(RecordingHooks::default());
        log.attach(hooks.clone());
        log.start(Lsn::FIRST).unwrap();

        log.deliver(entry("a")).unwrap();
        log.deliver(entry("b")).unwrap();
        log.commit_upto(Lsn::new(2)).unwrap();

        assert_eq!(
            hooks.calls(),
            vec!["pre:1", "pre:2", "commit:1", "commit:2"]
        );
        assert_eq!(log.commit_frontier(), Lsn::new(2));
    }

    #[tokio::test]
    async fn test_overwrite_rolls_back() {
        let log = InProcessConsensusLog::new(Arc::new(MemoryLogStore::new()), false);
        let hooks = Arc::new(RecordingHooks::default());
        log.attach(hooks.clone());
        log.start(Lsn::FIRST).unwrap();

        log.deliver(entry("old")).unwrap();
        log.overwrite(Lsn::FIRST, entry("new")).unwrap();
        log.commit_upto(Lsn::FIRST).unwrap();

        assert_eq!(
            hooks.calls(),
            vec!["pre:1", "rollback:1", "pre:1", "commit:1"]
        );
    }

    #[tokio::test]
    async fn test_overwrite_committed_rejected() {
        let log = InProcessConsensusLog::new(Arc::new(MemoryLogStore::new()), false);
        log.attach(Arc::new(RecordingHooks::default()));
        log.start(Lsn::FIRST).unwrap();

        log.deliver(entry("a")).unwrap();
        log.commit_upto(Lsn::FIRST).unwrap();
        assert!(log.overwrite(Lsn::FIRST, entry("b")).is_err());
    }

    #[tokio::test]
    async fn test_restart_replays_from_frontier() {
        let store = Arc::new(MemoryLogStore::new());

        {
            let log = InProcessConsensusLog::new(store.clone(), true);
            let hooks = Arc::new(RecordingHooks::default());
            log.attach(hooks.clone());
            log.start(Lsn::FIRST).unwrap();
            log.append(entry("a"), None).await.unwrap();
            log.append(entry("b"), None).await.unwrap();
            log.stop().unwrap();
        }

        // Restart claiming lsn 1 already committed: only lsn 2 replays.
        let log = InProcessConsensusLog::new(store, true);
        let hooks = Arc::new(RecordingHooks::default());
        log.attach(hooks.clone());
        log.start(Lsn::new(2)).unwrap();

        assert_eq!(hooks.calls(), vec!["pre:2", "commit:2"]);

        // New appends continue after the replayed suffix.
        let lsn = log.append(entry("c"), None).await.unwrap();
        assert_eq!(lsn, Lsn::new(3));
    }

    #[tokio::test]
    async fn test_stopped_rejects_append() {
        let log = InProcessConsensusLog::new(Arc::new(MemoryLogStore::new()), true);
        log.attach(Arc::new(RecordingHooks::default()));
        log.start(Lsn::FIRST).unwrap();
        log.stop().unwrap();

        let err = log.append(entry("x"), None).await.unwrap_err();
        assert!(matches!(err, ReplError::ConsensusRejected { .. }));
    }
}
