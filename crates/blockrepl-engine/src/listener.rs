//! Consumer-facing replica-set callbacks.
//!
//! The listener is the application's view of the replicated log. It is
//! attached to a replica set by ownership — a plain trait object, no
//! inheritance tree — and its callbacks observe the guarantees documented
//! on each method.

use std::any::Any;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use blockrepl_common::types::PbaLsnList;
use blockrepl_common::{Lsn, Pba, PbaList};

/// Opaque per-write context supplied by the caller of `write` and handed
/// back to every listener callback for that entry. Followers see `None`.
pub type UserCtx = Option<Arc<dyn Any + Send + Sync>>;

/// Callbacks implemented by replica-set consumers.
pub trait ReplicaSetListener: Send {
    /// Called when a log entry has been received and ordered by the
    /// replica set.
    ///
    /// On recovery this runs from a worker thread before consensus starts.
    /// On the leader it runs on the thread that called `write`. On a
    /// follower it runs when the entry arrives. In every case calls are
    /// serialized in log-index order.
    ///
    /// A listener may ignore pre-commit; the typical use is tracking
    /// not-yet-committed keys so strongly consistent reads can skip them.
    fn on_pre_commit(&mut self, lsn: Lsn, header: &Bytes, key: &Bytes, ctx: UserCtx);

    /// Called when a log entry has been committed by the replica set.
    ///
    /// Runs on the replica set's single commit thread; `lsn` is strictly
    /// monotonically increasing across calls.
    ///
    /// The returned `(pba, lsn)` pairs are the blocks the listener is
    /// releasing as part of applying this commit. Their lifecycle
    /// transfers to the replication engine; the listener must never free
    /// them itself.
    fn on_commit(
        &mut self,
        lsn: Lsn,
        header: &Bytes,
        key: &Bytes,
        pbas: &[Pba],
        ctx: UserCtx,
    ) -> PbaLsnList;

    /// Called when a log entry is being overwritten, on followers only.
    ///
    /// Serialized with pre-commit; for each log index exactly one of
    /// `on_commit` or `on_rollback` is called, never both. The listener
    /// must release whatever it created in pre-commit for this index.
    fn on_rollback(&mut self, lsn: Lsn, header: &Bytes, key: &Bytes, ctx: UserCtx);

    /// Called when the replica set is being stopped.
    fn on_replica_stop(&mut self);
}

/// A listener that ignores every callback and releases nothing.
///
/// Useful for tests that only exercise the engine side.
#[derive(Debug, Default)]
pub struct NoOpListener;

impl ReplicaSetListener for NoOpListener {
    fn on_pre_commit(&mut self, _lsn: Lsn, _header: &Bytes, _key: &Bytes, _ctx: UserCtx) {}

    fn on_commit(
        &mut self,
        _lsn: Lsn,
        _header: &Bytes,
        _key: &Bytes,
        _pbas: &[Pba],
        _ctx: UserCtx,
    ) -> PbaLsnList {
        PbaLsnList::new()
    }

    fn on_rollback(&mut self, _lsn: Lsn, _header: &Bytes, _key: &Bytes, _ctx: UserCtx) {}

    fn on_replica_stop(&mut self) {}
}

/// One observed listener callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerEvent {
    /// `on_pre_commit` fired.
    PreCommit {
        /// Entry LSN.
        lsn: Lsn,
        /// Entry key.
        key: Bytes,
        /// Whether a user context accompanied the entry.
        had_ctx: bool,
    },
    /// `on_commit` fired.
    Commit {
        /// Entry LSN.
        lsn: Lsn,
        /// Entry key.
        key: Bytes,
        /// Entry PBAs.
        pbas: PbaList,
    },
    /// `on_rollback` fired.
    Rollback {
        /// Entry LSN.
        lsn: Lsn,
        /// Entry key.
        key: Bytes,
    },
    /// `on_replica_stop` fired.
    Stop,
}

/// Shared view of the events a [`RecordingListener`] has observed.
#[derive(Debug, Clone, Default)]
pub struct RecordingHandle {
    events: Arc<Mutex<Vec<ListenerEvent>>>,
}

impl RecordingHandle {
    /// Snapshot of all observed events, in order.
    pub fn events(&self) -> Vec<ListenerEvent> {
        self.events.lock().clone()
    }

    /// LSNs that were committed, in observation order.
    pub fn committed_lsns(&self) -> Vec<Lsn> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                ListenerEvent::Commit { lsn, .. } => Some(*lsn),
                _ => None,
            })
            .collect()
    }

    /// LSNs that were rolled back, in observation order.
    pub fn rolled_back_lsns(&self) -> Vec<Lsn> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                ListenerEvent::Rollback { lsn, .. } => Some(*lsn),
                _ => None,
            })
            .collect()
    }
}

/// A listener that records every callback for later assertions.
///
/// With `releasing_own`, `on_commit` hands the entry's own PBAs back to the
/// engine at the committing LSN — the simplest well-formed release pattern.
#[derive(Debug, Default)]
pub struct RecordingListener {
    handle: RecordingHandle,
    release_own: bool,
}

impl RecordingListener {
    /// Creates a listener that releases nothing, and its handle.
    pub fn new() -> (Self, RecordingHandle) {
        let listener = Self::default();
        let handle = listener.handle.clone();
        (listener, handle)
    }

    /// Creates a listener whose commits release the entry's own PBAs.
    pub fn releasing_own() -> (Self, RecordingHandle) {
        let listener = Self {
            handle: RecordingHandle::default(),
            release_own: true,
        };
        let handle = listener.handle.clone();
        (listener, handle)
    }

    fn record(&self, event: ListenerEvent) {
        self.handle.events.lock().push(event);
    }
}

impl ReplicaSetListener for RecordingListener {
    fn on_pre_commit(&mut self, lsn: Lsn, _header: &Bytes, key: &Bytes, ctx: UserCtx) {
        self.record(ListenerEvent::PreCommit {
            lsn,
            key: key.clone(),
            had_ctx: ctx.is_some(),
        });
    }

    fn on_commit(
        &mut self,
        lsn: Lsn,
        _header: &Bytes,
        key: &Bytes,
        pbas: &[Pba],
        _ctx: UserCtx,
    ) -> PbaLsnList {
        self.record(ListenerEvent::Commit {
            lsn,
            key: key.clone(),
            pbas: pbas.to_vec(),
        });
        if self.release_own {
            pbas.iter().map(|&pba| (pba, lsn)).collect()
        } else {
            PbaLsnList::new()
        }
    }

    fn on_rollback(&mut self, lsn: Lsn, _header: &Bytes, key: &Bytes, _ctx: UserCtx) {
        self.record(ListenerEvent::Rollback {
            lsn,
            key: key.clone(),
        });
    }

    fn on_replica_stop(&mut self) {
        self.record(ListenerEvent::Stop);
    }
}
