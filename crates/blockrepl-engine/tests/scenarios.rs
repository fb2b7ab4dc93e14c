//! End-to-end scenarios for the replication engine.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tempfile::TempDir;

use blockrepl_common::config::{JournalConfig, ReplicationConfig, SyncPolicy};
use blockrepl_common::{FullyQualifiedPba, GroupId, LogStoreId, Lsn, Pba};
use blockrepl_engine::{
    ConsensusLog, DataChannel, DataFabric, InProcessConsensusLog, ListenerEvent, LogEntry,
    RecordingHandle, RecordingListener, ReplicaSet, ReplicaStateMachine, ReplicationService,
    StateMachineHooks,
};
use blockrepl_store::{
    LogStoreManager, MemoryLogStore, MemoryStorageEngine, SgList, StateStore, StorageEngine,
    SuperblockStore,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("warn")
        .with_test_writer()
        .try_init();
}

struct Node {
    _tmp: TempDir,
    engine: Arc<MemoryStorageEngine>,
    fabric: Arc<DataFabric>,
    set: Arc<ReplicaSet>,
    handle: RecordingHandle,
    consensus: Arc<InProcessConsensusLog>,
    state_store: Arc<StateStore>,
}

/// Assembles a replica set over in-memory collaborators with a durable
/// state store under a temp dir.
fn node(replica: &str, auto_commit: bool) -> Node {
    init_tracing();
    let tmp = TempDir::new().unwrap();
    let sb_store = Arc::new(SuperblockStore::open(tmp.path().join("sb")).unwrap());
    let manager = LogStoreManager::open(tmp.path().join("logs")).unwrap();
    let state_store = Arc::new(
        StateStore::create(sb_store, &manager, GroupId::generate(), LogStoreId::INVALID).unwrap(),
    );

    let engine = MemoryStorageEngine::for_testing();
    let fabric = DataFabric::new(4096);
    let channel = fabric.endpoint(replica);
    let consensus = InProcessConsensusLog::new(Arc::new(MemoryLogStore::new()), auto_commit);

    let set = ReplicaSet::new(
        replica.into(),
        engine.clone(),
        channel,
        consensus.clone(),
        Arc::clone(&state_store),
        JournalConfig {
            sync_policy: SyncPolicy::EveryCommit,
            superblock_flush_interval: 1,
        },
        Duration::from_millis(200),
    )
    .unwrap();

    let (listener, handle) = RecordingListener::releasing_own();
    set.attach_listener(Box::new(listener));
    set.start().unwrap();

    Node {
        _tmp: tmp,
        engine,
        fabric,
        set,
        handle,
        consensus,
        state_store,
    }
}

fn journal_contents(state_store: &StateStore) -> Vec<(u64, Vec<Pba>)> {
    let mut records = Vec::new();
    state_store
        .get_free_pba_records(Lsn::FIRST, Lsn::new(u64::MAX), &mut |lsn, pbas| {
            records.push((lsn.as_u64(), pbas));
        })
        .unwrap();
    records
}

// S1: single-node happy write.
#[tokio::test]
async fn happy_write_commits_and_journals_release() {
    let node = node("srv-a", true);

    let lsn = node
        .set
        .write(
            Bytes::from_static(&[0x01]),
            Bytes::from_static(b"k"),
            SgList::single(Bytes::from(vec![0xAB; 4096])),
            None,
        )
        .await
        .unwrap();
    assert_eq!(lsn, Lsn::FIRST);
    node.set.wait_for_commit(lsn).await;

    // The first allocation of the test engine is pba 100.
    let events = node.handle.events();
    assert_eq!(
        events[0],
        ListenerEvent::PreCommit {
            lsn: Lsn::FIRST,
            key: Bytes::from_static(b"k"),
            had_ctx: false,
        }
    );
    assert_eq!(
        events[1],
        ListenerEvent::Commit {
            lsn: Lsn::FIRST,
            key: Bytes::from_static(b"k"),
            pbas: vec![Pba::new(100)],
        }
    );

    assert_eq!(node.set.commit_lsn(), Lsn::FIRST);
    assert_eq!(journal_contents(&node.state_store), vec![(1, vec![Pba::new(100)])]);
}

// The payload lands both in the local engine and on the data channel.
#[tokio::test]
async fn write_reaches_both_channels() {
    let node = node("srv-a", true);
    let payload = Bytes::from(vec![0x5A; 4096]);

    let lsn = node
        .set
        .write(
            Bytes::from_static(&[0x02]),
            Bytes::from_static(b"key"),
            SgList::single(payload.clone()),
            None,
        )
        .await
        .unwrap();
    node.set.wait_for_commit(lsn).await;

    assert_eq!(node.fabric.push_count(), 1);
    // A peer can fetch the pushed payload by fully-qualified pba.
    let follower = node.fabric.endpoint("srv-b");
    let fetched = follower
        .fetch(&FullyQualifiedPba::new("srv-a", Pba::new(100)))
        .await
        .unwrap();
    assert_eq!(fetched, payload);
}

// Leader context reaches pre-commit callbacks.
#[tokio::test]
async fn leader_precommit_sees_user_context() {
    let node = node("srv-a", true);

    let ctx: blockrepl_engine::UserCtx = Some(Arc::new("req-42".to_string()));
    let lsn = node
        .set
        .write(
            Bytes::from_static(&[0x01]),
            Bytes::from_static(b"k"),
            SgList::single(Bytes::from_static(b"v")),
            ctx,
        )
        .await
        .unwrap();
    node.set.wait_for_commit(lsn).await;

    assert!(matches!(
        node.handle.events()[0],
        ListenerEvent::PreCommit { had_ctx: true, .. }
    ));
}

// Failed writes free their PBAs: they were never named by a log entry.
#[tokio::test]
async fn failed_append_frees_allocated_pbas() {
    let node = node("srv-a", true);
    node.consensus.stop().unwrap();

    let err = node
        .set
        .write(
            Bytes::from_static(&[0x01]),
            Bytes::from_static(b"k"),
            SgList::single(Bytes::from_static(b"v")),
            None,
        )
        .await
        .unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(node.engine.live_blocks(), 0);
    assert!(journal_contents(&node.state_store).is_empty());
}

// S2: crash after the journal write but before the superblock advances.
#[tokio::test]
async fn crash_between_journal_write_and_superblock_advance() {
    init_tracing();
    let tmp = TempDir::new().unwrap();
    let sb_store = Arc::new(SuperblockStore::open(tmp.path().join("sb")).unwrap());
    let manager = LogStoreManager::open(tmp.path().join("logs")).unwrap();
    let uuid = GroupId::generate();
    let engine = MemoryStorageEngine::for_testing();
    let fabric = DataFabric::new(4096);

    let journal_cfg = JournalConfig {
        sync_policy: SyncPolicy::EveryCommit,
        superblock_flush_interval: 1,
    };

    let entry_for = |engine: &MemoryStorageEngine, key: &str| {
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
    };

    // Phase 1: commit lsns 1..=4, then simulate the crash window at lsn 5:
    // its free-pba record is durable but commit_lsn still reads 4.
    let (lsn5_entry, lsn5_pbas) = {
        let state_store = Arc::new(
            StateStore::create(Arc::clone(&sb_store), &manager, uuid, LogStoreId::INVALID)
                .unwrap(),
        );
        let resolver = Arc::new(blockrepl_engine::PbaResolver::new(
            engine.clone(),
            fabric.endpoint("srv-a"),
            Duration::from_millis(100),
        ));
        let sm = ReplicaStateMachine::new(
            uuid,
            Arc::clone(&state_store),
            engine.clone(),
            resolver,
            journal_cfg.clone(),
        )
        .unwrap();
        let (listener, _handle) = RecordingListener::releasing_own();
        sm.attach_listener(Box::new(listener));

        for i in 1..=4u64 {
            let (entry, _) = entry_for(&engine, &format!("k{i}"));
            sm.on_pre_commit(Lsn::new(i), &entry);
            sm.on_commit(Lsn::new(i), entry);
        }
        sm.wait_for_commit(Lsn::new(4)).await;

        let (entry, pbas) = entry_for(&engine, "k5");
        state_store.add_free_pba_record(Lsn::new(5), &pbas).unwrap();
        state_store.flush_free_pba_records().unwrap();
        // Crash before set_commit_lsn(5): stop without applying lsn 5.
        sm.stop().unwrap();
        (entry, pbas)
    };
    let frees_before_restart = engine.free_count();
    assert_eq!(frees_before_restart, 4);
    assert!(engine.is_allocated(lsn5_pbas[0]));

    // Phase 2: restart. The superblock still says commit_lsn = 4.
    let sb = sb_store.load(uuid).unwrap();
    assert_eq!(sb.commit_lsn, Lsn::new(4));

    let state_store = Arc::new(StateStore::open(Arc::clone(&sb_store), &manager, sb).unwrap());
    let resolver = Arc::new(blockrepl_engine::PbaResolver::new(
        engine.clone(),
        fabric.endpoint("srv-a"),
        Duration::from_millis(100),
    ));
    let sm = ReplicaStateMachine::new(
        uuid,
        Arc::clone(&state_store),
        engine.clone(),
        resolver,
        journal_cfg,
    )
    .unwrap();
    let (listener, handle) = RecordingListener::releasing_own();
    sm.attach_listener(Box::new(listener));

    // Recovery replays only records with lsn <= 4; all named pbas were
    // already freed and free_pba is idempotent.
    sm.recover().unwrap();
    assert_eq!(engine.free_count(), frees_before_restart);
    assert!(engine.is_allocated(lsn5_pbas[0]));

    // Consensus redelivers lsn 5; the journal re-append is idempotent.
    sm.on_pre_commit(Lsn::new(5), &lsn5_entry);
    sm.on_commit(Lsn::new(5), lsn5_entry.clone());
    sm.wait_for_commit(Lsn::new(5)).await;
    sm.stop().unwrap();

    assert_eq!(handle.committed_lsns(), vec![Lsn::new(5)]);
    assert_eq!(state_store.last_commit_lsn(), Lsn::new(5));
    assert_eq!(sb_store.load(uuid).unwrap().commit_lsn, Lsn::new(5));
    // Freed exactly once, no double free, no leak.
    assert_eq!(engine.free_count(), frees_before_restart + lsn5_pbas.len() as u64);
    assert!(!engine.is_allocated(lsn5_pbas[0]));
}

// S3: follower resolves a foreign pba; concurrent callers share one fetch.
#[tokio::test]
async fn follower_remote_fetch_is_single_flight() {
    let node = node("srv-b", false);

    // Leader "srv-a" pushed a payload the follower has not materialized.
    let payload = Bytes::from(vec![0xCD; 512]);
    node.fabric.publish("srv-a", Pba::new(0xF00), payload.clone());

    // The follower sees the log entry referencing the foreign pba.
    let entry = LogEntry::new(
        "srv-a",
        Bytes::from_static(&[0x07]),
        Bytes::from_static(b"k7"),
        vec![Pba::new(0xF00)],
    );
    node.consensus.deliver(entry).unwrap();

    // A strong read maps the foreign pba; two concurrent callers observe a
    // single fetch and a single materialization.
    let fqpba = FullyQualifiedPba::new("srv-a", Pba::new(0xF00));
    let (first, second) = tokio::join!(
        node.set.map_pba(fqpba.clone()),
        node.set.map_pba(fqpba.clone())
    );
    let local = first.unwrap();
    assert_eq!(second.unwrap(), local);
    assert_eq!(node.fabric.fetches_for(&fqpba), 1);
    assert_eq!(node.engine.block_data(local).unwrap(), payload);

    // Commit of the entry evicts the mapping: the local block is now the
    // canonical reference.
    node.consensus.commit_upto(Lsn::FIRST).unwrap();
    node.set.wait_for_commit(Lsn::FIRST).await;
    assert!(node.set.resolver().lookup(&fqpba).is_none());
}

// Fetch timeout surfaces as RemoteUnavailable and is retryable.
#[tokio::test]
async fn unreachable_peer_fails_map_pba() {
    let node = node("srv-b", false);
    node.fabric.publish("srv-a", Pba::new(0xF00), Bytes::from_static(b"x"));
    node.fabric.partition("srv-b", "srv-a");

    let err = node
        .set
        .map_pba(FullyQualifiedPba::new("srv-a", Pba::new(0xF00)))
        .await
        .unwrap_err();
    assert!(err.is_retryable());

    // After the partition heals, the same mapping succeeds.
    node.fabric.heal_all();
    node.set
        .map_pba(FullyQualifiedPba::new("srv-a", Pba::new(0xF00)))
        .await
        .unwrap();
}

// S4: an ordered entry is overwritten; rollback precedes the new commit.
#[tokio::test]
async fn rollback_then_recommit_at_same_index() {
    let node = node("srv-b", false);

    let old_entry = LogEntry::new(
        "srv-a",
        Bytes::from_static(&[0x09]),
        Bytes::from_static(b"old"),
        vec![Pba::new(0x900)],
    );
    let new_entry = LogEntry::new(
        "srv-a",
        Bytes::from_static(&[0x09]),
        Bytes::from_static(b"new"),
        node.engine.alloc_pbas(16).unwrap(),
    );

    let lsn = node.consensus.deliver(old_entry).unwrap();
    node.consensus.overwrite(lsn, new_entry).unwrap();
    node.consensus.commit_upto(lsn).unwrap();
    node.set.wait_for_commit(lsn).await;

    // Exactly one rollback and one commit for the index, in that order,
    // and the rolled-back entry left no free-pba record.
    assert_eq!(node.handle.rolled_back_lsns(), vec![lsn]);
    assert_eq!(node.handle.committed_lsns(), vec![lsn]);
    let events = node.handle.events();
    let rollback_pos = events
        .iter()
        .position(|e| matches!(e, ListenerEvent::Rollback { .. }))
        .unwrap();
    let commit_pos = events
        .iter()
        .position(|e| matches!(e, ListenerEvent::Commit { .. }))
        .unwrap();
    assert!(rollback_pos < commit_pos);

    let records = journal_contents(&node.state_store);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].0, lsn.as_u64());
    assert_ne!(records[0].1, vec![Pba::new(0x900)]);
}

// S5: truncating the journal after a checkpoint.
#[tokio::test]
async fn checkpoint_truncates_free_pba_records() {
    let node = node("srv-a", true);

    let mut last = Lsn::INVALID;
    for i in 0..6u64 {
        last = node
            .set
            .write(
                Bytes::from_static(&[0x01]),
                Bytes::copy_from_slice(format!("k{i}").as_bytes()),
                SgList::single(Bytes::from_static(b"v")),
                None,
            )
            .await
            .unwrap();
    }
    node.set.wait_for_commit(last).await;
    assert_eq!(journal_contents(&node.state_store).len(), 6);

    let checkpoint = Lsn::new(4);
    node.set.checkpoint(checkpoint).unwrap();

    let remaining = journal_contents(&node.state_store);
    assert_eq!(
        remaining.iter().map(|(lsn, _)| *lsn).collect::<Vec<_>>(),
        vec![5, 6]
    );
    assert_eq!(node.state_store.checkpoint_lsn(), checkpoint);

    // Replaying from beyond the truncation returns the surviving records.
    let mut after = Vec::new();
    node.state_store
        .get_free_pba_records(Lsn::new(5), Lsn::new(100), &mut |lsn, _| {
            after.push(lsn.as_u64());
        })
        .unwrap();
    assert_eq!(after, vec![5, 6]);
}

// S6: the replay boundary emits end_lsn - 1 but stops there.
#[tokio::test]
async fn replay_range_boundary_is_final_inclusive() {
    let node = node("srv-a", true);

    let mut last = Lsn::INVALID;
    for i in 0..5u64 {
        last = node
            .set
            .write(
                Bytes::from_static(&[0x01]),
                Bytes::copy_from_slice(format!("k{i}").as_bytes()),
                SgList::single(Bytes::from_static(b"v")),
                None,
            )
            .await
            .unwrap();
    }
    node.set.wait_for_commit(last).await;

    let mut seen = Vec::new();
    node.state_store
        .get_free_pba_records(Lsn::new(2), Lsn::new(5), &mut |lsn, _| {
            seen.push(lsn.as_u64());
        })
        .unwrap();
    assert_eq!(seen, vec![2, 3, 4]);
}

// A journal append failure halts the replica set without advancing it.
#[tokio::test]
async fn journal_failure_poisons_replica_set() {
    init_tracing();
    let tmp = TempDir::new().unwrap();
    let sb_store = Arc::new(SuperblockStore::open(tmp.path().join("sb")).unwrap());
    let uuid = GroupId::generate();
    let sb = blockrepl_store::ReplicaSuperblock::new(uuid, LogStoreId::new(0), LogStoreId::INVALID);
    sb_store.persist(&sb).unwrap();

    let journal_store = Arc::new(MemoryLogStore::new());
    let state_store = Arc::new(StateStore::with_journal_store(
        sb_store,
        sb,
        journal_store.clone(),
    ));

    let engine = MemoryStorageEngine::for_testing();
    let fabric = DataFabric::new(4096);
    let resolver = Arc::new(blockrepl_engine::PbaResolver::new(
        engine.clone(),
        fabric.endpoint("srv-a"),
        Duration::from_millis(100),
    ));
    let sm = ReplicaStateMachine::new(
        uuid,
        state_store.clone(),
        engine.clone(),
        resolver,
        JournalConfig::default(),
    )
    .unwrap();
    let (listener, _handle) = RecordingListener::releasing_own();
    sm.attach_listener(Box::new(listener));

    let pbas = engine.alloc_pbas(16).unwrap();
    let entry = LogEntry::new(
        "srv-a",
        Bytes::from_static(&[0x01]),
        Bytes::from_static(b"k"),
        pbas.clone(),
    );

    journal_store.fail_next_append();
    sm.on_pre_commit(Lsn::FIRST, &entry);
    sm.on_commit(Lsn::FIRST, entry);

    // The commit thread hits the failure and poisons the set.
    for _ in 0..100 {
        if sm.is_poisoned() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(sm.is_poisoned());
    assert_eq!(sm.commit_lsn(), Lsn::INVALID);
    // The released pba was not freed: the release chain never skips the
    // journal.
    assert!(engine.is_allocated(pbas[0]));
}

// Service-level: create, write, restart, recover, continue.
#[tokio::test]
async fn service_reopens_replica_sets_after_restart() {
    init_tracing();
    let tmp = TempDir::new().unwrap();
    let fabric = DataFabric::new(4096);
    let uuid = GroupId::generate();

    let config = || {
        let mut config = ReplicationConfig::for_testing(tmp.path().join("data"));
        config.replica_id = "srv-a".to_string();
        config
    };
    let factory = || -> blockrepl_engine::ListenerFactory {
        Box::new(|_set| {
            let (listener, _) = RecordingListener::releasing_own();
            Box::new(listener)
        })
    };

    // First life: create a replica set and commit two writes.
    {
        let service =
            ReplicationService::open(config(), fabric.endpoint("srv-a"), factory()).unwrap();
        let set = service.create_replica_set(uuid).unwrap();

        let mut last = Lsn::INVALID;
        for key in [&b"k1"[..], &b"k2"[..]] {
            last = set
                .write(
                    Bytes::from_static(&[0x01]),
                    Bytes::copy_from_slice(key),
                    SgList::single(Bytes::from(vec![0xEE; 64])),
                    None,
                )
                .await
                .unwrap();
        }
        set.wait_for_commit(last).await;
        assert_eq!(set.commit_lsn(), Lsn::new(2));
        service.shutdown().unwrap();
    }

    // Second life: the superblock scan re-identifies the replica set.
    let service = ReplicationService::open(config(), fabric.endpoint("srv-a"), factory()).unwrap();
    let set = service
        .lookup_replica_set(uuid)
        .expect("replica set must be re-opened from its superblock");
    assert_eq!(set.commit_lsn(), Lsn::new(2));

    let mut count = 0;
    service.iterate_replica_sets(&mut |_| count += 1);
    assert_eq!(count, 1);

    // Writes continue after the recovered frontier.
    let lsn = set
        .write(
            Bytes::from_static(&[0x01]),
            Bytes::from_static(b"k3"),
            SgList::single(Bytes::from_static(b"v3")),
            None,
        )
        .await
        .unwrap();
    assert_eq!(lsn, Lsn::new(3));
    set.wait_for_commit(lsn).await;

    // Removal tears the state down; a third open finds nothing.
    service.remove_replica_set(uuid).unwrap();
    service.shutdown().unwrap();
    let service = ReplicationService::open(config(), fabric.endpoint("srv-a"), factory()).unwrap();
    assert!(service.lookup_replica_set(uuid).is_none());
}
