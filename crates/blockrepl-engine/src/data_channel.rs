//! Data channel: out-of-band bulk payload transport.
//!
//! The header channel replicates only `{header, key, pbas}`; the payload
//! bytes travel here. Push is best-effort — a follower that misses a push
//! pulls the payload on demand with [`DataChannel::fetch`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::RwLock;

use blockrepl_common::{FullyQualifiedPba, GroupId, Pba, ReplResult, ReplicaId};
use blockrepl_store::{BoxFuture, SgList};

/// Trait for the bulk data transport between replicas.
pub trait DataChannel: Send + Sync {
    /// Ships `(pba, payload)` tuples to the peers of `group`. Best-effort;
    /// delivery carries no ordering guarantee relative to the header
    /// channel.
    fn push(
        &self,
        group: GroupId,
        pbas: &[Pba],
        value: &SgList,
    ) -> BoxFuture<'static, ReplResult<()>>;

    /// Fetches the payload of one remote PBA from its owning replica.
    ///
    /// Resolves once the payload is available; callers bound the wait.
    fn fetch(&self, fqpba: &FullyQualifiedPba) -> BoxFuture<'static, ReplResult<Bytes>>;

    /// Identity of the local replica on this channel.
    fn local_id(&self) -> ReplicaId;
}

/// Poll interval while waiting for a payload that has not arrived yet.
const FETCH_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// A shared in-process fabric for [`MemoryDataChannel`] endpoints.
///
/// Every endpoint connected to the same fabric can push and fetch
/// payloads. One-way partitions let tests simulate unreachable peers, and
/// per-key fetch counters back single-flight assertions.
pub struct DataFabric {
    /// Published payloads: owning replica -> (pba -> payload).
    tables: DashMap<ReplicaId, Arc<DashMap<u64, Bytes>>>,
    /// Blocked (fetcher, owner) pairs.
    partitions: RwLock<Vec<(ReplicaId, ReplicaId)>>,
    /// Block size used to slice pushed payloads.
    block_size: usize,
    pushes: AtomicU64,
    fetches: AtomicU64,
    fetches_by_key: DashMap<FullyQualifiedPba, u64>,
}

impl DataFabric {
    /// Creates a fabric slicing pushed payloads at `block_size`.
    pub fn new(block_size: usize) -> Arc<Self> {
        Arc::new(Self {
            tables: DashMap::new(),
            partitions: RwLock::new(Vec::new()),
            block_size,
            pushes: AtomicU64::new(0),
            fetches: AtomicU64::new(0),
            fetches_by_key: DashMap::new(),
        })
    }

    /// Creates an endpoint for the given replica.
    pub fn endpoint(self: &Arc<Self>, replica: impl Into<ReplicaId>) -> Arc<MemoryDataChannel> {
        let replica = replica.into();
        self.tables
            .entry(replica.clone())
            .or_insert_with(|| Arc::new(DashMap::new()));
        Arc::new(MemoryDataChannel {
            replica,
            fabric: Arc::clone(self),
        })
    }

    /// Blocks fetches by `fetcher` from `owner` (one-way).
    pub fn partition(&self, fetcher: impl Into<ReplicaId>, owner: impl Into<ReplicaId>) {
        self.partitions.write().push((fetcher.into(), owner.into()));
    }

    /// Removes all partitions.
    pub fn heal_all(&self) {
        self.partitions.write().clear();
    }

    /// Total number of pushes observed.
    pub fn push_count(&self) -> u64 {
        self.pushes.load(Ordering::Acquire)
    }

    /// Total number of fetches served.
    pub fn fetch_count(&self) -> u64 {
        self.fetches.load(Ordering::Acquire)
    }

    /// Number of fetches served for one fully-qualified PBA.
    pub fn fetches_for(&self, fqpba: &FullyQualifiedPba) -> u64 {
        self.fetches_by_key.get(fqpba).map(|c| *c).unwrap_or(0)
    }

    /// Directly publishes a payload as `owner`'s block, without a push.
    ///
    /// Lets tests stage remote data that the header channel references.
    pub fn publish(&self, owner: impl Into<ReplicaId>, pba: Pba, payload: Bytes) {
        let owner = owner.into();
        self.tables
            .entry(owner)
            .or_insert_with(|| Arc::new(DashMap::new()))
            .insert(pba.as_u64(), payload);
    }

    fn is_partitioned(&self, fetcher: &ReplicaId, owner: &ReplicaId) -> bool {
        self.partitions
            .read()
            .iter()
            .any(|(f, o)| f == fetcher && o == owner)
    }

    fn lookup(&self, owner: &ReplicaId, pba: Pba) -> Option<Bytes> {
        self.tables
            .get(owner)
            .and_then(|table| table.get(&pba.as_u64()).map(|b| b.clone()))
    }
}

impl std::fmt::Debug for DataFabric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataFabric")
            .field("replicas", &self.tables.len())
            .field("pushes", &self.push_count())
            .field("fetches", &self.fetch_count())
            .finish()
    }
}

/// In-process data channel endpoint for one replica.
pub struct MemoryDataChannel {
    replica: ReplicaId,
    fabric: Arc<DataFabric>,
}

impl MemoryDataChannel {
    /// Returns the fabric this endpoint is connected to.
    pub fn fabric(&self) -> &Arc<DataFabric> {
        &self.fabric
    }
}

impl DataChannel for MemoryDataChannel {
    fn push(
        &self,
        _group: GroupId,
        pbas: &[Pba],
        value: &SgList,
    ) -> BoxFuture<'static, ReplResult<()>> {
        let fabric = Arc::clone(&self.fabric);
        let replica = self.replica.clone();
        let pbas = pbas.to_vec();
        let payload = value.to_bytes();

        Box::pin(async move {
            let block_size = fabric.block_size;
            for (i, pba) in pbas.iter().enumerate() {
                let start = i * block_size;
                if start >= payload.len() {
                    break;
                }
                let end = payload.len().min(start + block_size);
                fabric.publish(replica.clone(), *pba, payload.slice(start..end));
            }
            fabric.pushes.fetch_add(1, Ordering::AcqRel);
            Ok(())
        })
    }

    fn fetch(&self, fqpba: &FullyQualifiedPba) -> BoxFuture<'static, ReplResult<Bytes>> {
        let fabric = Arc::clone(&self.fabric);
        let fetcher = self.replica.clone();
        let fqpba = fqpba.clone();

        Box::pin(async move {
            loop {
                if !fabric.is_partitioned(&fetcher, &fqpba.replica) {
                    if let Some(payload) = fabric.lookup(&fqpba.replica, fqpba.pba) {
                        fabric.fetches.fetch_add(1, Ordering::AcqRel);
                        *fabric.fetches_by_key.entry(fqpba.clone()).or_insert(0) += 1;
                        return Ok(payload);
                    }
                }
                // Wait for the payload to show up; the caller bounds the
                // overall wait.
                tokio::time::sleep(FETCH_POLL_INTERVAL).await;
            }
        })
    }

    fn local_id(&self) -> ReplicaId {
        self.replica.clone()
    }
}

impl std::fmt::Debug for MemoryDataChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryDataChannel")
            .field("replica", &self.replica)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_push_then_fetch() {
        let fabric = DataFabric::new(4096);
        let leader = fabric.endpoint("srv-a");
        let follower = fabric.endpoint("srv-b");

        let payload = Bytes::from(vec![0xAB; 4096]);
        leader
            .push(
                GroupId::generate(),
                &[Pba::new(100)],
                &SgList::single(payload.clone()),
            )
            .await
            .unwrap();

        let fetched = follower
            .fetch(&FullyQualifiedPba::new("srv-a", Pba::new(100)))
            .await
            .unwrap();
        assert_eq!(fetched, payload);
        assert_eq!(fabric.fetch_count(), 1);
    }

    #[tokio::test]
    async fn test_push_slices_multi_block() {
        let fabric = DataFabric::new(4);
        let leader = fabric.endpoint("srv-a");
        let follower = fabric.endpoint("srv-b");

        leader
            .push(
                GroupId::generate(),
                &[Pba::new(1), Pba::new(2)],
                &SgList::single(Bytes::from_static(b"abcdefg")),
            )
            .await
            .unwrap();

        let first = follower
            .fetch(&FullyQualifiedPba::new("srv-a", Pba::new(1)))
            .await
            .unwrap();
        let second = follower
            .fetch(&FullyQualifiedPba::new("srv-a", Pba::new(2)))
            .await
            .unwrap();
        assert_eq!(first.as_ref(), b"abcd");
        assert_eq!(second.as_ref(), b"efg");
    }

    #[tokio::test]
    async fn test_partition_blocks_fetch() {
        let fabric = DataFabric::new(4096);
        let _leader = fabric.endpoint("srv-a");
        let follower = fabric.endpoint("srv-b");

        fabric.publish("srv-a", Pba::new(9), Bytes::from_static(b"data"));
        fabric.partition("srv-b", "srv-a");

        let fetch = follower.fetch(&FullyQualifiedPba::new("srv-a", Pba::new(9)));
        let result = tokio::time::timeout(Duration::from_millis(50), fetch).await;
        assert!(result.is_err(), "partitioned fetch must not resolve");

        fabric.heal_all();
        let fetched = follower
            .fetch(&FullyQualifiedPba::new("srv-a", Pba::new(9)))
            .await
            .unwrap();
        assert_eq!(fetched.as_ref(), b"data");
    }
}
