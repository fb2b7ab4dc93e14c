//! In-memory storage engine for testing.
//!
//! Tracks allocation state and counts operations so tests can assert on
//! engine interactions (single-flight materialization, no-double-free).

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;

use blockrepl_common::{Pba, PbaList, ReplError, ReplResult};

use super::{blocks_for, BoxFuture, SgList, StorageEngine};

/// First PBA handed out; lower addresses mimic engine-reserved metadata
/// regions.
const FIRST_DATA_PBA: u64 = 100;

/// In-memory storage engine for tests.
pub struct MemoryStorageEngine {
    block_size: usize,
    capacity_blocks: u64,
    next_pba: AtomicU64,
    allocated: Mutex<HashSet<u64>>,
    blocks: Arc<DashMap<u64, Bytes>>,
    allocs: AtomicU64,
    writes: AtomicU64,
    reads: AtomicU64,
    frees: AtomicU64,
}

impl MemoryStorageEngine {
    /// Creates an engine with the given block size and capacity.
    pub fn new(block_size: usize, capacity_blocks: u64) -> Arc<Self> {
        Arc::new(Self {
            block_size,
            capacity_blocks,
            next_pba: AtomicU64::new(FIRST_DATA_PBA),
            allocated: Mutex::new(HashSet::new()),
            blocks: Arc::new(DashMap::new()),
            allocs: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            reads: AtomicU64::new(0),
            frees: AtomicU64::new(0),
        })
    }

    /// Creates an engine with test defaults (4 KB blocks, 1024 blocks).
    pub fn for_testing() -> Arc<Self> {
        Self::new(4096, 1024)
    }

    /// Number of allocations performed.
    pub fn alloc_count(&self) -> u64 {
        self.allocs.load(Ordering::Acquire)
    }

    /// Number of write operations performed.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Acquire)
    }

    /// Number of read operations performed.
    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::Acquire)
    }

    /// Number of PBAs actually freed (idempotent re-frees not counted).
    pub fn free_count(&self) -> u64 {
        self.frees.load(Ordering::Acquire)
    }

    /// Returns true if the PBA is currently allocated.
    pub fn is_allocated(&self, pba: Pba) -> bool {
        self.allocated.lock().contains(&pba.as_u64())
    }

    /// Number of currently allocated PBAs.
    pub fn live_blocks(&self) -> usize {
        self.allocated.lock().len()
    }

    /// Returns the payload stored at a PBA, if written.
    pub fn block_data(&self, pba: Pba) -> Option<Bytes> {
        self.blocks.get(&pba.as_u64()).map(|b| b.clone())
    }
}

impl StorageEngine for MemoryStorageEngine {
    fn alloc_pbas(&self, size: usize) -> ReplResult<PbaList> {
        let needed = blocks_for(size, self.block_size);
        let mut allocated = self.allocated.lock();
        if allocated.len() as u64 + needed > self.capacity_blocks {
            return Err(ReplError::OutOfSpace { requested: size });
        }

        let mut pbas = PbaList::with_capacity(needed as usize);
        for _ in 0..needed {
            let pba = self.next_pba.fetch_add(1, Ordering::AcqRel);
            allocated.insert(pba);
            pbas.push(Pba::new(pba));
        }
        self.allocs.fetch_add(1, Ordering::AcqRel);
        Ok(pbas)
    }

    fn write(&self, pbas: &[Pba], value: &SgList) -> BoxFuture<'static, ReplResult<()>> {
        let pbas = pbas.to_vec();
        let payload = value.to_bytes();
        let block_size = self.block_size;
        let blocks = Arc::clone(&self.blocks);
        self.writes.fetch_add(1, Ordering::AcqRel);

        Box::pin(async move {
            if blocks_for(payload.len(), block_size) as usize > pbas.len() {
                return Err(ReplError::invalid_argument(format!(
                    "{} pbas cannot hold {} bytes",
                    pbas.len(),
                    payload.len()
                )));
            }
            for (i, pba) in pbas.iter().enumerate() {
                let start = i * block_size;
                let end = payload.len().min(start + block_size);
                let chunk = if start < payload.len() {
                    payload.slice(start..end)
                } else {
                    Bytes::new()
                };
                blocks.insert(pba.as_u64(), chunk);
            }
            Ok(())
        })
    }

    fn read(&self, pba: Pba, len: usize) -> BoxFuture<'static, ReplResult<Bytes>> {
        self.reads.fetch_add(1, Ordering::AcqRel);
        let data = self.blocks.get(&pba.as_u64()).map(|b| b.clone());

        Box::pin(async move {
            let data = data.ok_or_else(|| {
                ReplError::invalid_argument(format!("read of unwritten pba {pba}"))
            })?;
            Ok(data.slice(..len.min(data.len())))
        })
    }

    fn free_pba(&self, pba: Pba) -> ReplResult<()> {
        let mut allocated = self.allocated.lock();
        if allocated.remove(&pba.as_u64()) {
            self.blocks.remove(&pba.as_u64());
            self.frees.fetch_add(1, Ordering::AcqRel);
        }
        Ok(())
    }

    fn flush(&self) -> ReplResult<()> {
        Ok(())
    }

    fn block_size(&self) -> usize {
        self.block_size
    }
}

impl std::fmt::Debug for MemoryStorageEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStorageEngine")
            .field("block_size", &self.block_size)
            .field("live_blocks", &self.live_blocks())
            .finish()
    }
}
