//! Block storage engines.
//!
//! The engine owns PBA allocation and block I/O. The replication core only
//! consumes the [`StorageEngine`] trait; the production engines are external
//! products, while the `file` backend and an in-memory test engine live
//! here.

mod file;
mod memory;

pub use file::FileStorageEngine;
pub use memory::MemoryStorageEngine;

use std::future::Future;
use std::pin::Pin;

use bytes::{Bytes, BytesMut};

use blockrepl_common::{Pba, PbaList, ReplResult};

/// Boxed future returned by dyn-compatible async trait methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A scatter-gather list of payload buffers.
///
/// The buffers are logically concatenated; the engine lays the combined
/// payload across the PBAs it allocated for it.
#[derive(Debug, Clone, Default)]
pub struct SgList {
    bufs: Vec<Bytes>,
}

impl SgList {
    /// Creates an empty list.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a list holding a single buffer.
    #[must_use]
    pub fn single(buf: Bytes) -> Self {
        Self { bufs: vec![buf] }
    }

    /// Appends a buffer.
    pub fn push(&mut self, buf: Bytes) {
        self.bufs.push(buf);
    }

    /// Total payload length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.bufs.iter().map(Bytes::len).sum()
    }

    /// Returns true if the list carries no bytes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterates over the buffers.
    pub fn iter(&self) -> impl Iterator<Item = &Bytes> {
        self.bufs.iter()
    }

    /// Concatenates the buffers into one contiguous payload.
    #[must_use]
    pub fn to_bytes(&self) -> Bytes {
        match self.bufs.len() {
            0 => Bytes::new(),
            1 => self.bufs[0].clone(),
            _ => {
                let mut out = BytesMut::with_capacity(self.len());
                for buf in &self.bufs {
                    out.extend_from_slice(buf);
                }
                out.freeze()
            }
        }
    }
}

impl From<Bytes> for SgList {
    fn from(buf: Bytes) -> Self {
        Self::single(buf)
    }
}

impl From<Vec<Bytes>> for SgList {
    fn from(bufs: Vec<Bytes>) -> Self {
        Self { bufs }
    }
}

/// Trait for block storage engines.
///
/// Allocation is synchronous; block I/O is asynchronous. Allocated PBAs
/// stay reserved until [`StorageEngine::free_pba`] — after a crash, blocks
/// whose frees were journaled are reclaimed by free-PBA journal replay.
pub trait StorageEngine: Send + Sync {
    /// Allocates PBAs whose concatenation covers `size` bytes.
    ///
    /// Returns more than one PBA when a single contiguous extent is not
    /// available. Fails with `OutOfSpace` when the engine cannot cover the
    /// request.
    fn alloc_pbas(&self, size: usize) -> ReplResult<PbaList>;

    /// Writes the payload across the given PBAs.
    fn write(&self, pbas: &[Pba], value: &SgList) -> BoxFuture<'static, ReplResult<()>>;

    /// Reads `len` bytes from a single PBA.
    fn read(&self, pba: Pba, len: usize) -> BoxFuture<'static, ReplResult<Bytes>>;

    /// Returns a PBA to the allocator.
    ///
    /// Idempotent; callable only once a durable free-PBA record names the
    /// PBA (or when the PBA was never referenced by a log entry).
    fn free_pba(&self, pba: Pba) -> ReplResult<()>;

    /// Flushes engine metadata and data to durable storage.
    fn flush(&self) -> ReplResult<()>;

    /// Size of one block in bytes.
    fn block_size(&self) -> usize;
}

/// Number of blocks needed to cover `size` bytes.
pub(crate) fn blocks_for(size: usize, block_size: usize) -> u64 {
    (size.max(1)).div_ceil(block_size) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sg_list_concat() {
        let mut sgl = SgList::new();
        sgl.push(Bytes::from_static(b"hello "));
        sgl.push(Bytes::from_static(b"world"));
        assert_eq!(sgl.len(), 11);
        assert_eq!(sgl.to_bytes().as_ref(), b"hello world");
    }

    #[test]
    fn test_sg_list_empty_and_single() {
        assert!(SgList::new().is_empty());
        let sgl = SgList::single(Bytes::from_static(b"abc"));
        assert_eq!(sgl.to_bytes().as_ref(), b"abc");
    }

    #[test]
    fn test_blocks_for() {
        assert_eq!(blocks_for(1, 4096), 1);
        assert_eq!(blocks_for(4096, 4096), 1);
        assert_eq!(blocks_for(4097, 4096), 2);
        assert_eq!(blocks_for(0, 4096), 1);
    }
}
