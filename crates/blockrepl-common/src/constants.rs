//! System-wide constants for BlockRepl.

// =============================================================================
// Block and Allocation Constants
// =============================================================================

/// Default data block size in bytes (4 KB).
///
/// One PBA addresses one block. Payloads larger than a block are covered by
/// a PBA list.
pub const DEFAULT_BLOCK_SIZE: usize = 4 * 1024;

/// Minimum configurable block size (512 bytes).
pub const MIN_BLOCK_SIZE: usize = 512;

/// Maximum payload size accepted by a single write (16 MB).
pub const MAX_WRITE_SIZE: usize = 16 * 1024 * 1024;

// =============================================================================
// Journal Constants
// =============================================================================

/// Maximum number of PBAs in a single free-PBA record.
///
/// A record is `4 + 8 * N` bytes; this bounds one record to ~512 KB.
pub const MAX_PBAS_PER_RECORD: usize = 64 * 1024;

/// Maximum payload size of a single log-store entry (1 MB).
pub const MAX_LOG_ENTRY_SIZE: usize = 1024 * 1024;

// =============================================================================
// Replication Constants
// =============================================================================

/// Default timeout for fetching a remote PBA over the data channel.
pub const DEFAULT_FETCH_TIMEOUT_MS: u64 = 5_000;

/// Default number of commits between superblock persistence.
///
/// The superblock is always persisted on flush and on replica stop; batching
/// only delays the steady-state write.
pub const DEFAULT_SUPERBLOCK_FLUSH_INTERVAL: u64 = 64;

/// Depth of the per-replica-set commit queue.
pub const COMMIT_QUEUE_DEPTH: usize = 1024;
