//! Configuration for BlockRepl.
//!
//! These structures define the configurable aspects of a replication
//! service instance.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::constants::{
    DEFAULT_BLOCK_SIZE, DEFAULT_FETCH_TIMEOUT_MS, DEFAULT_SUPERBLOCK_FLUSH_INTERVAL,
    MIN_BLOCK_SIZE,
};
use crate::types::ReplicaId;

/// Storage engine backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    /// The production home engine (external).
    Home,
    /// The jungle engine (external).
    Jungle,
    /// The in-tree file-backed engine.
    File,
}

/// Log store backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStoreKind {
    /// The production home log store (external).
    Home,
    /// The jungle log store (external).
    Jungle,
}

/// Durability policy for the free-PBA journal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPolicy {
    /// Sync the journal on every commit; freed PBAs are returned to the
    /// engine immediately.
    EveryCommit,
    /// Sync only on explicit flush/checkpoint; physical frees are deferred
    /// until the journal is known durable.
    Checkpoint,
}

/// Main replication service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Identity of this replica, as peers name it.
    pub replica_id: String,

    /// Data directory for superblocks, log stores, and the file engine.
    pub data_dir: PathBuf,

    /// Storage engine backend.
    pub engine: EngineKind,

    /// Log store backend for the consensus data journal.
    pub log_store: LogStoreKind,

    /// Storage engine tuning.
    pub storage: StorageConfig,

    /// Free-PBA journal tuning.
    pub journal: JournalConfig,

    /// Timeout for fetching a remote PBA over the data channel.
    pub fetch_timeout_ms: u64,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            replica_id: "replica-1".to_string(),
            data_dir: PathBuf::from("./data"),
            engine: EngineKind::File,
            log_store: LogStoreKind::Home,
            storage: StorageConfig::default(),
            journal: JournalConfig::default(),
            fetch_timeout_ms: DEFAULT_FETCH_TIMEOUT_MS,
        }
    }
}

impl ReplicationConfig {
    /// Creates a configuration rooted at the given data directory.
    #[must_use]
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    /// Creates a minimal configuration for testing.
    #[must_use]
    pub fn for_testing(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            replica_id: "test-replica".to_string(),
            data_dir: data_dir.into(),
            engine: EngineKind::File,
            log_store: LogStoreKind::Home,
            storage: StorageConfig {
                capacity_blocks: 1024,
                ..Default::default()
            },
            journal: JournalConfig {
                sync_policy: SyncPolicy::EveryCommit,
                superblock_flush_interval: 1,
            },
            fetch_timeout_ms: 200,
        }
    }

    /// Returns this replica's identity.
    #[must_use]
    pub fn replica_id(&self) -> ReplicaId {
        ReplicaId::new(self.replica_id.as_str())
    }

    /// Returns the remote fetch timeout as a `Duration`.
    #[must_use]
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    /// Validates the configuration and returns an error message if invalid.
    pub fn validate(&self) -> Result<(), String> {
        if self.replica_id.is_empty() {
            return Err("replica_id must not be empty".to_string());
        }
        if self.storage.block_size < MIN_BLOCK_SIZE {
            return Err(format!("block_size must be at least {MIN_BLOCK_SIZE} bytes"));
        }
        if !self.storage.block_size.is_power_of_two() {
            return Err("block_size must be a power of 2".to_string());
        }
        if self.storage.capacity_blocks == 0 {
            return Err("capacity_blocks must be non-zero".to_string());
        }
        if self.journal.superblock_flush_interval == 0 {
            return Err("superblock_flush_interval must be non-zero".to_string());
        }
        Ok(())
    }
}

/// Storage engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Size of each block in bytes. Must be a power of 2.
    /// Default: 4096 (4 KB)
    pub block_size: usize,

    /// Total capacity of the engine in blocks.
    /// Default: 262144 (1 GB of 4 KB blocks)
    pub capacity_blocks: u64,

    /// Sync data-file writes before completing them.
    /// Default: true
    pub sync_writes: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            capacity_blocks: 256 * 1024,
            sync_writes: true,
        }
    }
}

/// Free-PBA journal configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalConfig {
    /// Durability policy for free-PBA records.
    /// Default: `EveryCommit`
    pub sync_policy: SyncPolicy,

    /// Number of commits between superblock persistence.
    /// Default: 64
    pub superblock_flush_interval: u64,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            sync_policy: SyncPolicy::EveryCommit,
            superblock_flush_interval: DEFAULT_SUPERBLOCK_FLUSH_INTERVAL,
        }
    }
}
