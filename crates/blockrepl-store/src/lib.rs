//! # blockrepl-store
//!
//! Storage-side components of BlockRepl:
//!
//! - **Log stores**: append-only, index-addressed durable logs
//!   (`LogStore` trait, file and in-memory implementations, and the
//!   `LogStoreManager` that creates and re-opens them by id)
//! - **Storage engines**: PBA allocation and block I/O
//!   (`StorageEngine` trait, file and in-memory implementations)
//! - **Superblock**: the durable per-replica-set root record
//! - **Free-PBA journal**: the durable `(lsn -> [pba])` record of blocks
//!   released by commits
//! - **State store**: the per-replica-set coordinator owning the superblock
//!   and the free-PBA journal

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod engine;
pub mod free_pba;
pub mod log_store;
pub mod state_store;
pub mod superblock;

pub use engine::{BoxFuture, FileStorageEngine, MemoryStorageEngine, SgList, StorageEngine};
pub use free_pba::{FreePbaJournal, FreePbaRecord};
pub use log_store::{FileLogStore, LogStore, LogStoreManager, MemoryLogStore};
pub use state_store::StateStore;
pub use superblock::{ReplicaSuperblock, SuperblockStore};
