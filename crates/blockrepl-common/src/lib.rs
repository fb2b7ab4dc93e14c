//! # blockrepl-common
//!
//! Common types, errors, and configuration for BlockRepl.
//!
//! This crate provides the foundational types shared by every BlockRepl
//! component:
//!
//! - **Types**: Core identifiers (`Pba`, `Lsn`, `ReplicaId`, `GroupId`) and
//!   the fully-qualified PBA used by the remote resolution cache
//! - **Errors**: Unified error handling with `ReplError`
//! - **Config**: Replication service configuration structures
//! - **Constants**: System-wide constants and limits
//!
//! ## Example
//!
//! ```rust
//! use blockrepl_common::types::{Lsn, Pba};
//! use blockrepl_common::error::ReplResult;
//!
//! fn example() -> ReplResult<()> {
//!     let pba = Pba::new(100);
//!     let lsn = Lsn::new(1);
//!     assert!(pba.is_valid() && lsn.is_valid());
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod constants;
pub mod error;
pub mod types;

// Re-export commonly used items at the crate root
pub use error::{ReplError, ReplResult};
pub use types::{FullyQualifiedPba, GroupId, LogStoreId, Lsn, Pba, PbaList, ReplicaId, StoreLsn};
