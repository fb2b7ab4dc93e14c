//! Core types for BlockRepl.

mod ids;

pub use ids::{FullyQualifiedPba, GroupId, LogStoreId, Lsn, Pba, ReplicaId, StoreLsn};

/// A list of PBAs whose concatenation covers one logically contiguous
/// payload. The storage engine returns more than one element when a single
/// contiguous extent is not available.
pub type PbaList = Vec<Pba>;

/// A `(pba, lsn)` pair naming a PBA released at a given commit LSN.
pub type PbaLsnList = Vec<(Pba, Lsn)>;
