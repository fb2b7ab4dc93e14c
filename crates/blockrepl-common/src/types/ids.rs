//! Core identifier types for BlockRepl.
//!
//! These types provide type-safe wrappers around the raw identifiers used
//! across the replication engine, preventing accidental misuse of one ID
//! kind where another is expected.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Physical block address - identifies one block of storage local to a
/// single replica.
///
/// PBAs are allocated and freed only by the storage engine. A PBA is
/// meaningless outside the replica that allocated it; see
/// [`FullyQualifiedPba`] for the cross-replica form.
///
/// # Example
///
/// ```rust
/// use blockrepl_common::types::Pba;
///
/// let pba = Pba::new(100);
/// assert_eq!(pba.as_u64(), 100);
/// ```
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct Pba(u64);

impl Pba {
    /// Invalid PBA, used as a sentinel value.
    pub const INVALID: Self = Self(u64::MAX);

    /// Creates a new `Pba` from a raw u64 value.
    #[inline]
    #[must_use]
    pub const fn new(pba: u64) -> Self {
        Self(pba)
    }

    /// Returns the raw u64 value.
    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Checks if this is a valid PBA.
    #[inline]
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 != Self::INVALID.0
    }
}

impl fmt::Debug for Pba {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::INVALID {
            write!(f, "Pba(INVALID)")
        } else {
            write!(f, "Pba({})", self.0)
        }
    }
}

impl fmt::Display for Pba {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Pba {
    #[inline]
    fn from(pba: u64) -> Self {
        Self::new(pba)
    }
}

impl From<Pba> for u64 {
    #[inline]
    fn from(pba: Pba) -> Self {
        pba.0
    }
}

/// Log sequence number assigned by the consensus log.
///
/// LSNs are strictly monotonic and 1-based. `Lsn::INVALID` (zero) doubles as
/// the "nothing committed yet" state of a fresh replica set.
///
/// The state-machine store addresses its internal log stores by
/// [`StoreLsn`], which is always `consensus LSN - 1`; the two conversion
/// functions keep that mapping in one place so it stays consistent across
/// restart.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct Lsn(u64);

impl Lsn {
    /// Invalid LSN, used as a sentinel value.
    pub const INVALID: Self = Self(0);

    /// First valid LSN.
    pub const FIRST: Self = Self(1);

    /// Creates a new `Lsn` from a raw u64 value.
    #[inline]
    #[must_use]
    pub const fn new(lsn: u64) -> Self {
        Self(lsn)
    }

    /// Returns the raw u64 value.
    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns the next LSN.
    #[inline]
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }

    /// Returns the previous LSN, saturating at `INVALID`.
    #[inline]
    #[must_use]
    pub const fn prev(self) -> Self {
        Self(self.0.saturating_sub(1))
    }

    /// Checks if this is a valid LSN.
    #[inline]
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 != Self::INVALID.0
    }

    /// Converts to the store-LSN this consensus LSN is journaled at.
    ///
    /// Must only be called on a valid LSN; the store log is 0-based.
    #[inline]
    #[must_use]
    pub const fn to_store(self) -> StoreLsn {
        StoreLsn(self.0 - 1)
    }
}

impl fmt::Debug for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::INVALID {
            write!(f, "Lsn(INVALID)")
        } else {
            write!(f, "Lsn({})", self.0)
        }
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Lsn {
    #[inline]
    fn from(lsn: u64) -> Self {
        Self::new(lsn)
    }
}

impl From<Lsn> for u64 {
    #[inline]
    fn from(lsn: Lsn) -> Self {
        lsn.0
    }
}

/// Index into a state-machine log store, always `consensus LSN - 1`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct StoreLsn(u64);

impl StoreLsn {
    /// First slot of a store log.
    pub const FIRST: Self = Self(0);

    /// Creates a new `StoreLsn` from a raw u64 value.
    #[inline]
    #[must_use]
    pub const fn new(lsn: u64) -> Self {
        Self(lsn)
    }

    /// Returns the raw u64 value.
    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Converts back to the consensus LSN this slot corresponds to.
    #[inline]
    #[must_use]
    pub const fn to_repl(self) -> Lsn {
        Lsn(self.0 + 1)
    }
}

impl fmt::Debug for StoreLsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StoreLsn({})", self.0)
    }
}

impl fmt::Display for StoreLsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a log store created by the log-store manager.
///
/// Recorded in the replica-set superblock so the same store can be re-opened
/// after restart.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct LogStoreId(u32);

impl LogStoreId {
    /// Invalid log store ID, used as a sentinel value.
    pub const INVALID: Self = Self(u32::MAX);

    /// Creates a new `LogStoreId` from a raw u32 value.
    #[inline]
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Returns the raw u32 value.
    #[inline]
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Checks if this is a valid log store ID.
    #[inline]
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 != Self::INVALID.0
    }
}

impl fmt::Debug for LogStoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::INVALID {
            write!(f, "LogStoreId(INVALID)")
        } else {
            write!(f, "LogStoreId({})", self.0)
        }
    }
}

impl fmt::Display for LogStoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for LogStoreId {
    #[inline]
    fn from(id: u32) -> Self {
        Self::new(id)
    }
}

/// Stable identifier of one replica (server) in a replica set.
///
/// Cheap to clone; backed by a shared string.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ReplicaId(Arc<str>);

impl ReplicaId {
    /// Creates a new `ReplicaId`.
    pub fn new(id: impl Into<Arc<str>>) -> Self {
        Self(id.into())
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ReplicaId({})", self.0)
    }
}

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ReplicaId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for ReplicaId {
    fn from(id: String) -> Self {
        Self::new(id)
    }
}

/// Identifier of a replica set: the consensus group uuid.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct GroupId(Uuid);

impl GroupId {
    /// Creates a new random group ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates a group ID from an existing uuid.
    #[inline]
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Creates a group ID from raw superblock bytes.
    #[inline]
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// Returns the underlying uuid.
    #[inline]
    #[must_use]
    pub const fn as_uuid(&self) -> Uuid {
        self.0
    }

    /// Returns the raw 16 bytes, as stored in the superblock.
    #[inline]
    #[must_use]
    pub const fn into_bytes(self) -> [u8; 16] {
        self.0.into_bytes()
    }
}

impl fmt::Debug for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GroupId({})", self.0)
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for GroupId {
    #[inline]
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

/// A PBA as named by a specific replica: `(replica, pba)`.
///
/// Equality and hashing use both fields. This is the key of the remote→local
/// resolution cache; the same numeric PBA on two different replicas names
/// two different blocks.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct FullyQualifiedPba {
    /// The replica that allocated the PBA.
    pub replica: ReplicaId,
    /// The PBA local to that replica.
    pub pba: Pba,
}

impl FullyQualifiedPba {
    /// Creates a new fully-qualified PBA.
    pub fn new(replica: impl Into<ReplicaId>, pba: Pba) -> Self {
        Self {
            replica: replica.into(),
            pba,
        }
    }
}

impl fmt::Debug for FullyQualifiedPba {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FqPba({}:{})", self.replica, self.pba)
    }
}

impl fmt::Display for FullyQualifiedPba {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.replica, self.pba)
    }
}
