//! Error handling for BlockRepl.
//!
//! Provides the unified error type and result alias used across all
//! BlockRepl components.

use thiserror::Error;

use crate::types::{FullyQualifiedPba, GroupId, Lsn};

/// Result type alias for BlockRepl operations.
pub type ReplResult<T> = std::result::Result<T, ReplError>;

/// The main error type for BlockRepl.
///
/// Covers every failure the replication engine can surface. Transient I/O
/// errors propagate to the originating operation; errors raised on the
/// commit thread are fatal to their replica set because the PBA release
/// pipeline must never be skipped.
#[derive(Debug, Error)]
pub enum ReplError {
    /// Storage engine could not satisfy an allocation.
    #[error("out of space: could not allocate {requested} bytes")]
    OutOfSpace {
        /// Size of the failed allocation request.
        requested: usize,
    },

    /// Append or flush of a log store failed.
    #[error("log store failure: {reason}")]
    LogStoreFailure {
        /// Reason for failure.
        reason: String,
    },

    /// The consensus log rejected an entry.
    #[error("consensus rejected entry: {reason}")]
    ConsensusRejected {
        /// Reason for rejection.
        reason: String,
    },

    /// A remote PBA could not be fetched from its owning replica.
    #[error("remote pba {fqpba} unavailable")]
    RemoteUnavailable {
        /// The fully-qualified PBA that could not be resolved.
        fqpba: FullyQualifiedPba,
    },

    /// Decode of a durable record failed; fatal for the replica set.
    #[error("data corruption detected: {message}")]
    Corruption {
        /// Description of the corruption.
        message: String,
    },

    /// Checksum mismatch on a durable record.
    #[error("checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch {
        /// Expected checksum.
        expected: u32,
        /// Actual checksum.
        actual: u32,
    },

    /// I/O error from the underlying system.
    #[error("I/O error: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// Operation timed out.
    #[error("operation timed out after {duration_ms}ms")]
    Timeout {
        /// Timeout duration in milliseconds.
        duration_ms: u64,
    },

    /// The component has been stopped.
    #[error("component is closed")]
    Closed,

    /// No replica set with the given group ID exists.
    #[error("replica set {group_id} not found")]
    ReplicaSetNotFound {
        /// The missing group.
        group_id: GroupId,
    },

    /// An LSN outside the valid range was supplied.
    #[error("invalid LSN {lsn}")]
    InvalidLsn {
        /// The invalid LSN.
        lsn: Lsn,
    },

    /// Operation not supported by the selected backend.
    #[error("operation not supported: {operation}")]
    NotSupported {
        /// The unsupported operation.
        operation: String,
    },

    /// Invalid argument provided.
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// Error message.
        message: String,
    },

    /// Internal error - this indicates a bug.
    #[error("internal error: {message}")]
    Internal {
        /// Error message.
        message: String,
    },
}

impl ReplError {
    /// Returns true if the caller may retry the operation.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::RemoteUnavailable { .. } | Self::ConsensusRejected { .. }
        )
    }

    /// Returns true if the error is fatal for its replica set.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Corruption { .. } | Self::ChecksumMismatch { .. } | Self::LogStoreFailure { .. }
        )
    }

    /// Creates a corruption error.
    #[must_use]
    pub fn corruption(message: impl Into<String>) -> Self {
        Self::Corruption {
            message: message.into(),
        }
    }

    /// Creates a log store failure.
    #[must_use]
    pub fn log_store(reason: impl Into<String>) -> Self {
        Self::LogStoreFailure {
            reason: reason.into(),
        }
    }

    /// Creates an invalid argument error.
    #[must_use]
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Creates a not-supported error.
    #[must_use]
    pub fn not_supported(operation: impl Into<String>) -> Self {
        Self::NotSupported {
            operation: operation.into(),
        }
    }
}
