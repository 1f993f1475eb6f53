//! Error taxonomy for the engine.
//!
//! Callers are expected to retry the whole transaction on
//! [`EngineError::TransactionConflict`] and to treat every other variant as
//! fatal for the transaction that produced it.

use crate::config::ConfigError;
use crate::storage::StorageError;

/// Why a write upgrade was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictReason {
    /// Another write transaction currently holds the writer slot.
    WriterActive,
    /// A newer write transaction committed after this snapshot was taken.
    SnapshotOutdated,
}

impl std::fmt::Display for ConflictReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::WriterActive => write!(f, "another write transaction is active"),
            Self::SnapshotOutdated => write!(f, "a newer transaction already committed"),
        }
    }
}

/// Errors returned by engine and transaction operations.
#[derive(Debug)]
pub enum EngineError {
    /// Underlying block storage failed.
    Storage(StorageError),
    /// Persisted bytes failed validation (checksum, magic, header slots).
    Corruption(String),
    /// Write upgrade denied. Retryable.
    TransactionConflict(ConflictReason),
    /// A structural invariant of the engine was violated.
    Internal(String),
    /// The call is not legal in the transaction's current state.
    InvalidOperation(&'static str),
    /// Configuration or persisted format parameters are invalid.
    Config(ConfigError),
    /// A commit failed after writing its header slot. The on-disk state is
    /// unknown until the database is reopened, so writes are refused.
    Poisoned,
}

impl EngineError {
    /// Whether the caller should restart the transaction and try again.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::TransactionConflict(_))
    }

    /// Whether the error reports damaged persistent data.
    #[must_use]
    pub const fn is_corruption(&self) -> bool {
        matches!(self, Self::Corruption(_))
    }

    pub(crate) fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    pub(crate) fn corruption(message: impl Into<String>) -> Self {
        Self::Corruption(message.into())
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Storage(e) => write!(f, "storage error: {e}"),
            Self::Corruption(msg) => write!(f, "corruption: {msg}"),
            Self::TransactionConflict(reason) => write!(f, "transaction conflict: {reason}"),
            Self::Internal(msg) => write!(f, "internal error: {msg}"),
            Self::InvalidOperation(msg) => write!(f, "invalid operation: {msg}"),
            Self::Config(e) => write!(f, "configuration error: {e}"),
            Self::Poisoned => write!(f, "a commit failed after writing its header; reopen the database"),
        }
    }
}

impl std::error::Error for EngineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Storage(e) => Some(e),
            Self::Config(e) => Some(e),
            _ => None,
        }
    }
}

impl From<StorageError> for EngineError {
    fn from(e: StorageError) -> Self {
        Self::Storage(e)
    }
}

impl From<ConfigError> for EngineError {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}
