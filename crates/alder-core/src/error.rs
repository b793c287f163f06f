//! Error types for state-store operations.

use thiserror::Error;

/// Errors returned by [`StateStore`](crate::StateStore) implementations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StateStoreError {
    /// A `Park` precondition failed: the state advanced past the revision
    /// the writer read. The writer must re-read before retrying.
    #[error("revision mismatch for state '{id}': committed at {expected}, store at {actual}")]
    RevMismatch { id: String, expected: u64, actual: u64 },

    /// No state or blob exists for the requested id.
    #[error("state '{id}' not found")]
    NotFound { id: String },

    /// A commit request carried no commands.
    #[error("commit contains no commands")]
    EmptyCommit,

    /// The store could not be reached or failed internally.
    #[error("store unavailable: {reason}")]
    Unavailable { reason: String },
}

impl StateStoreError {
    /// True when the error is an optimistic-concurrency conflict.
    pub fn is_rev_mismatch(&self) -> bool {
        matches!(self, StateStoreError::RevMismatch { .. })
    }
}
