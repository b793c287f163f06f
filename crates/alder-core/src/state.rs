//! Versioned state records and side data blobs.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;

/// A single versioned record in the state store.
///
/// Every committed version of a state carries a revision drawn from one
/// store-wide monotonically increasing sequence. Revisions are therefore
/// comparable across states: they define the total order used for stream
/// delivery and the preconditions for optimistic concurrency.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct State {
    /// Identifier of the state. Stable across revisions.
    pub id: String,
    /// Revision assigned by the store on commit.
    ///
    /// On a state submitted for commit this is the optimistic-concurrency
    /// precondition: the store rejects the commit with
    /// [`RevMismatch`](crate::StateStoreError::RevMismatch) unless it equals
    /// the current latest revision of the state (0 for a state that does not
    /// exist yet).
    pub rev: u64,
    /// Indexed key-value pairs used to address states in queries.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Unindexed key-value payload carried by the state.
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

impl State {
    /// Create a state with the given identifier and no labels or annotations.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    /// Set a label, consuming and returning the state.
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Set an annotation, consuming and returning the state.
    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.insert(key.into(), value.into());
        self
    }

    /// Get an annotation value, if present.
    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations.get(key).map(String::as_str)
    }

    /// Check whether every label in `labels` is present with the same value.
    pub fn matches_labels(&self, labels: &BTreeMap<String, String>) -> bool {
        labels.iter().all(|(k, v)| self.labels.get(k) == Some(v))
    }
}

/// A side payload stored next to the states.
///
/// Blobs are written atomically with states in the same commit and are
/// addressed by id only; they carry no revision of their own.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DataBlob {
    /// Identifier of the blob.
    pub id: String,
    /// Raw payload bytes.
    pub bytes: Vec<u8>,
}

impl DataBlob {
    /// Create a blob.
    pub fn new(id: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            id: id.into(),
            bytes: bytes.into(),
        }
    }
}
