//! Read requests: point lookups, label queries and range scans.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;

use crate::state::State;

/// Request to read one state by id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GetStateRequest {
    pub id: String,
    /// Specific revision to read; `None` reads the latest.
    pub rev: Option<u64>,
}

impl GetStateRequest {
    /// Read the latest revision of a state.
    pub fn latest(id: impl Into<String>) -> Self {
        Self { id: id.into(), rev: None }
    }

    /// Read a specific revision of a state.
    pub fn at_rev(id: impl Into<String>, rev: u64) -> Self {
        Self {
            id: id.into(),
            rev: Some(rev),
        }
    }
}

/// Request to read the latest state matching a set of labels.
///
/// When several states match, the one with the highest revision wins.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GetStateByLabelsRequest {
    pub labels: BTreeMap<String, String>,
}

impl GetStateByLabelsRequest {
    pub fn new<K, V>(labels: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            labels: labels.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }
}

/// Request to scan committed state versions by labels in revision order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueryRequest {
    /// Every returned state carries all of these labels.
    pub labels: BTreeMap<String, String>,
    /// Only versions with a revision strictly greater than this are returned.
    pub since_rev: u64,
    /// Return only versions that are the current latest of their state.
    pub latest_only: bool,
    /// Maximum number of states to return; `None` means store-chosen.
    pub limit: Option<usize>,
}

impl QueryRequest {
    pub fn new<K, V>(labels: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            labels: labels.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
            since_rev: 0,
            latest_only: false,
            limit: None,
        }
    }

    /// Skip versions at or below the given revision.
    pub fn since_rev(mut self, rev: u64) -> Self {
        self.since_rev = rev;
        self
    }

    /// Collapse to currently-latest versions only.
    pub fn latest_only(mut self) -> Self {
        self.latest_only = true;
        self
    }

    /// Cap the number of returned states.
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Response from a label query.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueryResult {
    /// Matching state versions in ascending revision order.
    pub states: Vec<State>,
    /// The store head revision observed while answering the query.
    ///
    /// When `states` is empty the caller knows no match exists at or below
    /// `head`; iterators use this to advance their watermark past quiet
    /// stretches of the revision sequence.
    pub head: u64,
}

/// Request to read a side data blob by id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GetDataRequest {
    pub id: String,
}

impl GetDataRequest {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}
