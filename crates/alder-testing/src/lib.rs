//! Deterministic in-memory state store for tests.
//!
//! [`DeterministicStateStore`] implements the full [`StateStore`] contract
//! without I/O or background tasks: a single global revision sequence, an
//! append-only version log, per-id latest tracking and a head watch channel.
//! Commits are validated in full before any command applies, so a failed
//! compare-and-swap leaves the store untouched.
//!
//! Fault injection ([`fail_commits`](DeterministicStateStore::fail_commits),
//! [`fail_queries`](DeterministicStateStore::fail_queries)) turns the store
//! unavailable for the matching operation, for exercising retry and
//! iterator-recovery paths.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::watch;

use alder_core::Command;
use alder_core::CommitRequest;
use alder_core::CommitResult;
use alder_core::DataBlob;
use alder_core::GetDataRequest;
use alder_core::GetStateByLabelsRequest;
use alder_core::GetStateRequest;
use alder_core::QueryRequest;
use alder_core::QueryResult;
use alder_core::State;
use alder_core::StateStore;
use alder_core::StateStoreError;

/// In-memory [`StateStore`] with linearizable commits.
pub struct DeterministicStateStore {
    inner: Mutex<Inner>,
    head_tx: watch::Sender<u64>,
}

#[derive(Default)]
struct Inner {
    /// Every committed version, in revision order.
    log: Vec<State>,
    /// Latest committed version per state id.
    latest: HashMap<String, State>,
    blobs: HashMap<String, Vec<u8>>,
    next_rev: u64,
    fail_commits: bool,
    fail_queries: bool,
}

impl DeterministicStateStore {
    pub fn new() -> Self {
        let (head_tx, _) = watch::channel(0);
        Self {
            inner: Mutex::new(Inner::default()),
            head_tx,
        }
    }

    /// Make every subsequent commit fail with `Unavailable`.
    pub fn fail_commits(&self, fail: bool) {
        self.inner.lock().unwrap().fail_commits = fail;
    }

    /// Make every subsequent read or query fail with `Unavailable`.
    pub fn fail_queries(&self, fail: bool) {
        self.inner.lock().unwrap().fail_queries = fail;
    }

    /// The revision of the most recent commit.
    pub fn head_rev(&self) -> u64 {
        self.inner.lock().unwrap().next_rev
    }
}

impl Default for DeterministicStateStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StateStore for DeterministicStateStore {
    async fn commit(&self, request: CommitRequest) -> Result<CommitResult, StateStoreError> {
        if request.commands.is_empty() {
            return Err(StateStoreError::EmptyCommit);
        }

        let mut inner = self.inner.lock().unwrap();
        if inner.fail_commits {
            return Err(StateStoreError::Unavailable {
                reason: "injected commit failure".to_string(),
            });
        }

        // Validate every precondition before applying anything. Within one
        // commit a later Park of the same id is checked against the revision
        // the earlier Park will be assigned.
        let mut pending: HashMap<&str, u64> = HashMap::new();
        let mut assigned = inner.next_rev;
        for command in &request.commands {
            if let Command::Park(state) = command {
                let current = pending
                    .get(state.id.as_str())
                    .copied()
                    .or_else(|| inner.latest.get(&state.id).map(|s| s.rev))
                    .unwrap_or(0);
                if state.rev != current {
                    return Err(StateStoreError::RevMismatch {
                        id: state.id.clone(),
                        expected: state.rev,
                        actual: current,
                    });
                }
                assigned += 1;
                pending.insert(state.id.as_str(), assigned);
            }
        }

        let mut states = Vec::new();
        for command in request.commands {
            match command {
                Command::Park(mut state) => {
                    inner.next_rev += 1;
                    state.rev = inner.next_rev;
                    inner.log.push(state.clone());
                    inner.latest.insert(state.id.clone(), state.clone());
                    states.push(state);
                }
                Command::StoreData(blob) => {
                    inner.blobs.insert(blob.id, blob.bytes);
                }
            }
        }

        let _ = self.head_tx.send(inner.next_rev);
        Ok(CommitResult { states })
    }

    async fn get_state(&self, request: GetStateRequest) -> Result<State, StateStoreError> {
        let inner = self.inner.lock().unwrap();
        if inner.fail_queries {
            return Err(StateStoreError::Unavailable {
                reason: "injected query failure".to_string(),
            });
        }

        match request.rev {
            None => inner
                .latest
                .get(&request.id)
                .cloned()
                .ok_or(StateStoreError::NotFound { id: request.id }),
            Some(rev) => inner
                .log
                .iter()
                .find(|s| s.id == request.id && s.rev == rev)
                .cloned()
                .ok_or(StateStoreError::NotFound { id: request.id }),
        }
    }

    async fn get_state_by_labels(&self, request: GetStateByLabelsRequest) -> Result<State, StateStoreError> {
        let inner = self.inner.lock().unwrap();
        if inner.fail_queries {
            return Err(StateStoreError::Unavailable {
                reason: "injected query failure".to_string(),
            });
        }

        inner
            .latest
            .values()
            .filter(|s| s.matches_labels(&request.labels))
            .max_by_key(|s| s.rev)
            .cloned()
            .ok_or_else(|| StateStoreError::NotFound {
                id: request
                    .labels
                    .iter()
                    .map(|(k, v)| format!("{k}={v}"))
                    .collect::<Vec<_>>()
                    .join(","),
            })
    }

    async fn query_states(&self, request: QueryRequest) -> Result<QueryResult, StateStoreError> {
        let inner = self.inner.lock().unwrap();
        if inner.fail_queries {
            return Err(StateStoreError::Unavailable {
                reason: "injected query failure".to_string(),
            });
        }

        let mut states = Vec::new();
        // The log is already in ascending revision order.
        for state in &inner.log {
            if state.rev <= request.since_rev || !state.matches_labels(&request.labels) {
                continue;
            }
            if request.latest_only && inner.latest.get(&state.id).map(|s| s.rev) != Some(state.rev) {
                continue;
            }
            states.push(state.clone());
            if request.limit.is_some_and(|limit| states.len() >= limit) {
                break;
            }
        }

        Ok(QueryResult {
            states,
            head: inner.next_rev,
        })
    }

    async fn get_data(&self, request: GetDataRequest) -> Result<DataBlob, StateStoreError> {
        let inner = self.inner.lock().unwrap();
        if inner.fail_queries {
            return Err(StateStoreError::Unavailable {
                reason: "injected query failure".to_string(),
            });
        }

        inner
            .blobs
            .get(&request.id)
            .map(|bytes| DataBlob::new(request.id.clone(), bytes.clone()))
            .ok_or(StateStoreError::NotFound { id: request.id })
    }

    fn watch_head(&self) -> watch::Receiver<u64> {
        self.head_tx.subscribe()
    }
}
