//! The state-store driver contract.

use async_trait::async_trait;
use tokio::sync::watch;

use crate::command::CommitRequest;
use crate::command::CommitResult;
use crate::error::StateStoreError;
use crate::query::GetDataRequest;
use crate::query::GetStateByLabelsRequest;
use crate::query::GetStateRequest;
use crate::query::QueryRequest;
use crate::query::QueryResult;
use crate::state::DataBlob;
use crate::state::State;

/// Durable versioned state store.
///
/// The sole dependency of the messaging layer. Implementations must provide:
///
/// - a single monotonically increasing revision sequence shared by all
///   states, assigned on commit;
/// - atomic multi-command commits with per-`Park` revision-compare-and-swap
///   preconditions, rejected as a whole with
///   [`StateStoreError::RevMismatch`] when any precondition fails;
/// - label queries returning committed versions in ascending revision order.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Apply a sequence of park/store-data commands atomically.
    async fn commit(&self, request: CommitRequest) -> Result<CommitResult, StateStoreError>;

    /// Read one state by id, at a specific revision or the latest.
    async fn get_state(&self, request: GetStateRequest) -> Result<State, StateStoreError>;

    /// Read the latest state matching a set of labels.
    async fn get_state_by_labels(&self, request: GetStateByLabelsRequest) -> Result<State, StateStoreError>;

    /// Scan committed state versions by labels in revision order.
    async fn query_states(&self, request: QueryRequest) -> Result<QueryResult, StateStoreError>;

    /// Read a side data blob by id.
    async fn get_data(&self, request: GetDataRequest) -> Result<DataBlob, StateStoreError>;

    /// Subscribe to the store head revision.
    ///
    /// The receiver observes the revision of the most recent commit; it is
    /// how iterators block for new data instead of polling.
    fn watch_head(&self) -> watch::Receiver<u64>;
}

// Blanket implementation for Arc<T>
#[async_trait]
impl<T: StateStore + ?Sized> StateStore for std::sync::Arc<T> {
    async fn commit(&self, request: CommitRequest) -> Result<CommitResult, StateStoreError> {
        (**self).commit(request).await
    }

    async fn get_state(&self, request: GetStateRequest) -> Result<State, StateStoreError> {
        (**self).get_state(request).await
    }

    async fn get_state_by_labels(&self, request: GetStateByLabelsRequest) -> Result<State, StateStoreError> {
        (**self).get_state_by_labels(request).await
    }

    async fn query_states(&self, request: QueryRequest) -> Result<QueryResult, StateStoreError> {
        (**self).query_states(request).await
    }

    async fn get_data(&self, request: GetDataRequest) -> Result<DataBlob, StateStoreError> {
        (**self).get_data(request).await
    }

    fn watch_head(&self) -> watch::Receiver<u64> {
        (**self).watch_head()
    }
}
