//! Revision-ordered iteration over committed state versions.

use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::watch;

use crate::error::StateStoreError;
use crate::query::QueryRequest;
use crate::state::State;
use crate::store::StateStore;

/// States fetched per query page.
const PAGE_LIMIT: usize = 64;

/// A durable cursor over committed state versions matching a label set.
///
/// States are returned in ascending revision order, strictly after the
/// `since_rev` the iterator was created with. A store error makes the
/// iterator terminal: [`next`](StateIter::next) keeps returning `None` and
/// [`err`](StateIter::err) reports the failure. Callers recover by creating
/// a fresh iterator at [`since_rev`](StateIter::since_rev), which guarantees
/// already-returned states are not observed again.
pub struct StateIter<S: StateStore + ?Sized> {
    store: Arc<S>,
    labels: BTreeMap<String, String>,
    latest_only: bool,
    /// No unreturned match exists at or below this revision.
    watermark: u64,
    buffer: VecDeque<State>,
    head: watch::Receiver<u64>,
    err: Option<StateStoreError>,
}

impl<S: StateStore + ?Sized> StateIter<S> {
    /// Create an iterator over states matching `labels` with revisions
    /// strictly greater than `since_rev`.
    pub fn new(store: Arc<S>, labels: BTreeMap<String, String>, since_rev: u64, latest_only: bool) -> Self {
        let head = store.watch_head();
        Self {
            store,
            labels,
            latest_only,
            watermark: since_rev,
            buffer: VecDeque::new(),
            head,
            err: None,
        }
    }

    /// Return the next matching state, fetching a page from the store when
    /// the local buffer is drained. `None` means no further match is
    /// currently committed, or the iterator is terminal (check [`err`]).
    ///
    /// [`err`]: StateIter::err
    pub async fn next(&mut self) -> Option<State> {
        if self.err.is_some() {
            return None;
        }

        if self.buffer.is_empty() {
            let query = QueryRequest {
                labels: self.labels.clone(),
                since_rev: self.watermark,
                latest_only: self.latest_only,
                limit: Some(PAGE_LIMIT),
            };
            match self.store.query_states(query).await {
                Ok(result) => {
                    match result.states.last() {
                        Some(last) => self.watermark = last.rev,
                        // Empty page: nothing matches up to the observed head.
                        None => self.watermark = self.watermark.max(result.head),
                    }
                    self.buffer.extend(result.states);
                }
                Err(error) => {
                    self.err = Some(error);
                    return None;
                }
            }
        }

        self.buffer.pop_front()
    }

    /// The terminal error, if the iterator has failed.
    pub fn err(&self) -> Option<&StateStoreError> {
        self.err.as_ref()
    }

    /// The revision at or below which every match has been fetched.
    ///
    /// With the buffer drained (a `next` that returned `None`), recreating
    /// an iterator at this revision resumes without gaps or re-observation.
    pub fn since_rev(&self) -> u64 {
        self.watermark
    }

    /// Block until the store head moves past the watermark, meaning a new
    /// commit may match this iterator. Returns immediately when buffered
    /// states are pending or the iterator is terminal. No deadline of its
    /// own; compose with `tokio::select!` or `tokio::time::timeout`.
    pub async fn wait(&mut self) {
        if !self.buffer.is_empty() || self.err.is_some() {
            return;
        }
        loop {
            if *self.head.borrow_and_update() > self.watermark {
                return;
            }
            if self.head.changed().await.is_err() {
                // Store dropped its head channel; nothing further to wait for.
                return;
            }
        }
    }
}
