//! Consumer instances: group attachment, delivery and commit.
//!
//! A consumer attaches to a (stream, group) pair and either claims group
//! ownership or stands by behind the current owner. Only the active owner
//! delivers messages; standbys watch the ownership record and take over
//! when the owner goes quiet. All cross-consumer coordination is
//! compare-and-swap on the ownership record's revision (see
//! [`ownership`](crate::ownership) and [`coordinator`](crate::coordinator)).

use std::sync::Arc;
use std::time::Duration;

use alder_core::CommitRequest;
use alder_core::GetStateByLabelsRequest;
use alder_core::GetStateRequest;
use alder_core::QueryRequest;
use alder_core::State;
use alder_core::StateIter;
use alder_core::StateStore;
use alder_core::StateStoreError;
use tokio::sync::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::coordinator;
use crate::error::StreamError;
use crate::message::Message;
use crate::ownership::can_consume;
use crate::ownership::committed_rev;
use crate::ownership::new_ownership_record;
use crate::ownership::ownership_labels;
use crate::ownership::stream_labels;
use crate::ownership::ANNOTATION_BODY;
use crate::ownership::ANNOTATION_COMMITTED_REV;
use crate::ownership::ANNOTATION_DATA_BODY;
use crate::ownership::ANNOTATION_OWNER_STATE;
use crate::ownership::LABEL_STREAM;
use crate::ownership::OWNER_RELEASED;

/// Interval between heartbeat attempts while active.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(29);

/// How long a standby waits without ownership-record updates before it
/// attempts takeover. More than two heartbeat intervals: a healthy owner
/// always refreshes the record first.
pub const TAKEOVER_INTERVAL: Duration = Duration::from_secs(60);

/// Backoff after a failed store operation in the coordinator.
pub const RETRY_BACKOFF: Duration = Duration::from_secs(5);

/// Coordination timing. The defaults are the protocol constants; tests
/// shrink them to milliseconds.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Heartbeat period while active.
    pub heartbeat_interval: Duration,
    /// Quiet period after which a standby attempts takeover.
    pub takeover_interval: Duration,
    /// Retry backoff after coordinator store errors.
    pub retry_backoff: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: HEARTBEAT_INTERVAL,
            takeover_interval: TAKEOVER_INTERVAL,
            retry_backoff: RETRY_BACKOFF,
        }
    }
}

/// In-process state guarded by the consumer's single mutex: the cached
/// ownership record, the delivery cursor bound to its committed revision,
/// and the message handed out by the last successful `next`.
pub(crate) struct Shared<S: StateStore + ?Sized> {
    pub(crate) record: State,
    pub(crate) cursor: StateIter<S>,
    pub(crate) current: Option<Message>,
    pub(crate) err: Option<StreamError>,
}

/// State shared between a consumer's public surface and its coordinator
/// task.
pub(crate) struct ConsumerCore<S: StateStore + ?Sized> {
    pub(crate) id: String,
    pub(crate) stream: String,
    pub(crate) group: String,
    pub(crate) store: Arc<S>,
    pub(crate) config: ConsumerConfig,
    pub(crate) shared: Mutex<Shared<S>>,
    /// Fired when an adopted record flips this consumer from active to
    /// standby, to cut short a blocked [`Consumer::wait`].
    pub(crate) demoted: Notify,
}

impl<S: StateStore + ?Sized> ConsumerCore<S> {
    /// Clone the cached ownership record.
    pub(crate) async fn snapshot(&self) -> State {
        self.shared.lock().await.record.clone()
    }

    /// Replace the cached record. Rebuilding the cursor restarts delivery
    /// strictly after the record's committed revision; it happens on every
    /// successful local write (commit, heartbeat, takeover, re-read), never
    /// on plain observation of someone else's write.
    pub(crate) fn adopt_locked(&self, shared: &mut Shared<S>, record: State, rebuild_cursor: bool) {
        let was_active = can_consume(&shared.record, &self.id);
        shared.record = record;
        if was_active && !can_consume(&shared.record, &self.id) {
            self.demoted.notify_waiters();
        }
        if rebuild_cursor {
            shared.cursor = StateIter::new(
                self.store.clone(),
                stream_labels(&self.stream),
                committed_rev(&shared.record),
                false,
            );
            shared.err = None;
        }
    }

    pub(crate) async fn adopt(&self, record: State, rebuild_cursor: bool) {
        let mut shared = self.shared.lock().await;
        self.adopt_locked(&mut shared, record, rebuild_cursor);
    }

    /// Re-read the ownership record (creating it if it vanished from the
    /// query window) and adopt the result. The answer to any revision
    /// mismatch: our cached view was stale.
    pub(crate) async fn refresh(&self, since_rev: u64) -> Result<(), StreamError> {
        let record = fetch_or_create_record(&self.store, &self.stream, &self.group, &self.id, since_rev).await?;
        self.adopt(record, true).await;
        Ok(())
    }

    /// Revision of the newest message record in the stream; 0 when the
    /// stream has never seen a message. Heartbeat and takeover are both
    /// gated on this exceeding the committed revision: with nothing to
    /// deliver there is nothing to keep alive or steal.
    pub(crate) async fn stream_head(&self) -> Result<u64, StreamError> {
        let request = GetStateByLabelsRequest::new([(LABEL_STREAM, self.stream.as_str())]);
        match self.store.get_state_by_labels(request).await {
            Ok(state) => Ok(state.rev),
            Err(StateStoreError::NotFound { .. }) => Ok(0),
            Err(error) => Err(error.into()),
        }
    }
}

/// Find the group's ownership record, or create it claiming ownership for
/// `consumer_id`. Losing the creation race is not an error: the winner's
/// record is adopted and the caller proceeds as standby.
pub(crate) async fn fetch_or_create_record<S: StateStore + ?Sized>(
    store: &Arc<S>,
    stream: &str,
    group: &str,
    consumer_id: &str,
    since_rev: u64,
) -> Result<State, StreamError> {
    let query = QueryRequest {
        labels: ownership_labels(stream, group),
        since_rev,
        latest_only: true,
        limit: Some(1),
    };
    let result = store.query_states(query).await?;
    if let Some(record) = result.states.into_iter().next() {
        return Ok(record);
    }

    let record = new_ownership_record(stream, group, consumer_id);
    match store.commit(CommitRequest::park(record)).await {
        Ok(mut result) => Ok(result.states.remove(0)),
        Err(error) if error.is_rev_mismatch() => {
            // Another consumer created it first; adopt the winning record.
            let id = crate::ownership::ownership_state_id(stream, group);
            Ok(store.get_state(GetStateRequest::latest(id)).await?)
        }
        Err(error) => Err(error.into()),
    }
}

/// A consumer attached to a (stream, group).
///
/// At most one consumer per group is active at any instant; the others
/// stand by and take over transparently when the active one disappears.
/// Delivery is at-least-once: a failover re-delivers everything after the
/// last committed revision.
///
/// Dropping a consumer cancels its coordinator task. A standby dropped
/// without [`shutdown`](Consumer::shutdown) simply stops competing; an
/// active consumer dropped without `shutdown` looks like a crash and the
/// group recovers through the standby takeover timeout.
pub struct Consumer<S: StateStore + ?Sized> {
    core: Arc<ConsumerCore<S>>,
    cancel: CancellationToken,
}

impl<S: StateStore + ?Sized + 'static> Consumer<S> {
    /// Attach to `(stream, group)` with the default protocol timing.
    ///
    /// # Panics
    ///
    /// Panics when `stream` or `group` is empty; that is a caller bug.
    pub async fn attach(
        stream: impl Into<String>,
        group: impl Into<String>,
        store: Arc<S>,
    ) -> Result<Self, StreamError> {
        Self::attach_with_config(stream, group, store, ConsumerConfig::default()).await
    }

    /// Attach with explicit timing.
    pub async fn attach_with_config(
        stream: impl Into<String>,
        group: impl Into<String>,
        store: Arc<S>,
        config: ConsumerConfig,
    ) -> Result<Self, StreamError> {
        let stream = stream.into();
        let group = group.into();
        assert!(!stream.is_empty(), "stream is required");
        assert!(!group.is_empty(), "group is required");

        let id = Uuid::now_v7().to_string();
        let record = fetch_or_create_record(&store, &stream, &group, &id, 0).await?;
        let cursor = StateIter::new(store.clone(), stream_labels(&stream), committed_rev(&record), false);

        debug!(
            consumer = %id,
            stream = %stream,
            group = %group,
            rev = record.rev,
            active = can_consume(&record, &id),
            "attached to group"
        );

        let core = Arc::new(ConsumerCore {
            id,
            stream,
            group,
            store,
            config,
            shared: Mutex::new(Shared {
                record,
                cursor,
                current: None,
                err: None,
            }),
            demoted: Notify::new(),
        });

        let cancel = CancellationToken::new();
        tokio::spawn(coordinator::run(core.clone(), cancel.clone()));

        Ok(Self { core, cancel })
    }
}

impl<S: StateStore + ?Sized> Consumer<S> {
    /// This consumer instance's unique identifier.
    pub fn id(&self) -> &str {
        &self.core.id
    }

    /// Advance to the next message. Returns false when the consumer is in
    /// standby, no further message is currently committed, or the cursor
    /// failed (see [`err`](Consumer::err)).
    pub async fn next(&self) -> bool {
        let mut shared = self.core.shared.lock().await;
        if !can_consume(&shared.record, &self.core.id) {
            return false;
        }

        let Some(state) = shared.cursor.next().await else {
            return false;
        };

        match self.resolve_body(&state).await {
            Ok(body) => {
                shared.current = Some(Message { rev: state.rev, body });
                true
            }
            Err(error) => {
                shared.err = Some(error);
                false
            }
        }
    }

    /// The message of the last successful [`next`](Consumer::next).
    ///
    /// # Panics
    ///
    /// Panics when no `next` call has returned true; that is a caller bug.
    pub async fn message(&self) -> Message {
        let shared = self.core.shared.lock().await;
        shared
            .current
            .clone()
            .expect("next() must be called and return true before message()")
    }

    /// The delivery error, if the cursor or a body read has failed.
    pub async fn err(&self) -> Option<StreamError> {
        let shared = self.core.shared.lock().await;
        shared
            .err
            .clone()
            .or_else(|| shared.cursor.err().map(|error| error.clone().into()))
    }

    /// Block until a new message may be available, the timeout elapses, or
    /// this consumer is demoted. A standby consumer just sleeps out the
    /// timeout.
    pub async fn wait(&self, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        let (active, watermark) = {
            let shared = self.core.shared.lock().await;
            (
                can_consume(&shared.record, &self.core.id),
                shared.cursor.since_rev(),
            )
        };

        if !active {
            tokio::time::sleep_until(deadline).await;
            return;
        }

        let mut head = self.core.store.watch_head();
        loop {
            if *head.borrow_and_update() > watermark {
                return;
            }
            if !can_consume(&self.core.shared.lock().await.record, &self.core.id) {
                return;
            }
            tokio::select! {
                changed = head.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
                _ = self.core.demoted.notified() => return,
                _ = tokio::time::sleep_until(deadline) => return,
            }
        }
    }

    /// Persist delivery progress: every message up to and including `rev`
    /// is acknowledged, and the cursor restarts strictly after it.
    ///
    /// Fails with [`StreamError::NotActive`] when this consumer does not
    /// hold the group, including when the commit itself loses a revision
    /// race, which means ownership moved; the winning record is adopted
    /// before returning.
    pub async fn commit(&self, rev: u64) -> Result<(), StreamError> {
        let mut shared = self.core.shared.lock().await;
        if !can_consume(&shared.record, &self.core.id) {
            return Err(StreamError::NotActive);
        }

        let mut record = shared.record.clone();
        record
            .annotations
            .insert(ANNOTATION_COMMITTED_REV.to_string(), rev.to_string());

        match self.core.store.commit(CommitRequest::park(record)).await {
            Ok(mut result) => {
                let record = result.states.remove(0);
                self.core.adopt_locked(&mut shared, record, true);
                Ok(())
            }
            Err(error) if error.is_rev_mismatch() => {
                let id = crate::ownership::ownership_state_id(&self.core.stream, &self.core.group);
                let record = self.core.store.get_state(GetStateRequest::latest(id)).await?;
                self.core.adopt_locked(&mut shared, record, true);
                Err(StreamError::NotActive)
            }
            Err(error) => Err(error.into()),
        }
    }

    /// Release group ownership cleanly.
    ///
    /// When this consumer holds the group: cancels the coordinator, then
    /// writes `state = "0"` so peers take over on their next tick instead
    /// of waiting out the takeover timeout. A failed release write is
    /// returned but needs no handling: the coordinator is already stopped
    /// and the group recovers through the timeout regardless.
    ///
    /// A standby's `shutdown` is a no-op: it keeps competing for the group
    /// until dropped. Calling `shutdown` twice is safe.
    pub async fn shutdown(&self) -> Result<(), StreamError> {
        let mut shared = self.core.shared.lock().await;
        if !can_consume(&shared.record, &self.core.id) {
            return Ok(());
        }

        self.cancel.cancel();

        let mut record = shared.record.clone();
        record
            .annotations
            .insert(ANNOTATION_OWNER_STATE.to_string(), OWNER_RELEASED.to_string());
        let mut result = self.core.store.commit(CommitRequest::park(record)).await?;
        self.core.adopt_locked(&mut shared, result.states.remove(0), true);
        Ok(())
    }

    /// Convenience loop over [`next`](Consumer::next) and
    /// [`wait`](Consumer::wait): the next message, or
    /// [`StreamError::ReceiveTimeout`] when none arrives in time.
    pub async fn receive(&self, timeout: Duration) -> Result<Message, StreamError> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.next().await {
                return Ok(self.message().await);
            }
            if let Some(error) = self.err().await {
                return Err(error);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(StreamError::ReceiveTimeout);
            }
            self.wait(deadline - now).await;
        }
    }

    async fn resolve_body(&self, state: &State) -> Result<Vec<u8>, StreamError> {
        if let Some(body) = state.annotation(ANNOTATION_BODY) {
            return Ok(body.as_bytes().to_vec());
        }
        if let Some(blob_id) = state.annotation(ANNOTATION_DATA_BODY) {
            let blob = self
                .core
                .store
                .get_data(alder_core::GetDataRequest::new(blob_id))
                .await?;
            return Ok(blob.bytes);
        }
        Ok(Vec::new())
    }
}

impl<S: StateStore + ?Sized> Drop for Consumer<S> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use alder_testing::DeterministicStateStore;

    use super::*;
    use crate::ownership::ANNOTATION_OWNER_ID;

    #[tokio::test]
    async fn fetch_or_create_claims_a_fresh_group() {
        let store = Arc::new(DeterministicStateStore::new());

        let record = fetch_or_create_record(&store, "fooStream", "g", "c-1", 0).await.unwrap();

        assert_eq!(record.id, "consumer.fooStream.g");
        assert_eq!(record.annotation(ANNOTATION_OWNER_ID), Some("c-1"));
        assert!(can_consume(&record, "c-1"));
        assert!(record.rev > 0, "the created record carries its committed revision");
    }

    #[tokio::test]
    async fn fetch_or_create_adopts_an_existing_record() {
        let store = Arc::new(DeterministicStateStore::new());
        let winner = fetch_or_create_record(&store, "fooStream", "g", "c-1", 0).await.unwrap();

        let adopted = fetch_or_create_record(&store, "fooStream", "g", "c-2", 0).await.unwrap();

        assert_eq!(adopted, winner);
        assert!(!can_consume(&adopted, "c-2"));
    }

    #[tokio::test]
    async fn fetch_or_create_adopts_the_winner_after_losing_the_create_race() {
        let store = Arc::new(DeterministicStateStore::new());
        let winner = fetch_or_create_record(&store, "fooStream", "g", "c-1", 0).await.unwrap();

        // Querying past the winner's revision sees nothing, so c-2 attempts
        // the create, loses the revision race and must adopt the winner.
        let adopted = fetch_or_create_record(&store, "fooStream", "g", "c-2", winner.rev).await.unwrap();

        assert_eq!(adopted.annotation(ANNOTATION_OWNER_ID), Some("c-1"));
        assert_eq!(adopted.rev, winner.rev);
    }
}
