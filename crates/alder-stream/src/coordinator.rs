//! The per-consumer coordination task.
//!
//! One task per consumer, driven by three event sources:
//!
//! 1. a durable iterator over the group's ownership record (`latest_only`,
//!    since the last observed revision): every newer record is adopted and
//!    the consumer's role re-evaluated;
//! 2. a single reusable timer, heartbeat period while active and takeover
//!    period while standby, reset on every role transition *and* on every
//!    adopted update (a standby only attempts takeover after a full quiet
//!    period with no sign of the owner);
//! 3. the consumer's cancellation token.
//!
//! Store errors are logged and retried after a fixed backoff; nothing
//! escapes the task. A failed iterator is recreated at its watermark so no
//! ownership update is observed twice.

use std::sync::Arc;

use alder_core::CommitRequest;
use alder_core::State;
use alder_core::StateIter;
use alder_core::StateStore;
use alder_core::StateStoreError;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::consumer::ConsumerCore;
use crate::error::StreamError;
use crate::ownership::can_consume;
use crate::ownership::committed_rev;
use crate::ownership::is_active;
use crate::ownership::ownership_labels;
use crate::ownership::ANNOTATION_OWNER_ID;
use crate::ownership::ANNOTATION_OWNER_STATE;
use crate::ownership::OWNER_ACTIVE;

pub(crate) async fn run<S: StateStore + ?Sized + 'static>(core: Arc<ConsumerCore<S>>, cancel: CancellationToken) {
    let mut snapshot = core.snapshot().await;
    let mut updates = ownership_iter(&core, snapshot.rev);

    let timer = tokio::time::sleep(role_period(&core, &snapshot));
    tokio::pin!(timer);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,

            _ = timer.as_mut() => {
                let result = if can_consume(&snapshot, &core.id) {
                    maybe_heartbeat(&core).await
                } else {
                    maybe_takeover(&core).await
                };
                snapshot = core.snapshot().await;
                match result {
                    Ok(()) => timer.as_mut().reset(Instant::now() + role_period(&core, &snapshot)),
                    Err(error) => {
                        warn!(
                            consumer = %core.id,
                            stream = %core.stream,
                            group = %core.group,
                            error = %error,
                            "heartbeat or takeover attempt failed"
                        );
                        timer.as_mut().reset(Instant::now() + core.config.retry_backoff);
                    }
                }
            }

            update = next_update(&mut updates) => match update {
                Ok(record) => {
                    if record.rev <= snapshot.rev {
                        continue;
                    }
                    core.adopt(record.clone(), false).await;
                    snapshot = record;
                    debug!(
                        consumer = %core.id,
                        rev = snapshot.rev,
                        active = can_consume(&snapshot, &core.id),
                        annotations = ?snapshot.annotations,
                        "adopted ownership record"
                    );

                    if !is_active(&snapshot) {
                        // The owner released the group; claim it without
                        // waiting out the standby period.
                        match takeover(&core).await {
                            Ok(()) => snapshot = core.snapshot().await,
                            Err(error) => {
                                warn!(
                                    consumer = %core.id,
                                    stream = %core.stream,
                                    group = %core.group,
                                    error = %error,
                                    "takeover of released group failed"
                                );
                                timer.as_mut().reset(Instant::now() + core.config.retry_backoff);
                                continue;
                            }
                        }
                    }

                    timer.as_mut().reset(Instant::now() + role_period(&core, &snapshot));
                }
                Err(error) => {
                    warn!(
                        consumer = %core.id,
                        stream = %core.stream,
                        group = %core.group,
                        error = %error,
                        "ownership record iterator failed"
                    );
                    updates = ownership_iter(&core, updates.since_rev());
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(core.config.retry_backoff) => {}
                    }
                }
            },
        }
    }
}

fn ownership_iter<S: StateStore + ?Sized>(core: &ConsumerCore<S>, since_rev: u64) -> StateIter<S> {
    StateIter::new(
        core.store.clone(),
        ownership_labels(&core.stream, &core.group),
        since_rev,
        true,
    )
}

fn role_period<S: StateStore + ?Sized>(core: &ConsumerCore<S>, record: &State) -> std::time::Duration {
    if can_consume(record, &core.id) {
        core.config.heartbeat_interval
    } else {
        core.config.takeover_interval
    }
}

/// The next ownership-record update, blocking until one is committed.
async fn next_update<S: StateStore + ?Sized>(iter: &mut StateIter<S>) -> Result<State, StateStoreError> {
    loop {
        match iter.next().await {
            Some(state) => return Ok(state),
            None => match iter.err() {
                Some(error) => return Err(error.clone()),
                None => iter.wait().await,
            },
        }
    }
}

/// Refresh the ownership record if the stream holds messages past the
/// committed revision; a record nobody needs to steal needs no heartbeat.
async fn maybe_heartbeat<S: StateStore + ?Sized>(core: &ConsumerCore<S>) -> Result<(), StreamError> {
    let head = core.stream_head().await?;

    let mut shared = core.shared.lock().await;
    if !can_consume(&shared.record, &core.id) {
        // Demoted between the timer firing and now.
        return Ok(());
    }
    if head <= committed_rev(&shared.record) {
        return Ok(());
    }

    let record = shared.record.clone();
    match core.store.commit(CommitRequest::park(record)).await {
        Ok(mut result) => {
            let record = result.states.remove(0);
            debug!(consumer = %core.id, rev = record.rev, "heartbeat refreshed ownership record");
            core.adopt_locked(&mut shared, record, true);
            Ok(())
        }
        Err(error) if error.is_rev_mismatch() => {
            let since_rev = shared.record.rev;
            drop(shared);
            core.refresh(since_rev).await
        }
        Err(error) => Err(error.into()),
    }
}

/// Attempt takeover if the stream holds messages past the committed
/// revision; an idle group is left with its current owner.
async fn maybe_takeover<S: StateStore + ?Sized>(core: &ConsumerCore<S>) -> Result<(), StreamError> {
    let head = core.stream_head().await?;

    {
        let shared = core.shared.lock().await;
        if can_consume(&shared.record, &core.id) {
            return Ok(());
        }
        if head <= committed_rev(&shared.record) {
            return Ok(());
        }
    }

    takeover(core).await
}

/// Claim group ownership, preserving the committed revision so delivery
/// resumes exactly where the previous owner acknowledged.
async fn takeover<S: StateStore + ?Sized>(core: &ConsumerCore<S>) -> Result<(), StreamError> {
    let mut shared = core.shared.lock().await;
    if can_consume(&shared.record, &core.id) {
        return Ok(());
    }

    let mut record = shared.record.clone();
    record
        .annotations
        .insert(ANNOTATION_OWNER_ID.to_string(), core.id.clone());
    record
        .annotations
        .insert(ANNOTATION_OWNER_STATE.to_string(), OWNER_ACTIVE.to_string());

    match core.store.commit(CommitRequest::park(record)).await {
        Ok(mut result) => {
            let record = result.states.remove(0);
            info!(
                consumer = %core.id,
                stream = %core.stream,
                group = %core.group,
                rev = record.rev,
                since = committed_rev(&record),
                "took over group ownership"
            );
            core.adopt_locked(&mut shared, record, true);
            Ok(())
        }
        Err(error) if error.is_rev_mismatch() => {
            // Someone beat us to the record; adopt whatever won.
            let since_rev = shared.record.rev;
            drop(shared);
            core.refresh(since_rev).await
        }
        Err(error) => Err(error.into()),
    }
}
