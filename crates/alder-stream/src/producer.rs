//! Appending messages to streams.

use std::sync::Arc;

use alder_core::CommitRequest;
use alder_core::DataBlob;
use alder_core::State;
use alder_core::StateStore;
use uuid::Uuid;

use crate::error::StreamError;
use crate::message::INLINE_BODY_MAX;
use crate::message::ProduceMessage;
use crate::ownership::ANNOTATION_BODY;
use crate::ownership::ANNOTATION_DATA_BODY;
use crate::ownership::LABEL_STREAM;

/// Stateless producer: appends message records to streams.
///
/// A batch is committed atomically; messages within one batch receive
/// consecutive revisions. One producer can serve any number of streams, the
/// target stream is named per message.
pub struct Producer<S: StateStore + ?Sized> {
    store: Arc<S>,
}

impl<S: StateStore + ?Sized> Producer<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Append a batch of messages as one atomic commit.
    ///
    /// An empty batch is rejected with [`StreamError::EmptyBatch`].
    /// Validation failures are accumulated across the whole batch and
    /// returned as one [`StreamError::Invalid`]; nothing reaches the store.
    pub async fn send(&self, messages: &[ProduceMessage]) -> Result<(), StreamError> {
        if messages.is_empty() {
            return Err(StreamError::EmptyBatch);
        }

        let mut reasons = Vec::new();
        for (index, message) in messages.iter().enumerate() {
            if message.stream.is_empty() {
                reasons.push(format!("message {index}: stream is required"));
            }
        }
        if !reasons.is_empty() {
            return Err(StreamError::Invalid { reasons });
        }

        let mut request = CommitRequest::new(Vec::new());
        for message in messages {
            let id = Uuid::now_v7().to_string();
            let state = State::new(&id).with_label(LABEL_STREAM, &message.stream);

            // Small printable bodies travel inline in an annotation; anything
            // else goes to a side blob referenced from the record.
            match std::str::from_utf8(&message.body) {
                Ok(text) if message.body.len() <= INLINE_BODY_MAX => {
                    request = request.and_park(state.with_annotation(ANNOTATION_BODY, text));
                }
                _ => {
                    let blob_id = format!("{id}.body");
                    request = request
                        .and_park(state.with_annotation(ANNOTATION_DATA_BODY, &blob_id))
                        .and_store_data(DataBlob::new(blob_id, message.body.clone()));
                }
            }
        }

        self.store.commit(request).await?;
        Ok(())
    }
}
