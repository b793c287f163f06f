//! The group-ownership record convention.
//!
//! Exactly one ownership record exists per (stream, group), identified by
//! [`ownership_state_id`]. Its annotations carry the whole coordination
//! state: the owning consumer's id, whether the owner currently holds the
//! group, and the committed stream revision. Every transition is a
//! compare-and-swap on the record's revision, which is the only
//! synchronization between consumers.

use std::collections::BTreeMap;

use alder_core::State;

/// Label carried by every message record: the stream name.
pub const LABEL_STREAM: &str = "stream";
/// Ownership-record label: the stream the group consumes.
pub const LABEL_CONSUMER_STREAM: &str = "consumer.stream";
/// Ownership-record label: the group name.
pub const LABEL_CONSUMER_GROUP: &str = "consumer.group";

/// Ownership annotation: id of the consumer instance claiming the group.
pub const ANNOTATION_OWNER_ID: &str = "id";
/// Ownership annotation: [`OWNER_ACTIVE`] while held, [`OWNER_RELEASED`]
/// after a clean shutdown.
pub const ANNOTATION_OWNER_STATE: &str = "state";
/// Ownership annotation: the committed stream revision as a decimal string.
pub const ANNOTATION_COMMITTED_REV: &str = "rev";

/// Message annotation holding an inline body.
pub const ANNOTATION_BODY: &str = "body";
/// Message annotation referencing a side data blob holding the body.
pub const ANNOTATION_DATA_BODY: &str = "data.body";

/// `state` value while an owner holds the group.
pub const OWNER_ACTIVE: &str = "1";
/// `state` value after the owner released the group cleanly.
pub const OWNER_RELEASED: &str = "0";

/// Deterministic identifier of the ownership record for a (stream, group).
pub fn ownership_state_id(stream: &str, group: &str) -> String {
    format!("consumer.{stream}.{group}")
}

/// The label set addressing a group's ownership record.
pub fn ownership_labels(stream: &str, group: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_CONSUMER_STREAM.to_string(), stream.to_string()),
        (LABEL_CONSUMER_GROUP.to_string(), group.to_string()),
    ])
}

/// The label set addressing a stream's message records.
pub fn stream_labels(stream: &str) -> BTreeMap<String, String> {
    BTreeMap::from([(LABEL_STREAM.to_string(), stream.to_string())])
}

/// A fresh ownership record claiming the group for `consumer_id`, ready to
/// be parked with a create precondition (rev 0).
pub fn new_ownership_record(stream: &str, group: &str, consumer_id: &str) -> State {
    State::new(ownership_state_id(stream, group))
        .with_label(LABEL_CONSUMER_STREAM, stream)
        .with_label(LABEL_CONSUMER_GROUP, group)
        .with_annotation(ANNOTATION_OWNER_ID, consumer_id)
        .with_annotation(ANNOTATION_OWNER_STATE, OWNER_ACTIVE)
        .with_annotation(ANNOTATION_COMMITTED_REV, "0")
}

/// True when `consumer_id` is the record's owner and the record is active:
/// the consumer may deliver and commit messages.
pub fn can_consume(record: &State, consumer_id: &str) -> bool {
    record.annotation(ANNOTATION_OWNER_ID) == Some(consumer_id) && is_active(record)
}

/// True when some owner currently holds the group.
pub fn is_active(record: &State) -> bool {
    record.annotation(ANNOTATION_OWNER_STATE) == Some(OWNER_ACTIVE)
}

/// The committed stream revision. Absent or unparseable parses as 0.
pub fn committed_rev(record: &State) -> u64 {
    record
        .annotation(ANNOTATION_COMMITTED_REV)
        .and_then(|rev| rev.parse().ok())
        .unwrap_or(0)
}
