//! Message types exchanged through a stream.

/// Largest body stored inline in the message record's annotations.
///
/// Bodies over this size (or bodies that are not valid UTF-8) go to a side
/// data blob referenced from the record.
pub const INLINE_BODY_MAX: usize = 100;

/// A message delivered to a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// The store revision of the message record; the message's position in
    /// the stream's total order, and the value to pass to
    /// [`Consumer::commit`](crate::Consumer::commit).
    pub rev: u64,
    /// The message payload.
    pub body: Vec<u8>,
}

/// A message submitted to [`Producer::send`](crate::Producer::send).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProduceMessage {
    /// The stream to append to.
    pub stream: String,
    /// The message payload.
    pub body: Vec<u8>,
}

impl ProduceMessage {
    pub fn new(stream: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        Self {
            stream: stream.into(),
            body: body.into(),
        }
    }
}
