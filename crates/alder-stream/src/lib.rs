//! Single-active-consumer stream messaging over a versioned state store.
//!
//! A stream is a label over immutable message records in an
//! [`alder_core::StateStore`]; the store's revision sequence is the
//! stream's total order. Producers append records; consumers attach to a
//! stream under a group name with the guarantee that **at most one consumer
//! per group is active at any instant**. The rest stand by and take over
//! transparently when the active consumer disappears.
//!
//! Coordination happens through a single ownership record per
//! (stream, group), see [`ownership`], mutated only by
//! revision-compare-and-swap. There are no locks and no timestamps in the
//! store: liveness is inferred from the record going quiet while messages
//! are pending, and every race between heartbeat, commit and takeover is
//! settled by the store rejecting the write that lost.
//!
//! Delivery is at-least-once. Within one active session messages arrive in
//! revision order exactly once; across a failover the new owner resumes
//! from the last committed revision and may re-deliver what the previous
//! owner observed but never committed.
//!
//! ```ignore
//! let producer = Producer::new(store.clone());
//! producer.send(&[ProduceMessage::new("orders", b"hello".to_vec())]).await?;
//!
//! let consumer = Consumer::attach("orders", "billing", store).await?;
//! while consumer.next().await {
//!     let message = consumer.message().await;
//!     handle(&message.body);
//!     consumer.commit(message.rev).await?;
//! }
//! ```

mod consumer;
mod coordinator;
mod error;
mod message;
pub mod ownership;
mod producer;

pub use consumer::Consumer;
pub use consumer::ConsumerConfig;
pub use consumer::HEARTBEAT_INTERVAL;
pub use consumer::RETRY_BACKOFF;
pub use consumer::TAKEOVER_INTERVAL;
pub use error::StreamError;
pub use message::Message;
pub use message::ProduceMessage;
pub use message::INLINE_BODY_MAX;
pub use producer::Producer;
