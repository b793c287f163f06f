//! Data model and driver contract for a durable versioned state store.
//!
//! A state store holds [`State`] records addressed by id and label set.
//! Every commit draws revisions from one store-wide monotonic sequence,
//! which gives:
//!
//! - a total order over committed versions (the basis for stream delivery),
//! - optimistic concurrency: a [`Command::Park`] carries the revision the
//!   writer read, and the store rejects the commit when the state has
//!   advanced.
//!
//! The [`StateStore`] trait is the seam embedders implement; everything in
//! the messaging layer is written against it. [`StateIter`] provides
//! revision-ordered iteration with blocking waits on top of the trait's
//! query and head-watch primitives.

mod command;
mod error;
mod iter;
mod query;
mod state;
mod store;

pub use command::Command;
pub use command::CommitRequest;
pub use command::CommitResult;
pub use error::StateStoreError;
pub use iter::StateIter;
pub use query::GetDataRequest;
pub use query::GetStateByLabelsRequest;
pub use query::GetStateRequest;
pub use query::QueryRequest;
pub use query::QueryResult;
pub use state::DataBlob;
pub use state::State;
pub use store::StateStore;
