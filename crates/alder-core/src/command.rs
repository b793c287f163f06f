//! Commit commands applied atomically by the store.

use serde::Deserialize;
use serde::Serialize;

use crate::state::DataBlob;
use crate::state::State;

/// A single command within a commit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Command {
    /// Write the state as its next quiesced version.
    ///
    /// The supplied `rev` is the optimistic-concurrency precondition; the
    /// store assigns the next revision from its global sequence on success.
    Park(State),
    /// Store a side data blob under its id.
    StoreData(DataBlob),
}

/// Request to apply a sequence of commands atomically.
///
/// Either every command applies or none does. Any failed `Park`
/// precondition fails the whole commit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommitRequest {
    pub commands: Vec<Command>,
}

impl CommitRequest {
    /// Create a commit from raw commands.
    pub fn new(commands: Vec<Command>) -> Self {
        Self { commands }
    }

    /// Create a commit with a single parked state.
    pub fn park(state: State) -> Self {
        Self {
            commands: vec![Command::Park(state)],
        }
    }

    /// Append a parked state.
    pub fn and_park(mut self, state: State) -> Self {
        self.commands.push(Command::Park(state));
        self
    }

    /// Append a data blob.
    pub fn and_store_data(mut self, blob: DataBlob) -> Self {
        self.commands.push(Command::StoreData(blob));
        self
    }
}

/// Result of a successful commit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct CommitResult {
    /// The parked states with their newly assigned revisions, in the order
    /// the `Park` commands appeared in the request.
    pub states: Vec<State>,
}
