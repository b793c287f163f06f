//! Error types for the messaging layer.

use alder_core::StateStoreError;
use thiserror::Error;

/// Errors surfaced by producers and consumers.
///
/// Store-level revision mismatches never appear here: they are the
/// coordination protocol's stale-view signal and are resolved internally by
/// re-reading the ownership record.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StreamError {
    /// The underlying state store could not be reached or failed.
    #[error("state store failed: {source}")]
    Store {
        #[from]
        source: StateStoreError,
    },

    /// The consumer is not the active owner of its group.
    #[error("consumer is in standby and cannot commit")]
    NotActive,

    /// `send` was called with no messages.
    #[error("empty message batch")]
    EmptyBatch,

    /// One or more messages in a batch failed validation. Nothing was
    /// committed; every failure is reported.
    #[error("invalid messages: {}", .reasons.join("; "))]
    Invalid { reasons: Vec<String> },

    /// No message arrived before the receive deadline.
    #[error("no message received before the deadline")]
    ReceiveTimeout,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_reports_every_reason() {
        let err = StreamError::Invalid {
            reasons: vec!["message 0: stream is required".to_string(), "message 2: stream is required".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "invalid messages: message 0: stream is required; message 2: stream is required"
        );
    }

    #[test]
    fn store_error_converts_and_displays() {
        let err: StreamError = StateStoreError::Unavailable {
            reason: "connection refused".to_string(),
        }
        .into();
        assert_eq!(err.to_string(), "state store failed: store unavailable: connection refused");
    }
}
