//! Error types for the Gatekeeper service.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Main error type for Gatekeeper operations.
#[derive(Error, Debug)]
pub enum GatekeeperError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Event store errors raised outside of a rate limit check
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Gatekeeper operations.
pub type Result<T> = std::result::Result<T, GatekeeperError>;

/// Failure of a single event store operation.
#[derive(Error, Debug)]
pub enum StorageError {
    /// The Redis backend rejected the command or the connection failed.
    #[error("redis: {0}")]
    Redis(#[from] redis::RedisError),

    /// Any other backend failure.
    #[error("{0}")]
    Backend(String),
}

/// The step of a rate limit check that touched the event store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitStep {
    /// Counting the events already in the bucket.
    Counting,
    /// Looking up the oldest event of a full bucket.
    OldestLookup,
    /// Removing the stale prefix of a rolled-over window.
    Pruning,
    /// Recording the event of an admitted request.
    Recording,
}

impl fmt::Display for LimitStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let step = match self {
            LimitStep::Counting => "counting the number of events",
            LimitStep::OldestLookup => "finding the oldest event",
            LimitStep::Pruning => "removing expired events",
            LimitStep::Recording => "adding event",
        };
        f.write_str(step)
    }
}

/// Error returned by a rate limit check.
///
/// No decision accompanies the error: the request's fate is indeterminate
/// and callers must not read it as "allowed".
#[derive(Error, Debug)]
pub enum LimitError {
    /// An event store call failed.
    #[error("error when {step}: {source}")]
    Storage {
        step: LimitStep,
        #[source]
        source: StorageError,
    },

    /// The check did not finish before the caller's deadline.
    #[error("rate limit check did not complete within {0:?}")]
    Timeout(Duration),
}

impl LimitError {
    pub(crate) fn storage(step: LimitStep, source: StorageError) -> Self {
        LimitError::Storage { step, source }
    }

    /// The store step that failed, if the failure came from the store.
    pub fn step(&self) -> Option<LimitStep> {
        match self {
            LimitError::Storage { step, .. } => Some(*step),
            LimitError::Timeout(_) => None,
        }
    }
}
