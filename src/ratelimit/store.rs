//! Event store contract.
//!
//! A store keeps one score-ordered collection of [`Event`]s per bucket key.
//! Any backend with sorted-set semantics (Redis, an in-memory map, another
//! ordered KV store) can satisfy it. Implementations do not retry; a failed
//! call surfaces as a [`StorageError`].

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;

use super::event::Event;
use crate::error::StorageError;

/// One end of a score range. Finite bounds are inclusive.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScoreBound {
    NegInfinity,
    Inclusive(f64),
    PosInfinity,
}

impl ScoreBound {
    /// Whether `score` lies on the allowed side when used as a lower bound.
    pub fn admits_from_below(&self, score: f64) -> bool {
        match self {
            ScoreBound::NegInfinity => true,
            ScoreBound::Inclusive(min) => score >= *min,
            ScoreBound::PosInfinity => false,
        }
    }

    /// Whether `score` lies on the allowed side when used as an upper bound.
    pub fn admits_from_above(&self, score: f64) -> bool {
        match self {
            ScoreBound::NegInfinity => false,
            ScoreBound::Inclusive(max) => score <= *max,
            ScoreBound::PosInfinity => true,
        }
    }
}

impl fmt::Display for ScoreBound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScoreBound::NegInfinity => f.write_str("-inf"),
            ScoreBound::Inclusive(score) => write!(f, "{}", score),
            ScoreBound::PosInfinity => f.write_str("+inf"),
        }
    }
}

/// Ordered, timestamped event storage shared by every limiter instance.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Number of events with a score in `[min, max]`.
    async fn count_range(
        &self,
        bucket: &str,
        min: ScoreBound,
        max: ScoreBound,
    ) -> Result<u64, StorageError>;

    /// Events by rank, oldest first, inclusive on both ends.
    ///
    /// Rank 0 is the oldest event; negative ranks count back from the newest.
    async fn find_range_with_scores(
        &self,
        bucket: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<Event>, StorageError>;

    /// Delete every event with a score in `[min, max]`. Empty ranges are a no-op.
    async fn remove_range_by_score(
        &self,
        bucket: &str,
        min: ScoreBound,
        max: ScoreBound,
    ) -> Result<(), StorageError>;

    /// Append events to the bucket, creating it on first write.
    async fn add(&self, bucket: &str, events: Vec<Event>) -> Result<Vec<Event>, StorageError>;

    /// Set or refresh the expiration of the whole bucket.
    async fn set_event_ttl(&self, bucket: &str, ttl: Duration) -> Result<(), StorageError>;
}
