//! Recorded request occurrences.

use uuid::Uuid;

/// One recorded request occurrence inside a bucket.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    /// Timestamp in seconds since the epoch; orders events within a bucket.
    pub score: f64,
    /// Opaque unique payload. Only used to keep members distinct in the store.
    pub value: String,
}

impl Event {
    /// Create an event stamped at `timestamp` with a fresh unique payload.
    pub fn at(timestamp: i64) -> Self {
        Self {
            score: timestamp as f64,
            value: format!("event:{}:{}", Uuid::new_v4(), timestamp),
        }
    }
}
