//! Redis-backed event store.
//!
//! Each bucket is a sorted set keyed `<namespace>:<identity>`, scored by event
//! timestamp, with the opaque event payload as the member. Every instance
//! pointed at the same Redis enforces one logical limit.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use tracing::debug;

use super::event::Event;
use super::store::{EventStore, ScoreBound};
use crate::error::StorageError;

/// Event store on top of Redis sorted sets.
#[derive(Clone)]
pub struct RedisEventStore {
    connection: ConnectionManager,
}

impl fmt::Debug for RedisEventStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisEventStore").finish_non_exhaustive()
    }
}

impl RedisEventStore {
    /// Connect to Redis and verify the connection with a PING.
    ///
    /// # Errors
    /// Returns an error if the URL is invalid or the server is unreachable.
    pub async fn connect(url: &str) -> Result<Self, StorageError> {
        let client = Client::open(url)?;
        let connection = ConnectionManager::new(client).await?;

        let mut conn = connection.clone();
        redis::cmd("PING").query_async::<String>(&mut conn).await?;
        debug!("Connected to Redis event store");

        Ok(Self { connection })
    }

    /// Wrap an existing connection manager.
    pub fn from_connection(connection: ConnectionManager) -> Self {
        Self { connection }
    }

    fn conn(&self) -> ConnectionManager {
        self.connection.clone()
    }
}

#[async_trait]
impl EventStore for RedisEventStore {
    async fn count_range(
        &self,
        bucket: &str,
        min: ScoreBound,
        max: ScoreBound,
    ) -> Result<u64, StorageError> {
        let count: u64 = self
            .conn()
            .zcount(bucket, min.to_string(), max.to_string())
            .await?;
        Ok(count)
    }

    async fn find_range_with_scores(
        &self,
        bucket: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<Event>, StorageError> {
        let members: Vec<(String, f64)> =
            self.conn().zrange_withscores(bucket, start, stop).await?;
        Ok(members
            .into_iter()
            .map(|(value, score)| Event { score, value })
            .collect())
    }

    async fn remove_range_by_score(
        &self,
        bucket: &str,
        min: ScoreBound,
        max: ScoreBound,
    ) -> Result<(), StorageError> {
        let _removed: u64 = self
            .conn()
            .zrembyscore(bucket, min.to_string(), max.to_string())
            .await?;
        Ok(())
    }

    async fn add(&self, bucket: &str, events: Vec<Event>) -> Result<Vec<Event>, StorageError> {
        if events.is_empty() {
            return Ok(events);
        }
        let members: Vec<(f64, &str)> = events
            .iter()
            .map(|e| (e.score, e.value.as_str()))
            .collect();
        let _added: u64 = self.conn().zadd_multiple(bucket, &members[..]).await?;
        Ok(events)
    }

    async fn set_event_ttl(&self, bucket: &str, ttl: Duration) -> Result<(), StorageError> {
        let seconds = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX);
        let _applied: bool = self.conn().expire(bucket, seconds).await?;
        Ok(())
    }
}
