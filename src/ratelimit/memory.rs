//! In-process event store.
//!
//! Mirrors sorted-set semantics closely enough to stand in for Redis in
//! single-instance deployments and tests. State is not shared between
//! processes.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::debug;

use super::event::Event;
use super::store::{EventStore, ScoreBound};
use crate::error::StorageError;

#[derive(Debug, Default)]
struct Bucket {
    /// Sorted by score; equal scores keep insertion order.
    events: Vec<Event>,
    expires_at: Option<Instant>,
}

impl Bucket {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    fn insert(&mut self, event: Event) {
        // A member appears at most once; re-adding moves it to its new score.
        self.events.retain(|e| e.value != event.value);
        let pos = self.events.partition_point(|e| e.score <= event.score);
        self.events.insert(pos, event);
    }

    fn in_range(event: &Event, min: ScoreBound, max: ScoreBound) -> bool {
        min.admits_from_below(event.score) && max.admits_from_above(event.score)
    }
}

/// Event store held in process memory.
#[derive(Debug, Default)]
pub struct InMemoryEventStore {
    buckets: DashMap<String, Bucket>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of buckets that have not expired.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.buckets.iter().filter(|b| !b.is_expired(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop buckets whose TTL has elapsed, returning how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut purged = 0;
        self.buckets.retain(|_, b| {
            let keep = !b.is_expired(now);
            if !keep {
                purged += 1;
            }
            keep
        });
        purged
    }

    /// Run [`purge_expired`](Self::purge_expired) every `period` until the store is dropped.
    ///
    /// Expired buckets are otherwise only evicted when their key is touched
    /// again, so a caller seen once would keep its entry forever.
    pub fn spawn_purger(store: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let store = Arc::downgrade(store);
        let period = period.max(Duration::from_millis(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(store) = store.upgrade() else {
                    break;
                };
                let purged = store.purge_expired();
                if purged > 0 {
                    debug!(purged, remaining = store.buckets.len(), "Purged expired buckets");
                }
            }
        })
    }

    fn evict_if_expired(&self, bucket: &str) {
        let now = Instant::now();
        self.buckets.remove_if(bucket, |_, b| b.is_expired(now));
    }
}

/// Resolve a Redis-style inclusive rank range against a collection of `len` items.
fn rank_bounds(len: usize, start: isize, stop: isize) -> Option<(usize, usize)> {
    if len == 0 {
        return None;
    }
    let len = len as isize;
    let start = if start < 0 { (start + len).max(0) } else { start };
    let stop = if stop < 0 { stop + len } else { stop.min(len - 1) };

    if start > stop || start >= len {
        return None;
    }
    Some((start as usize, stop as usize))
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn count_range(
        &self,
        bucket: &str,
        min: ScoreBound,
        max: ScoreBound,
    ) -> Result<u64, StorageError> {
        self.evict_if_expired(bucket);
        let count = self
            .buckets
            .get(bucket)
            .map(|b| {
                b.events
                    .iter()
                    .filter(|e| Bucket::in_range(e, min, max))
                    .count()
            })
            .unwrap_or(0);
        Ok(count as u64)
    }

    async fn find_range_with_scores(
        &self,
        bucket: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<Event>, StorageError> {
        self.evict_if_expired(bucket);
        let Some(b) = self.buckets.get(bucket) else {
            return Ok(Vec::new());
        };
        Ok(match rank_bounds(b.events.len(), start, stop) {
            Some((from, to)) => b.events[from..=to].to_vec(),
            None => Vec::new(),
        })
    }

    async fn remove_range_by_score(
        &self,
        bucket: &str,
        min: ScoreBound,
        max: ScoreBound,
    ) -> Result<(), StorageError> {
        self.evict_if_expired(bucket);
        if let Some(mut b) = self.buckets.get_mut(bucket) {
            b.events.retain(|e| !Bucket::in_range(e, min, max));
        }
        // An emptied sorted set ceases to exist.
        self.buckets.remove_if(bucket, |_, b| b.events.is_empty());
        Ok(())
    }

    async fn add(&self, bucket: &str, events: Vec<Event>) -> Result<Vec<Event>, StorageError> {
        self.evict_if_expired(bucket);
        let mut entry = self.buckets.entry(bucket.to_string()).or_default();
        for event in &events {
            entry.insert(event.clone());
        }
        Ok(events)
    }

    async fn set_event_ttl(&self, bucket: &str, ttl: Duration) -> Result<(), StorageError> {
        self.evict_if_expired(bucket);
        if ttl.is_zero() {
            self.buckets.remove(bucket);
            return Ok(());
        }
        if let Some(mut b) = self.buckets.get_mut(bucket) {
            b.expires_at = Some(Instant::now() + ttl);
        }
        Ok(())
    }
}
