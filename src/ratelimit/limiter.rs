//! Sliding-window rate limiter over an [`EventStore`].
//!
//! The window is anchored to the oldest surviving event of a bucket. While a
//! caller is under its limit a check costs two store calls (count + add).
//! Once the bucket is full, the oldest event decides whether the window has
//! rolled over; if it has, the stale events are pruned so the caller's next
//! request is admitted again. The request that trips the limit is denied
//! either way.
//!
//! Count and record are separate store calls, so concurrent requests for one
//! bucket may both pass the count before either records its event. Under load
//! a bucket can briefly admit more than its limit.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, trace, warn};

use super::backend::RateLimiterBackend;
use super::clock::{Clock, SystemClock};
use super::event::Event;
use super::store::{EventStore, ScoreBound};
use crate::error::{LimitError, LimitStep};

/// Limiting policy.
///
/// Passed per request, each empty or zero field falls back to the limiter's
/// own default. A max of zero therefore cannot express "allow nothing".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LimitOptions {
    /// Partition of bucket keys, e.g. `token` or `ip`.
    pub namespace: String,
    /// Requests allowed within the window.
    pub max_in_interval: u64,
    /// Window length in seconds.
    pub interval_seconds: u64,
}

impl LimitOptions {
    pub fn new(namespace: impl Into<String>, max_in_interval: u64, interval_seconds: u64) -> Self {
        Self {
            namespace: namespace.into(),
            max_in_interval,
            interval_seconds,
        }
    }

    /// Take every non-empty field from `overrides`, the rest from `self`.
    pub fn merged_with(&self, overrides: Option<&LimitOptions>) -> LimitOptions {
        let Some(o) = overrides else {
            return self.clone();
        };
        LimitOptions {
            namespace: if o.namespace.is_empty() {
                self.namespace.clone()
            } else {
                o.namespace.clone()
            },
            max_in_interval: if o.max_in_interval == 0 {
                self.max_in_interval
            } else {
                o.max_in_interval
            },
            interval_seconds: if o.interval_seconds == 0 {
                self.interval_seconds
            } else {
                o.interval_seconds
            },
        }
    }

    /// Store key of the bucket for `identity` under this namespace.
    pub fn bucket_key(&self, identity: &str) -> String {
        format!("{}:{}", self.namespace, identity)
    }
}

/// Sliding-window rate limiter for one namespace.
pub struct RateLimiter {
    store: Arc<dyn EventStore>,
    defaults: LimitOptions,
    clock: Arc<dyn Clock>,
    bucket_ttl: Option<Duration>,
}

impl RateLimiter {
    /// Create a limiter with its fallback policy.
    pub fn new(
        store: Arc<dyn EventStore>,
        namespace: impl Into<String>,
        max_in_interval: u64,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            defaults: LimitOptions::new(namespace, max_in_interval, interval.as_secs()),
            clock: Arc::new(SystemClock),
            bucket_ttl: None,
        }
    }

    /// Use a different time source.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Refresh a TTL on every bucket that records an event.
    pub fn with_bucket_ttl(mut self, ttl: Duration) -> Self {
        self.bucket_ttl = Some(ttl);
        self
    }

    /// The limiter's fallback policy.
    pub fn defaults(&self) -> &LimitOptions {
        &self.defaults
    }

    /// Decide whether `identity` is over its limit, recording the request if not.
    ///
    /// Returns `Ok(false)` when the request is admitted, `Ok(true)` when it is
    /// limited. A store failure at any step aborts the check with no decision.
    pub async fn limit(
        &self,
        identity: &str,
        options: Option<&LimitOptions>,
    ) -> Result<bool, LimitError> {
        let policy = self.defaults.merged_with(options);
        let bucket = policy.bucket_key(identity);
        let now = self.clock.now_secs();

        // Scores are whole seconds; the +1 keeps events stamped `now` inside the range.
        let count = self
            .store
            .count_range(&bucket, ScoreBound::NegInfinity, ScoreBound::Inclusive((now + 1) as f64))
            .await
            .map_err(|e| LimitError::storage(LimitStep::Counting, e))?;

        trace!(
            bucket = %bucket,
            count = count,
            max = policy.max_in_interval,
            "Checking rate limit"
        );

        if count < policy.max_in_interval {
            self.record(&bucket, now).await?;
            return Ok(false);
        }

        let oldest = self
            .store
            .find_range_with_scores(&bucket, 0, 0)
            .await
            .map_err(|e| LimitError::storage(LimitStep::OldestLookup, e))?;

        // An empty bucket cannot be over its limit.
        let Some(oldest) = oldest.first() else {
            return Ok(false);
        };

        let age = now as f64 - oldest.score;
        if age > policy.interval_seconds as f64 {
            debug!(
                bucket = %bucket,
                age = age,
                interval = policy.interval_seconds,
                "Window rolled over, pruning stale events"
            );
            self.store
                .remove_range_by_score(
                    &bucket,
                    ScoreBound::NegInfinity,
                    ScoreBound::Inclusive(now as f64),
                )
                .await
                .map_err(|e| LimitError::storage(LimitStep::Pruning, e))?;
        }

        Ok(true)
    }

    async fn record(&self, bucket: &str, now: i64) -> Result<(), LimitError> {
        self.store
            .add(bucket, vec![Event::at(now)])
            .await
            .map_err(|e| LimitError::storage(LimitStep::Recording, e))?;

        if let Some(ttl) = self.bucket_ttl {
            if let Err(e) = self.store.set_event_ttl(bucket, ttl).await {
                warn!(bucket = %bucket, error = %e, "Failed to refresh bucket TTL");
            }
        }
        Ok(())
    }
}

#[async_trait]
impl RateLimiterBackend for RateLimiter {
    async fn limit(
        &self,
        identity: &str,
        options: Option<&LimitOptions>,
    ) -> Result<bool, LimitError> {
        RateLimiter::limit(self, identity, options).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StorageError;
    use crate::ratelimit::clock::ManualClock;
    use crate::ratelimit::memory::InMemoryEventStore;
    use std::sync::Mutex;
    use tokio_test::{assert_err, assert_ok};

    const NOW: i64 = 1_700_000_000;

    /// In-memory store with switchable failures and a call log.
    #[derive(Default)]
    struct FaultyStore {
        inner: InMemoryEventStore,
        fail_count: bool,
        fail_find: bool,
        fail_remove: bool,
        fail_add: bool,
        fail_ttl: bool,
        count_override: Option<u64>,
        calls: Mutex<Vec<&'static str>>,
    }

    impl FaultyStore {
        fn log(&self, call: &'static str) {
            self.calls.lock().unwrap().push(call);
        }

        fn calls(&self) -> Vec<&'static str> {
            self.calls.lock().unwrap().clone()
        }

        fn fail() -> StorageError {
            StorageError::Backend("store unavailable".to_string())
        }
    }

    #[async_trait]
    impl EventStore for FaultyStore {
        async fn count_range(
            &self,
            bucket: &str,
            min: ScoreBound,
            max: ScoreBound,
        ) -> Result<u64, StorageError> {
            self.log("count_range");
            if self.fail_count {
                return Err(Self::fail());
            }
            if let Some(count) = self.count_override {
                return Ok(count);
            }
            self.inner.count_range(bucket, min, max).await
        }

        async fn find_range_with_scores(
            &self,
            bucket: &str,
            start: isize,
            stop: isize,
        ) -> Result<Vec<Event>, StorageError> {
            self.log("find_range_with_scores");
            if self.fail_find {
                return Err(Self::fail());
            }
            self.inner.find_range_with_scores(bucket, start, stop).await
        }

        async fn remove_range_by_score(
            &self,
            bucket: &str,
            min: ScoreBound,
            max: ScoreBound,
        ) -> Result<(), StorageError> {
            self.log("remove_range_by_score");
            if self.fail_remove {
                return Err(Self::fail());
            }
            self.inner.remove_range_by_score(bucket, min, max).await
        }

        async fn add(&self, bucket: &str, events: Vec<Event>) -> Result<Vec<Event>, StorageError> {
            self.log("add");
            if self.fail_add {
                return Err(Self::fail());
            }
            self.inner.add(bucket, events).await
        }

        async fn set_event_ttl(&self, bucket: &str, ttl: Duration) -> Result<(), StorageError> {
            self.log("set_event_ttl");
            if self.fail_ttl {
                return Err(Self::fail());
            }
            self.inner.set_event_ttl(bucket, ttl).await
        }
    }

    fn limiter(
        store: Arc<dyn EventStore>,
        max: u64,
        interval_secs: u64,
    ) -> (RateLimiter, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(NOW));
        let limiter = RateLimiter::new(store, "test", max, Duration::from_secs(interval_secs))
            .with_clock(clock.clone());
        (limiter, clock)
    }

    async fn bucket_len(store: &dyn EventStore, bucket: &str) -> u64 {
        store
            .count_range(bucket, ScoreBound::NegInfinity, ScoreBound::PosInfinity)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_first_n_requests_admitted_then_limited() {
        let store = Arc::new(InMemoryEventStore::new());
        let (limiter, _clock) = limiter(store.clone(), 3, 10);

        for i in 1..=3u64 {
            let limited = limiter.limit("caller", None).await.unwrap();
            assert!(!limited, "Request {} should be admitted", i);
            assert_eq!(bucket_len(store.as_ref(), "test:caller").await, i);
        }

        let limited = limiter.limit("caller", None).await.unwrap();
        assert!(limited);
        assert_eq!(bucket_len(store.as_ref(), "test:caller").await, 3);
    }

    #[tokio::test]
    async fn test_full_window_is_not_pruned() {
        let store = Arc::new(FaultyStore::default());
        let (limiter, clock) = limiter(store.clone(), 2, 1);

        assert!(!limiter.limit("caller", None).await.unwrap());
        assert!(!limiter.limit("caller", None).await.unwrap());

        // age == interval is still inside the window
        clock.advance(1);
        assert!(limiter.limit("caller", None).await.unwrap());
        assert!(!store.calls().contains(&"remove_range_by_score"));
        assert_eq!(bucket_len(store.as_ref(), "test:caller").await, 2);
    }

    #[tokio::test]
    async fn test_rolled_over_window_prunes_and_readmits_next_request() {
        let store = Arc::new(InMemoryEventStore::new());
        let (limiter, clock) = limiter(store.clone(), 2, 1);

        assert!(!limiter.limit("caller", None).await.unwrap());
        assert!(!limiter.limit("caller", None).await.unwrap());
        assert!(limiter.limit("caller", None).await.unwrap());

        clock.advance(2);
        // The request that observes the stale window is still denied.
        assert!(limiter.limit("caller", None).await.unwrap());
        assert_eq!(bucket_len(store.as_ref(), "test:caller").await, 0);

        assert!(!limiter.limit("caller", None).await.unwrap());
        assert_eq!(bucket_len(store.as_ref(), "test:caller").await, 1);
    }

    #[tokio::test]
    async fn test_empty_bucket_is_never_limited() {
        let store = Arc::new(FaultyStore {
            count_override: Some(10),
            ..Default::default()
        });
        let (limiter, _clock) = limiter(store.clone(), 1, 1);

        let limited = limiter.limit("caller", None).await.unwrap();
        assert!(!limited);
        assert_eq!(store.calls(), vec!["count_range", "find_range_with_scores"]);
    }

    #[tokio::test]
    async fn test_options_override_defaults() {
        let store = Arc::new(InMemoryEventStore::new());
        let (limiter, _clock) = limiter(store.clone(), 1, 1);
        let options = LimitOptions::new("token", 3, 60);

        for _ in 0..3 {
            assert!(!limiter.limit("abc", Some(&options)).await.unwrap());
        }
        assert!(limiter.limit("abc", Some(&options)).await.unwrap());

        assert_eq!(bucket_len(store.as_ref(), "token:abc").await, 3);
        assert_eq!(bucket_len(store.as_ref(), "test:abc").await, 0);
    }

    #[tokio::test]
    async fn test_zero_options_fall_back_to_defaults() {
        let store = Arc::new(InMemoryEventStore::new());
        let (limiter, _clock) = limiter(store.clone(), 2, 1);
        assert_eq!(limiter.defaults(), &LimitOptions::new("test", 2, 1));
        let options = LimitOptions::default();

        assert!(!limiter.limit("caller", Some(&options)).await.unwrap());
        assert!(!limiter.limit("caller", Some(&options)).await.unwrap());
        assert!(limiter.limit("caller", Some(&options)).await.unwrap());
        assert_eq!(bucket_len(store.as_ref(), "test:caller").await, 2);
    }

    #[test]
    fn test_merge_is_field_by_field() {
        let defaults = LimitOptions::new("ip", 10, 60);

        let merged = defaults.merged_with(Some(&LimitOptions::new("", 5, 0)));
        assert_eq!(merged, LimitOptions::new("ip", 5, 60));

        let merged = defaults.merged_with(Some(&LimitOptions::new("token", 0, 30)));
        assert_eq!(merged, LimitOptions::new("token", 10, 30));

        assert_eq!(defaults.merged_with(None), defaults);
    }

    #[tokio::test]
    async fn test_identities_have_separate_buckets() {
        let store = Arc::new(InMemoryEventStore::new());
        let (limiter, _clock) = limiter(store, 1, 10);

        assert!(!limiter.limit("a", None).await.unwrap());
        assert!(!limiter.limit("b", None).await.unwrap());
        assert!(limiter.limit("a", None).await.unwrap());
    }

    #[tokio::test]
    async fn test_count_failure_reports_counting_step() {
        let store = Arc::new(FaultyStore {
            fail_count: true,
            ..Default::default()
        });
        let (limiter, _clock) = limiter(store, 1, 1);

        let err = assert_err!(limiter.limit("caller", None).await);
        assert_eq!(err.step(), Some(LimitStep::Counting));
    }

    #[tokio::test]
    async fn test_oldest_lookup_failure_reports_step() {
        let store = Arc::new(FaultyStore {
            fail_find: true,
            ..Default::default()
        });
        let (limiter, _clock) = limiter(store.clone(), 1, 1);

        assert_ok!(limiter.limit("caller", None).await);
        let err = assert_err!(limiter.limit("caller", None).await);
        assert_eq!(err.step(), Some(LimitStep::OldestLookup));
    }

    #[tokio::test]
    async fn test_prune_failure_reports_step() {
        let store = Arc::new(FaultyStore {
            fail_remove: true,
            ..Default::default()
        });
        let (limiter, clock) = limiter(store, 1, 1);

        assert_ok!(limiter.limit("caller", None).await);
        clock.advance(5);
        let err = assert_err!(limiter.limit("caller", None).await);
        assert_eq!(err.step(), Some(LimitStep::Pruning));
    }

    #[tokio::test]
    async fn test_record_failure_returns_no_decision() {
        let store = Arc::new(FaultyStore {
            fail_add: true,
            ..Default::default()
        });
        let (limiter, _clock) = limiter(store, 5, 1);

        let err = assert_err!(limiter.limit("caller", None).await);
        assert_eq!(err.step(), Some(LimitStep::Recording));
        assert_eq!(
            err.to_string(),
            "error when adding event: store unavailable"
        );
    }

    #[tokio::test]
    async fn test_ttl_refreshed_after_recording() {
        let store = Arc::new(FaultyStore::default());
        let (limiter, _clock) = limiter(store.clone(), 5, 1);
        let limiter = limiter.with_bucket_ttl(Duration::from_secs(60));

        assert!(!limiter.limit("caller", None).await.unwrap());
        assert_eq!(store.calls(), vec!["count_range", "add", "set_event_ttl"]);
    }

    #[tokio::test]
    async fn test_ttl_failure_does_not_affect_decision() {
        let store = Arc::new(FaultyStore {
            fail_ttl: true,
            ..Default::default()
        });
        let (limiter, _clock) = limiter(store, 5, 1);
        let limiter = limiter.with_bucket_ttl(Duration::from_secs(60));

        let limited = assert_ok!(limiter.limit("caller", None).await);
        assert!(!limited);
    }

    #[tokio::test]
    async fn test_usable_through_backend_trait() {
        let store = Arc::new(InMemoryEventStore::new());
        let (limiter, _clock) = limiter(store, 1, 1);
        let backend: Arc<dyn RateLimiterBackend> = Arc::new(limiter);

        assert!(!backend.limit("caller", None).await.unwrap());
        assert!(backend.limit("caller", None).await.unwrap());
    }
}
