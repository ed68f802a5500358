//! Sliding-window rate limiting over a shared event store.

mod backend;
mod clock;
mod event;
mod limiter;
mod memory;
mod redis_store;
mod store;

pub use backend::RateLimiterBackend;
pub use clock::{Clock, ManualClock, SystemClock};
pub use event::Event;
pub use limiter::{LimitOptions, RateLimiter};
pub use memory::InMemoryEventStore;
pub use redis_store::RedisEventStore;
pub use store::{EventStore, ScoreBound};
