//! aggcache - Write-through two-tier cache for event-sourced aggregates
//!
//! This library keeps a consistent, low-latency view of one aggregate kind:
//! - Persistent tier: durable and shared across processes (Redis), seeded from the event store
//! - Local tier: in-process Moka mirror that serves every read
//!
//! The cache guarantees:
//! - Startup order: persistent tier initialized from the event store, then mirrored locally
//! - Write-through: the durable write succeeds before the local mirror changes
//! - Reads are served only once the mirror is fully populated
//! - Optional cross-process refresh through Redis pub/sub change notices

mod aggregate;
pub mod change_feed;
mod config;
mod error;
mod event_store;
mod local_tier;
mod observer;
mod orchestrator;
mod persistent_tier;
pub mod redis_tier;

pub use aggregate::Aggregate;
pub use change_feed::{ChangeFeed, ChangeNotice, FeedEvent};
pub use config::{CacheConfig, ReadPolicy, RedisTierConfig};
pub use error::{BoxError, CacheError, InitStage, SharedError};
pub use event_store::EventStore;
pub use local_tier::LocalTier;
pub use observer::{CacheObserver, TracingObserver};
pub use orchestrator::{AggregateCache, InitState};
pub use persistent_tier::{InMemoryPersistentTier, PersistentTier};
pub use redis_tier::{RedisKeys, RedisPersistentTier};

// Re-export async_trait for convenience
pub use async_trait::async_trait;
