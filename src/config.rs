//! Cache configuration

use std::time::Duration;

/// How operations issued before the cache is ready behave
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadPolicy {
    /// Suspend until initialization finishes (or fails)
    #[default]
    Wait,
    /// Return `CacheError::NotReady` immediately
    FailFast,
}

/// Configuration for the aggregate cache orchestrator
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Behavior of reads and writes issued before Ready
    pub read_policy: ReadPolicy,
    /// Upper bound on waiting for Ready under `ReadPolicy::Wait`
    pub ready_timeout: Option<Duration>,
    /// Upper bound on each persistent tier call
    pub durable_timeout: Option<Duration>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            read_policy: ReadPolicy::Wait,
            ready_timeout: None,
            durable_timeout: Some(Duration::from_secs(30)),
        }
    }
}

/// Configuration for the Redis persistent tier
#[derive(Debug, Clone)]
pub struct RedisTierConfig {
    /// Prefix for every Redis key and channel owned by the cache
    pub key_prefix: String,
    /// Publish change notices after successful writes
    pub publish_changes: bool,
}

impl Default for RedisTierConfig {
    fn default() -> Self {
        Self {
            key_prefix: "aggcache".to_owned(),
            publish_changes: true,
        }
    }
}
