//! Cache error types

use std::{fmt, sync::Arc, time::Duration};

use redis::RedisError;

/// Error type returned by the collaborator traits (event store, persistent tier).
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Shared error handle, so a failed initialization can be reported to every caller.
pub type SharedError = Arc<dyn std::error::Error + Send + Sync>;

/// Initialization step that failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitStage {
    /// Persistent tier could not make itself consistent with the event store
    DurableInitialize,
    /// Persistent tier could not return the full aggregate set
    BulkPull,
    /// The initializing future was dropped before it finished
    Cancelled,
}

impl fmt::Display for InitStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InitStage::DurableInitialize => f.write_str("durable initialize"),
            InitStage::BulkPull => f.write_str("bulk pull"),
            InitStage::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// Cache-related errors
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Cache not ready")]
    NotReady,

    #[error("Cache initialization already in progress")]
    AlreadyInitializing,

    #[error("Cache initialization failed during {stage}: {source}")]
    InitializationFailed {
        stage: InitStage,
        #[source]
        source: SharedError,
    },

    #[error("Durable write of {count} aggregate(s) failed: {source}")]
    DurableWriteFailed {
        count: usize,
        #[source]
        source: BoxError,
    },

    #[error("Durable read failed: {source}")]
    DurableReadFailed {
        #[source]
        source: BoxError,
    },

    #[error("Durable {operation} did not complete within {after:?}; outcome unknown")]
    DurableTimeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("Redis error: {0}")]
    Redis(#[from] RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CacheError {
    /// Whether retrying the same call may succeed.
    ///
    /// Initialization failures are permanent for an instance; a new cache has to be built.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CacheError::NotReady
                | CacheError::DurableWriteFailed { .. }
                | CacheError::DurableReadFailed { .. }
                | CacheError::DurableTimeout { .. }
                | CacheError::Redis(_)
        )
    }
}
