//! Operational events emitted by the cache orchestrator

use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::{CacheError, InitStage};

/// Receives lifecycle and write events from an `AggregateCache`.
///
/// Injected at construction so callers decide where timings and failures go.
/// Every method has an empty default body.
pub trait CacheObserver: Send + Sync + 'static {
    fn initialization_started(&self, _kind: &'static str) {}

    fn initialization_completed(&self, _kind: &'static str, _count: usize, _elapsed: Duration) {}

    fn initialization_failed(&self, _kind: &'static str, _stage: InitStage, _error: &CacheError) {}

    fn write_committed(&self, _kind: &'static str, _count: usize) {}

    fn write_rejected(&self, _kind: &'static str, _count: usize, _error: &CacheError) {}

    fn resynced(&self, _kind: &'static str, _count: usize, _elapsed: Duration) {}
}

/// Default observer: forwards everything to `tracing`
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl CacheObserver for TracingObserver {
    fn initialization_started(&self, kind: &'static str) {
        info!("Started {} cache initialization", kind);
    }

    fn initialization_completed(&self, kind: &'static str, count: usize, elapsed: Duration) {
        info!(
            "{} cache initialization took {} ms ({} aggregates)",
            kind,
            elapsed.as_millis(),
            count
        );
    }

    fn initialization_failed(&self, kind: &'static str, _stage: InitStage, error: &CacheError) {
        error!("{} cache unusable: {}", kind, error);
    }

    fn write_committed(&self, kind: &'static str, count: usize) {
        debug!("{} cache committed {} aggregate(s)", kind, count);
    }

    fn write_rejected(&self, kind: &'static str, count: usize, error: &CacheError) {
        warn!("{} cache write of {} aggregate(s) rejected: {}", kind, count, error);
    }

    fn resynced(&self, kind: &'static str, count: usize, elapsed: Duration) {
        info!(
            "{} cache resynced {} aggregates in {} ms",
            kind,
            count,
            elapsed.as_millis()
        );
    }
}
