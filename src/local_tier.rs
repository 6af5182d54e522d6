//! Process-local mirror of the persistent tier
//!
//! Backed by an unbounded Moka cache (no TTL, no capacity eviction): the full
//! aggregate set of one kind is expected to fit in memory. The Moka instance
//! sits behind a `RwLock` so `populate_all` can swap in a fully built cache
//! in one step; readers see either the old contents or the new ones, never a
//! half-populated set.

use std::sync::Arc;

use moka::future::Cache;
use moka::ops::compute::{CompResult, Op};
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use crate::Aggregate;

/// Concurrent, identity-keyed in-memory store for one aggregate kind
pub struct LocalTier<A: Aggregate> {
    entries: RwLock<Cache<Uuid, Arc<A>>>,
}

impl<A: Aggregate> Default for LocalTier<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: Aggregate> LocalTier<A> {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(Self::build_cache()),
        }
    }

    fn build_cache() -> Cache<Uuid, Arc<A>> {
        Cache::builder().build()
    }

    /// Replace the entire contents.
    ///
    /// The replacement is built off to the side and swapped in under the write
    /// lock, so it is exclusive with every other operation on this tier.
    pub async fn populate_all(&self, aggregates: Vec<A>) -> usize {
        let fresh = Self::build_cache();
        for aggregate in aggregates {
            fresh.insert(aggregate.id(), Arc::new(aggregate)).await;
        }
        let count = fresh.iter().count();

        let mut entries = self.entries.write().await;
        *entries = fresh;
        debug!("Local {} tier populated with {} aggregates", A::kind(), count);
        count
    }

    /// Look up one aggregate by identity
    pub async fn get(&self, id: &Uuid) -> Option<Arc<A>> {
        self.entries.read().await.get(id).await
    }

    /// Snapshot of every cached aggregate, in no particular order
    pub async fn get_all(&self) -> Vec<Arc<A>> {
        self.entries
            .read()
            .await
            .iter()
            .map(|(_, aggregate)| aggregate)
            .collect()
    }

    /// Linear scan returning every aggregate the predicate accepts
    pub async fn get_where<F>(&self, predicate: F) -> Vec<Arc<A>>
    where
        F: Fn(&A) -> bool,
    {
        self.entries
            .read()
            .await
            .iter()
            .filter_map(|(_, aggregate)| predicate(&aggregate).then_some(aggregate))
            .collect()
    }

    /// Insert or replace the entry for the aggregate's identity (last write wins)
    pub async fn upsert(&self, aggregate: A) {
        let entries = self.entries.read().await;
        Self::put(&entries, aggregate).await;
    }

    /// Insert or replace every member of the batch.
    ///
    /// Members are applied under one read guard, so a concurrent `populate_all`
    /// cannot interleave with the batch.
    pub async fn upsert_batch(&self, aggregates: Vec<A>) {
        let entries = self.entries.read().await;
        for aggregate in aggregates {
            Self::put(&entries, aggregate).await;
        }
    }

    /// Unconditional write through the per-key compute lock.
    ///
    /// `Cache::insert` does not take that lock, so a plain insert could land
    /// between the compare and the put of `upsert_if_newer`.
    async fn put(entries: &Cache<Uuid, Arc<A>>, aggregate: A) {
        let incoming = Arc::new(aggregate);
        entries
            .entry(incoming.id())
            .and_compute_with(|_| std::future::ready(Op::Put(incoming)))
            .await;
    }

    /// Insert or replace unless the cached entry carries a higher version.
    ///
    /// Returns `true` when the incoming aggregate was stored.
    pub async fn upsert_if_newer(&self, aggregate: A) -> bool {
        let id = aggregate.id();
        let incoming = Arc::new(aggregate);
        let entries = self.entries.read().await;

        let result = entries
            .entry(id)
            .and_compute_with(|current| {
                let op = match current {
                    Some(entry) if entry.value().version() > incoming.version() => Op::Nop,
                    _ => Op::Put(Arc::clone(&incoming)),
                };
                std::future::ready(op)
            })
            .await;

        matches!(
            result,
            CompResult::Inserted(_) | CompResult::ReplacedWith(_)
        )
    }

    /// Number of cached aggregates
    pub async fn len(&self) -> usize {
        self.entries.read().await.iter().count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
