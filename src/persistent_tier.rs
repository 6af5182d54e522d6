//! Durable tier contract and an in-process stand-in
//!
//! The orchestrator treats the persistent tier as a black box: it is the seed
//! source at startup and the commit point for every write.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use crate::{Aggregate, BoxError, EventStore};

/// Durable, cross-process cache of current aggregate state.
///
/// Every error is passed through the orchestrator unchanged.
#[async_trait]
pub trait PersistentTier<A: Aggregate>: Send + Sync + 'static {
    /// Make the durable tier consistent with the event store
    async fn initialize_from_source(&self) -> Result<(), BoxError>;

    /// Full current aggregate set
    async fn get_all(&self) -> Result<Vec<A>, BoxError>;

    /// One aggregate by identity
    async fn get_by_id(&self, id: Uuid) -> Result<Option<A>, BoxError>;

    /// Insert or replace one aggregate
    async fn upsert(&self, aggregate: &A) -> Result<(), BoxError>;

    /// Insert or replace a batch of aggregates
    async fn upsert_batch(&self, aggregates: &[A]) -> Result<(), BoxError>;
}

#[async_trait]
impl<A, P> PersistentTier<A> for Arc<P>
where
    A: Aggregate,
    P: PersistentTier<A> + ?Sized,
{
    async fn initialize_from_source(&self) -> Result<(), BoxError> {
        (**self).initialize_from_source().await
    }

    async fn get_all(&self) -> Result<Vec<A>, BoxError> {
        (**self).get_all().await
    }

    async fn get_by_id(&self, id: Uuid) -> Result<Option<A>, BoxError> {
        (**self).get_by_id(id).await
    }

    async fn upsert(&self, aggregate: &A) -> Result<(), BoxError> {
        (**self).upsert(aggregate).await
    }

    async fn upsert_batch(&self, aggregates: &[A]) -> Result<(), BoxError> {
        (**self).upsert_batch(aggregates).await
    }
}

/// Persistent tier kept in process memory.
///
/// Useful for single-process deployments and tests. Optionally backed by an
/// event store that `initialize_from_source` replays from.
pub struct InMemoryPersistentTier<A: Aggregate> {
    entries: RwLock<HashMap<Uuid, A>>,
    source: Option<Arc<dyn EventStore<A>>>,
}

impl<A: Aggregate> Default for InMemoryPersistentTier<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: Aggregate> InMemoryPersistentTier<A> {
    /// Empty tier with no event store
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            source: None,
        }
    }

    /// Tier pre-loaded with the given aggregates
    pub fn seeded(aggregates: impl IntoIterator<Item = A>) -> Self {
        Self {
            entries: RwLock::new(aggregates.into_iter().map(|a| (a.id(), a)).collect()),
            source: None,
        }
    }

    /// Tier that rebuilds itself from `source` on initialization
    pub fn with_source(source: Arc<dyn EventStore<A>>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            source: Some(source),
        }
    }
}

#[async_trait]
impl<A: Aggregate> PersistentTier<A> for InMemoryPersistentTier<A> {
    async fn initialize_from_source(&self) -> Result<(), BoxError> {
        let Some(source) = &self.source else {
            debug!("In-memory {} tier has no event store; keeping seed", A::kind());
            return Ok(());
        };

        let mut rebuilt = Vec::new();
        for id in source.aggregate_ids().await? {
            if let Some(aggregate) = source.replay(id).await? {
                rebuilt.push(aggregate);
            }
        }

        let mut entries = self.entries.write().await;
        let mut written = 0usize;
        for aggregate in rebuilt {
            let stale = entries
                .get(&aggregate.id())
                .is_none_or(|cached| cached.version() < aggregate.version());
            if stale {
                entries.insert(aggregate.id(), aggregate);
                written += 1;
            }
        }
        debug!(
            "In-memory {} tier rebuilt {} aggregate(s) from source",
            A::kind(),
            written
        );
        Ok(())
    }

    async fn get_all(&self) -> Result<Vec<A>, BoxError> {
        Ok(self.entries.read().await.values().cloned().collect())
    }

    async fn get_by_id(&self, id: Uuid) -> Result<Option<A>, BoxError> {
        Ok(self.entries.read().await.get(&id).cloned())
    }

    async fn upsert(&self, aggregate: &A) -> Result<(), BoxError> {
        self.entries
            .write()
            .await
            .insert(aggregate.id(), aggregate.clone());
        Ok(())
    }

    async fn upsert_batch(&self, aggregates: &[A]) -> Result<(), BoxError> {
        let mut entries = self.entries.write().await;
        for aggregate in aggregates {
            entries.insert(aggregate.id(), aggregate.clone());
        }
        Ok(())
    }
}
