//! Event store contract consumed by persistent tiers during initialization

use async_trait::async_trait;
use uuid::Uuid;

use crate::{Aggregate, BoxError};

/// Append-only, replayable source of truth for one aggregate kind.
///
/// Only persistent tiers talk to the event store, and only while
/// initializing. How events are replayed is the implementation's concern.
#[async_trait]
pub trait EventStore<A: Aggregate>: Send + Sync + 'static {
    /// Every identity of the aggregate kind known to the store
    async fn aggregate_ids(&self) -> Result<Vec<Uuid>, BoxError>;

    /// Rebuild the current state of one aggregate by replaying its events
    async fn replay(&self, id: Uuid) -> Result<Option<A>, BoxError>;
}
