//! Redis-backed persistent tier
//!
//! Each aggregate kind lives in one Redis hash:
//! - key: `{prefix}:{kind}`
//! - field: aggregate id
//! - value: JSON-encoded aggregate
//!
//! Successful writes are announced on `{prefix}:{kind}:changes` so other
//! processes can refresh their local mirrors (see `change_feed`).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use redis::AsyncCommands;
use serde::{Serialize, de::DeserializeOwned};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::change_feed::ChangeNotice;
use crate::{Aggregate, BoxError, CacheError, EventStore, PersistentTier, RedisTierConfig};

/// Delete a hash field only while it still holds the given payload
const COMPARE_AND_DELETE: &str = r"
if redis.call('HGET', KEYS[1], ARGV[1]) == ARGV[2] then
    return redis.call('HDEL', KEYS[1], ARGV[1])
end
return 0
";

/// Redis key and channel names for one aggregate kind
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedisKeys {
    aggregates: String,
    changes: String,
}

impl RedisKeys {
    pub fn new(prefix: &str, kind: &str) -> Self {
        Self {
            aggregates: format!("{}:{}", prefix, kind),
            changes: format!("{}:{}:changes", prefix, kind),
        }
    }

    /// Hash holding every aggregate of the kind
    pub fn aggregates_key(&self) -> &str {
        &self.aggregates
    }

    /// Pub/sub channel for change notices
    pub fn change_channel(&self) -> &str {
        &self.changes
    }
}

/// Persistent tier storing aggregates in a Redis hash
pub struct RedisPersistentTier<A: Aggregate> {
    redis: redis::aio::ConnectionManager,
    source: Arc<dyn EventStore<A>>,
    keys: RedisKeys,
    config: RedisTierConfig,
    origin: Uuid,
    compare_and_delete: redis::Script,
}

impl<A> RedisPersistentTier<A>
where
    A: Aggregate + Serialize + DeserializeOwned,
{
    /// Connect to Redis and bind the tier to an event store
    pub async fn new(
        redis_client: redis::Client,
        source: Arc<dyn EventStore<A>>,
        config: RedisTierConfig,
    ) -> Result<Self, redis::RedisError> {
        let redis = redis::aio::ConnectionManager::new(redis_client).await?;
        let keys = RedisKeys::new(&config.key_prefix, A::kind());

        Ok(Self {
            redis,
            source,
            keys,
            config,
            origin: Uuid::new_v4(),
            compare_and_delete: redis::Script::new(COMPARE_AND_DELETE),
        })
    }

    /// Identity this tier stamps on the change notices it publishes
    pub fn origin(&self) -> Uuid {
        self.origin
    }

    pub fn keys(&self) -> &RedisKeys {
        &self.keys
    }

    /// Read the hash and decode every entry, dropping corrupt ones
    async fn load_all(&self) -> Result<Vec<A>, CacheError> {
        let mut conn = self.redis.clone();
        let raw: HashMap<String, String> = conn.hgetall(self.keys.aggregates_key()).await?;

        let (aggregates, corrupt) = decode_entries(raw);
        for entry in &corrupt {
            self.drop_corrupt(&mut conn, entry).await;
        }
        Ok(aggregates)
    }

    /// Delete a corrupt field unless a writer replaced it since it was read
    async fn drop_corrupt(
        &self,
        conn: &mut redis::aio::ConnectionManager,
        entry: &CorruptEntry,
    ) {
        warn!(
            "Failed to deserialize {} aggregate {}: {}. Deleting corrupt entry.",
            A::kind(),
            entry.field,
            entry.error
        );
        let deleted: Result<i64, _> = self
            .compare_and_delete
            .key(self.keys.aggregates_key())
            .arg(&entry.field)
            .arg(&entry.payload)
            .invoke_async(conn)
            .await;
        match deleted {
            Ok(0) => debug!(
                "Corrupt {} entry {} was rewritten before deletion; kept",
                A::kind(),
                entry.field
            ),
            Ok(_) => {}
            Err(e) => warn!(
                "Failed to delete corrupt {} entry {} (Redis key: {}): {}",
                A::kind(),
                entry.field,
                self.keys.aggregates_key(),
                e
            ),
        }
    }

    async fn write_all(&self, aggregates: &[A]) -> Result<(), CacheError> {
        if aggregates.is_empty() {
            return Ok(());
        }

        let items = encode_entries(aggregates)?;
        let mut conn = self.redis.clone();
        // single HSET with many fields: applied atomically by Redis
        let _: () = conn
            .hset_multiple(self.keys.aggregates_key(), items.as_slice())
            .await?;

        self.publish(aggregates.iter().map(|a| a.id()).collect())
            .await;
        Ok(())
    }

    /// Announce changed ids to other processes (best effort)
    async fn publish(&self, ids: Vec<Uuid>) {
        let Some(payload) = notice_payload(&self.config, self.origin, ids) else {
            return;
        };

        let mut conn = self.redis.clone();
        let channel = self.keys.change_channel();
        let published: Result<(), _> = conn.publish(channel, &payload).await;
        match published {
            Ok(()) => debug!("Change notice published on channel '{}': {}", channel, payload),
            Err(e) => warn!(
                "Redis PUBLISH error on channel {} for {} change: {}. Continuing.",
                channel,
                A::kind(),
                e
            ),
        }
    }
}

/// Hash field whose value could not be decoded
#[derive(Debug)]
struct CorruptEntry {
    field: String,
    payload: String,
    error: serde_json::Error,
}

/// Split raw hash fields into decoded aggregates and corrupt entries
fn decode_entries<A: DeserializeOwned>(
    raw: HashMap<String, String>,
) -> (Vec<A>, Vec<CorruptEntry>) {
    let mut aggregates = Vec::with_capacity(raw.len());
    let mut corrupt = Vec::new();
    for (field, payload) in raw {
        match serde_json::from_str::<A>(&payload) {
            Ok(aggregate) => aggregates.push(aggregate),
            Err(error) => corrupt.push(CorruptEntry {
                field,
                payload,
                error,
            }),
        }
    }
    (aggregates, corrupt)
}

/// Change notice payload for `ids`, or `None` when nothing should be published
fn notice_payload(config: &RedisTierConfig, origin: Uuid, ids: Vec<Uuid>) -> Option<String> {
    if !config.publish_changes || ids.is_empty() {
        return None;
    }
    match (ChangeNotice { origin, ids }).encode() {
        Ok(payload) => Some(payload),
        Err(e) => {
            warn!("Failed to encode change notice: {}", e);
            None
        }
    }
}

/// Encode aggregates as `(id, json)` hash fields
fn encode_entries<A: Aggregate + Serialize>(
    aggregates: &[A],
) -> Result<Vec<(String, String)>, serde_json::Error> {
    aggregates
        .iter()
        .map(|a| Ok((a.id().to_string(), serde_json::to_string(a)?)))
        .collect()
}

/// Aggregates from `replayed` that are missing from `cached` or newer than the cached copy
fn stale_entries<A: Aggregate>(cached: &HashMap<Uuid, u64>, replayed: Vec<A>) -> Vec<A> {
    replayed
        .into_iter()
        .filter(|a| cached.get(&a.id()).is_none_or(|version| *version < a.version()))
        .collect()
}

#[async_trait]
impl<A> PersistentTier<A> for RedisPersistentTier<A>
where
    A: Aggregate + Serialize + DeserializeOwned,
{
    async fn initialize_from_source(&self) -> Result<(), BoxError> {
        let cached: HashMap<Uuid, u64> = self
            .load_all()
            .await?
            .into_iter()
            .map(|a| (a.id(), a.version()))
            .collect();

        let mut replayed = Vec::new();
        for id in self.source.aggregate_ids().await? {
            match self.source.replay(id).await? {
                Some(aggregate) => replayed.push(aggregate),
                None => debug!("Event store has no history for {} {}", A::kind(), id),
            }
        }

        let stale = stale_entries(&cached, replayed);
        debug!(
            "Redis {} tier: {} cached, rewriting {} from source",
            A::kind(),
            cached.len(),
            stale.len()
        );
        self.write_all(&stale).await?;
        Ok(())
    }

    async fn get_all(&self) -> Result<Vec<A>, BoxError> {
        Ok(self.load_all().await?)
    }

    async fn get_by_id(&self, id: Uuid) -> Result<Option<A>, BoxError> {
        let mut conn = self.redis.clone();
        let field = id.to_string();
        let cached: Option<String> = conn.hget(self.keys.aggregates_key(), &field).await?;

        let Some(json) = cached else {
            debug!("Redis miss for {} {}", A::kind(), id);
            return Ok(None);
        };
        match serde_json::from_str::<A>(&json) {
            Ok(aggregate) => Ok(Some(aggregate)),
            Err(error) => {
                let entry = CorruptEntry {
                    field,
                    payload: json,
                    error,
                };
                self.drop_corrupt(&mut conn, &entry).await;
                Ok(None)
            }
        }
    }

    async fn upsert(&self, aggregate: &A) -> Result<(), BoxError> {
        let json = serde_json::to_string(aggregate)?;
        let mut conn = self.redis.clone();
        let _: () = conn
            .hset(self.keys.aggregates_key(), aggregate.id().to_string(), json)
            .await?;

        self.publish(vec![aggregate.id()]).await;
        Ok(())
    }

    async fn upsert_batch(&self, aggregates: &[A]) -> Result<(), BoxError> {
        Ok(self.write_all(aggregates).await?)
    }
}
