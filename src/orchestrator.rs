//! Write-through aggregate cache
//!
//! `AggregateCache` coordinates two tiers for one aggregate kind:
//! - a persistent tier (durable, shared across processes, source of truth)
//! - a local tier (process memory, serves every read)
//!
//! Lifecycle: `Uninitialized -> Initializing -> Ready`, or `Initializing -> Failed`.
//! No state is ever left once `Ready` or `Failed` is reached.
//!
//! Writes go to the persistent tier first; the local tier is only touched
//! once the durable write has returned `Ok`. A write that fails, times out
//! or is dropped mid-flight leaves the local tier as it was.
//!
//! Concurrent saves for the same identity are not version-checked: the last
//! one to reach the local tier wins, whichever durable write started first.
//! Only refreshes driven by the change feed compare versions.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use futures::{Stream, StreamExt};
use tokio::sync::{RwLock, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::change_feed::FeedEvent;
use crate::{
    Aggregate, BoxError, CacheConfig, CacheError, CacheObserver, InitStage, LocalTier,
    PersistentTier, ReadPolicy, SharedError, TracingObserver,
};

/// Initialization state of a cache instance
#[derive(Debug, Clone)]
pub enum InitState {
    Uninitialized,
    Initializing,
    Ready,
    Failed { stage: InitStage, error: SharedError },
}

impl InitState {
    fn is_settled(&self) -> bool {
        matches!(self, InitState::Ready | InitState::Failed { .. })
    }
}

/// Marks initialization as failed if dropped before `complete` is called.
///
/// Keeps a cancelled `initialize` future from leaving the cache stuck in
/// `Initializing` with readers waiting forever.
struct InitGuard<'a> {
    state: &'a watch::Sender<InitState>,
    completed: bool,
}

impl<'a> InitGuard<'a> {
    fn new(state: &'a watch::Sender<InitState>) -> Self {
        Self {
            state,
            completed: false,
        }
    }

    fn complete(mut self, next: InitState) {
        self.completed = true;
        self.state.send_replace(next);
    }
}

impl Drop for InitGuard<'_> {
    fn drop(&mut self) {
        if !self.completed {
            let error: SharedError =
                Arc::from(BoxError::from("initialization was cancelled before completing"));
            self.state.send_replace(InitState::Failed {
                stage: InitStage::Cancelled,
                error,
            });
        }
    }
}

struct AggregateCacheInner<A: Aggregate, P: PersistentTier<A>> {
    persistent: P,
    local: LocalTier<A>,
    state: watch::Sender<InitState>,
    /// Shared by writes, taken exclusively by `resync`
    write_gate: RwLock<()>,
    config: CacheConfig,
    observer: Arc<dyn CacheObserver>,
}

/// Two-tier cache for one aggregate kind
pub struct AggregateCache<A: Aggregate, P: PersistentTier<A>> {
    inner: Arc<AggregateCacheInner<A, P>>,
}

impl<A: Aggregate, P: PersistentTier<A>> Clone for AggregateCache<A, P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

fn into_shared(error: CacheError) -> SharedError {
    match error {
        CacheError::DurableReadFailed { source } => Arc::from(source),
        other => Arc::new(other),
    }
}

impl<A: Aggregate, P: PersistentTier<A>> AggregateCache<A, P> {
    /// Create an uninitialized cache that reports through `tracing`
    pub fn new(persistent: P, config: CacheConfig) -> Self {
        Self::with_observer(persistent, config, Arc::new(TracingObserver))
    }

    /// Create an uninitialized cache with a custom observer
    pub fn with_observer(
        persistent: P,
        config: CacheConfig,
        observer: Arc<dyn CacheObserver>,
    ) -> Self {
        let (state, _) = watch::channel(InitState::Uninitialized);
        Self {
            inner: Arc::new(AggregateCacheInner {
                persistent,
                local: LocalTier::new(),
                state,
                write_gate: RwLock::new(()),
                config,
                observer,
            }),
        }
    }

    /// Current initialization state
    pub fn state(&self) -> InitState {
        self.inner.state.borrow().clone()
    }

    pub fn is_ready(&self) -> bool {
        matches!(*self.inner.state.borrow(), InitState::Ready)
    }

    /// Initialize the persistent tier from its event store, then load the
    /// local tier from the persistent tier.
    ///
    /// Runs at most once per instance. Calling again after success is a
    /// no-op; calling while another call is in flight returns
    /// `AlreadyInitializing`; calling after a failure returns the original
    /// `InitializationFailed`.
    pub async fn initialize(&self) -> Result<(), CacheError> {
        let mut previous = None;
        self.inner.state.send_if_modified(|state| {
            if matches!(state, InitState::Uninitialized) {
                *state = InitState::Initializing;
                true
            } else {
                previous = Some(state.clone());
                false
            }
        });

        match previous {
            None | Some(InitState::Uninitialized) => {}
            Some(InitState::Ready) => return Ok(()),
            Some(InitState::Initializing) => return Err(CacheError::AlreadyInitializing),
            Some(InitState::Failed { stage, error }) => {
                return Err(CacheError::InitializationFailed {
                    stage,
                    source: error,
                });
            }
        }

        let guard = InitGuard::new(&self.inner.state);
        let kind = A::kind();
        self.inner.observer.initialization_started(kind);
        let timer = Instant::now();

        match self.load().await {
            Ok(count) => {
                guard.complete(InitState::Ready);
                self.inner
                    .observer
                    .initialization_completed(kind, count, timer.elapsed());
                Ok(())
            }
            Err((stage, error)) => {
                guard.complete(InitState::Failed {
                    stage,
                    error: Arc::clone(&error),
                });
                let error = CacheError::InitializationFailed {
                    stage,
                    source: error,
                };
                self.inner.observer.initialization_failed(kind, stage, &error);
                Err(error)
            }
        }
    }

    async fn load(&self) -> Result<usize, (InitStage, SharedError)> {
        let persistent = &self.inner.persistent;

        self.durable(
            "initialize",
            persistent.initialize_from_source(),
            |source| CacheError::DurableReadFailed { source },
        )
        .await
        .map_err(|e| (InitStage::DurableInitialize, into_shared(e)))?;

        let aggregates = self
            .durable("get_all", persistent.get_all(), |source| {
                CacheError::DurableReadFailed { source }
            })
            .await
            .map_err(|e| (InitStage::BulkPull, into_shared(e)))?;

        Ok(self.inner.local.populate_all(aggregates).await)
    }

    /// Suspend until the cache is Ready, regardless of the configured policy.
    ///
    /// Returns `InitializationFailed` if initialization fails, or `NotReady`
    /// if `ready_timeout` elapses first.
    pub async fn wait_ready(&self) -> Result<(), CacheError> {
        let mut rx = self.inner.state.subscribe();
        let settled = {
            let wait = rx.wait_for(InitState::is_settled);
            match self.inner.config.ready_timeout {
                Some(after) => tokio::time::timeout(after, wait)
                    .await
                    .map_err(|_| CacheError::NotReady)?
                    .map_err(|_| CacheError::NotReady)?
                    .clone(),
                None => wait.await.map_err(|_| CacheError::NotReady)?.clone(),
            }
        };
        Self::check(settled)
    }

    fn check(state: InitState) -> Result<(), CacheError> {
        match state {
            InitState::Ready => Ok(()),
            InitState::Failed { stage, error } => Err(CacheError::InitializationFailed {
                stage,
                source: error,
            }),
            InitState::Uninitialized | InitState::Initializing => Err(CacheError::NotReady),
        }
    }

    /// Gate every read and write on readiness, per the configured policy
    async fn ready(&self) -> Result<(), CacheError> {
        let current = self.state();
        if current.is_settled() {
            return Self::check(current);
        }
        match self.inner.config.read_policy {
            ReadPolicy::FailFast => Err(CacheError::NotReady),
            ReadPolicy::Wait => self.wait_ready().await,
        }
    }

    /// Run a persistent tier call under the configured timeout
    async fn durable<T, F>(
        &self,
        operation: &'static str,
        call: F,
        on_error: impl FnOnce(BoxError) -> CacheError,
    ) -> Result<T, CacheError>
    where
        F: Future<Output = Result<T, BoxError>>,
    {
        let outcome = match self.inner.config.durable_timeout {
            Some(after) => tokio::time::timeout(after, call)
                .await
                .map_err(|_| CacheError::DurableTimeout { operation, after })?,
            None => call.await,
        };
        outcome.map_err(on_error)
    }

    /// Every cached aggregate, in no particular order
    pub async fn get_all(&self) -> Result<Vec<Arc<A>>, CacheError> {
        self.ready().await?;
        Ok(self.inner.local.get_all().await)
    }

    /// One aggregate by identity; `Ok(None)` means it does not exist.
    ///
    /// A miss is never retried against the persistent tier: the local tier
    /// is complete once Ready and kept current by writes.
    pub async fn get_by_id(&self, id: Uuid) -> Result<Option<Arc<A>>, CacheError> {
        self.ready().await?;
        Ok(self.inner.local.get(&id).await)
    }

    /// Every cached aggregate matching the predicate, in no particular order
    pub async fn get_where<F>(&self, predicate: F) -> Result<Vec<Arc<A>>, CacheError>
    where
        F: Fn(&A) -> bool,
    {
        self.ready().await?;
        Ok(self.inner.local.get_where(predicate).await)
    }

    /// Write one aggregate through both tiers.
    ///
    /// The persistent tier must accept the write before the local tier sees
    /// it. Durable errors are returned unchanged and never retried here.
    pub async fn save(&self, aggregate: A) -> Result<(), CacheError> {
        self.ready().await?;
        let kind = A::kind();
        let _gate = self.inner.write_gate.read().await;

        let committed = self
            .durable("upsert", self.inner.persistent.upsert(&aggregate), |source| {
                CacheError::DurableWriteFailed { count: 1, source }
            })
            .await;
        if let Err(e) = committed {
            self.inner.observer.write_rejected(kind, 1, &e);
            return Err(e);
        }

        debug!(
            "{} {} v{} committed durably",
            kind,
            aggregate.id(),
            aggregate.version()
        );
        self.inner.local.upsert(aggregate).await;
        self.inner.observer.write_committed(kind, 1);
        Ok(())
    }

    /// Write a batch through both tiers.
    ///
    /// No member reaches the local tier unless the persistent tier accepted
    /// the whole batch, even if some members were durably written before the
    /// failure.
    pub async fn save_batch(&self, aggregates: Vec<A>) -> Result<(), CacheError> {
        self.ready().await?;
        if aggregates.is_empty() {
            return Ok(());
        }

        let kind = A::kind();
        let count = aggregates.len();
        let _gate = self.inner.write_gate.read().await;

        let committed = self
            .durable(
                "upsert_batch",
                self.inner.persistent.upsert_batch(&aggregates),
                |source| CacheError::DurableWriteFailed { count, source },
            )
            .await;
        if let Err(e) = committed {
            self.inner.observer.write_rejected(kind, count, &e);
            return Err(e);
        }

        self.inner.local.upsert_batch(aggregates).await;
        self.inner.observer.write_committed(kind, count);
        Ok(())
    }

    /// Rebuild the local tier from the persistent tier.
    ///
    /// Waits for in-flight writes and blocks new ones while it runs, so no
    /// write's local effect is lost to the swap.
    pub async fn resync(&self) -> Result<usize, CacheError> {
        self.ready().await?;
        let _gate = self.inner.write_gate.write().await;
        let timer = Instant::now();

        let aggregates = self
            .durable("get_all", self.inner.persistent.get_all(), |source| {
                CacheError::DurableReadFailed { source }
            })
            .await?;
        let count = self.inner.local.populate_all(aggregates).await;

        self.inner
            .observer
            .resynced(A::kind(), count, timer.elapsed());
        Ok(count)
    }

    /// Re-read the given ids from the persistent tier into the local tier.
    ///
    /// Entries only move forward: a refreshed copy older than the cached one
    /// is discarded.
    async fn refresh(&self, ids: &[Uuid]) {
        let _gate = self.inner.write_gate.read().await;
        for id in ids {
            let fetched = self
                .durable("get_by_id", self.inner.persistent.get_by_id(*id), |source| {
                    CacheError::DurableReadFailed { source }
                })
                .await;
            match fetched {
                Ok(Some(aggregate)) => {
                    if !self.inner.local.upsert_if_newer(aggregate).await {
                        debug!("Skipped stale refresh of {} {}", A::kind(), id);
                    }
                }
                Ok(None) => debug!(
                    "{} {} not in persistent tier; nothing to refresh",
                    A::kind(),
                    id
                ),
                Err(e) => warn!("Failed to refresh {} {}: {}", A::kind(), id, e),
            }
        }
    }

    /// Apply a change feed to this cache on a background task.
    ///
    /// Notices stamped with `own_origin` are skipped (this process already
    /// applied them). `FeedEvent::Subscribed` triggers a full `resync`.
    /// Events are held until the cache is Ready. The task ends when the feed
    /// ends or initialization fails.
    pub fn follow<S>(&self, feed: S, own_origin: Option<Uuid>) -> JoinHandle<()>
    where
        S: Stream<Item = FeedEvent> + Send + Unpin + 'static,
    {
        let cache = self.clone();
        tokio::spawn(async move { cache.run_follower(feed, own_origin).await })
    }

    async fn run_follower<S>(&self, mut feed: S, own_origin: Option<Uuid>)
    where
        S: Stream<Item = FeedEvent> + Send + Unpin,
    {
        let kind = A::kind();
        loop {
            match self.wait_ready().await {
                Ok(()) => break,
                Err(CacheError::NotReady) => continue,
                Err(e) => {
                    warn!("{} change feed stopped: {}", kind, e);
                    return;
                }
            }
        }

        while let Some(event) = feed.next().await {
            match event {
                FeedEvent::Subscribed => {
                    if let Err(e) = self.resync().await {
                        warn!("{} resync after (re)subscribe failed: {}", kind, e);
                    }
                }
                FeedEvent::Changed(notice) => {
                    if own_origin == Some(notice.origin) {
                        continue;
                    }
                    self.refresh(&notice.ids).await;
                }
            }
        }
        debug!("{} change feed ended", kind);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::Notify;

    use super::*;
    use crate::change_feed::ChangeNotice;
    use crate::local_tier::tests::Account;
    use crate::InMemoryPersistentTier;

    /// In-memory persistent tier with fault injection
    #[derive(Default)]
    struct FaultyTier {
        inner: InMemoryPersistentTier<Account>,
        fail_ids: Mutex<HashSet<Uuid>>,
        /// Durably write this many batch members, then fail
        fail_batch_after: Mutex<Option<usize>>,
        fail_init: AtomicBool,
        fail_get_all: AtomicBool,
        init_gate: Option<Arc<Notify>>,
        upsert_delay: Option<Duration>,
        init_calls: AtomicUsize,
        get_all_calls: AtomicUsize,
    }

    impl FaultyTier {
        fn seeded(accounts: Vec<Account>) -> Self {
            Self {
                inner: InMemoryPersistentTier::seeded(accounts),
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl PersistentTier<Account> for FaultyTier {
        async fn initialize_from_source(&self) -> Result<(), BoxError> {
            self.init_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.init_gate {
                gate.notified().await;
            }
            if self.fail_init.load(Ordering::SeqCst) {
                return Err("event store unreachable".into());
            }
            self.inner.initialize_from_source().await
        }

        async fn get_all(&self) -> Result<Vec<Account>, BoxError> {
            self.get_all_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_get_all.load(Ordering::SeqCst) {
                return Err("hgetall failed".into());
            }
            self.inner.get_all().await
        }

        async fn get_by_id(&self, id: Uuid) -> Result<Option<Account>, BoxError> {
            self.inner.get_by_id(id).await
        }

        async fn upsert(&self, aggregate: &Account) -> Result<(), BoxError> {
            if let Some(delay) = self.upsert_delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail_ids.lock().unwrap().contains(&aggregate.id) {
                return Err("write rejected".into());
            }
            self.inner.upsert(aggregate).await
        }

        async fn upsert_batch(&self, aggregates: &[Account]) -> Result<(), BoxError> {
            let fail_after = *self.fail_batch_after.lock().unwrap();
            match fail_after {
                Some(n) => {
                    self.inner.upsert_batch(&aggregates[..n]).await?;
                    Err("connection reset mid-batch".into())
                }
                None => self.inner.upsert_batch(aggregates).await,
            }
        }
    }

    #[derive(Default)]
    struct RecordingObserver {
        events: Mutex<Vec<String>>,
    }

    impl CacheObserver for RecordingObserver {
        fn initialization_started(&self, kind: &'static str) {
            self.events.lock().unwrap().push(format!("started {}", kind));
        }

        fn initialization_completed(&self, kind: &'static str, count: usize, _elapsed: Duration) {
            self.events
                .lock()
                .unwrap()
                .push(format!("completed {} {}", kind, count));
        }

        fn initialization_failed(&self, kind: &'static str, stage: InitStage, _error: &CacheError) {
            self.events
                .lock()
                .unwrap()
                .push(format!("failed {} {}", kind, stage));
        }

        fn write_committed(&self, kind: &'static str, count: usize) {
            self.events
                .lock()
                .unwrap()
                .push(format!("committed {} {}", kind, count));
        }

        fn write_rejected(&self, kind: &'static str, count: usize, _error: &CacheError) {
            self.events
                .lock()
                .unwrap()
                .push(format!("rejected {} {}", kind, count));
        }

        fn resynced(&self, kind: &'static str, count: usize, _elapsed: Duration) {
            self.events
                .lock()
                .unwrap()
                .push(format!("resynced {} {}", kind, count));
        }
    }

    impl RecordingObserver {
        fn recorded(&self, event: &str) -> usize {
            self.events
                .lock()
                .unwrap()
                .iter()
                .filter(|e| e.as_str() == event)
                .count()
        }
    }

    fn fail_fast() -> CacheConfig {
        CacheConfig {
            read_policy: ReadPolicy::FailFast,
            ..Default::default()
        }
    }

    async fn ready_cache(
        tier: FaultyTier,
    ) -> (AggregateCache<Account, Arc<FaultyTier>>, Arc<FaultyTier>) {
        let tier = Arc::new(tier);
        let cache = AggregateCache::new(Arc::clone(&tier), CacheConfig::default());
        cache.initialize().await.unwrap();
        (cache, tier)
    }

    async fn observed_cache(
        tier: FaultyTier,
    ) -> (
        AggregateCache<Account, Arc<FaultyTier>>,
        Arc<FaultyTier>,
        Arc<RecordingObserver>,
    ) {
        let tier = Arc::new(tier);
        let observer = Arc::new(RecordingObserver::default());
        let cache = AggregateCache::with_observer(
            Arc::clone(&tier),
            CacheConfig::default(),
            Arc::clone(&observer) as Arc<dyn CacheObserver>,
        );
        cache.initialize().await.unwrap();
        (cache, tier, observer)
    }

    fn versions(accounts: &[Arc<Account>]) -> Vec<(Uuid, u64)> {
        let mut pairs: Vec<_> = accounts.iter().map(|a| (a.id, a.version)).collect();
        pairs.sort();
        pairs
    }

    #[tokio::test]
    async fn test_initialize_mirrors_persistent_set() {
        let id1 = Uuid::new_v4();
        let id2 = Uuid::new_v4();
        let (cache, tier) = ready_cache(FaultyTier::seeded(vec![
            Account::new(id1, 1, 10),
            Account::new(id2, 1, 20),
        ]))
        .await;

        let cached = cache.get_all().await.unwrap();
        let durable: Vec<Arc<Account>> = tier
            .inner
            .get_all()
            .await
            .unwrap()
            .into_iter()
            .map(Arc::new)
            .collect();

        assert_eq!(versions(&cached), versions(&durable));
        let mut expected = vec![(id1, 1), (id2, 1)];
        expected.sort();
        assert_eq!(versions(&cached), expected);
        assert!(cache.is_ready());
    }

    #[tokio::test]
    async fn test_save_then_read_latest() {
        let (cache, _tier, observer) = observed_cache(FaultyTier::default()).await;
        let id3 = Uuid::new_v4();

        cache.save(Account::new(id3, 1, 100)).await.unwrap();
        assert_eq!(cache.get_by_id(id3).await.unwrap().unwrap().version, 1);

        cache.save(Account::new(id3, 2, 150)).await.unwrap();
        let latest = cache.get_by_id(id3).await.unwrap().unwrap();
        assert_eq!(latest.version, 2);
        assert_eq!(latest.balance, 150);
        assert_eq!(observer.recorded("committed Account 1"), 2);
    }

    #[tokio::test]
    async fn test_rejected_save_leaves_local_untouched() {
        let observer = Arc::new(RecordingObserver::default());
        let tier = Arc::new(FaultyTier::default());
        let cache: AggregateCache<Account, _> = AggregateCache::with_observer(
            Arc::clone(&tier),
            CacheConfig::default(),
            Arc::clone(&observer) as Arc<dyn CacheObserver>,
        );
        cache.initialize().await.unwrap();

        let id4 = Uuid::new_v4();
        tier.fail_ids.lock().unwrap().insert(id4);

        let err = cache.save(Account::new(id4, 1, 5)).await.unwrap_err();
        assert!(matches!(err, CacheError::DurableWriteFailed { count: 1, .. }));
        assert!(err.is_retryable());
        assert!(cache.get_by_id(id4).await.unwrap().is_none());
        assert_eq!(observer.recorded("rejected Account 1"), 1);
        assert_eq!(observer.recorded("committed Account 1"), 0);
    }

    #[tokio::test]
    async fn test_rejected_update_keeps_previous_value() {
        let (cache, tier) = ready_cache(FaultyTier::default()).await;
        let id = Uuid::new_v4();
        cache.save(Account::new(id, 1, 10)).await.unwrap();

        tier.fail_ids.lock().unwrap().insert(id);
        assert!(cache.save(Account::new(id, 2, 20)).await.is_err());

        let current = cache.get_by_id(id).await.unwrap().unwrap();
        assert_eq!((current.version, current.balance), (1, 10));
    }

    #[tokio::test]
    async fn test_partial_batch_failure_hides_every_member() {
        let (cache, tier) = ready_cache(FaultyTier::default()).await;
        let a = Account::new(Uuid::new_v4(), 1, 1);
        let b = Account::new(Uuid::new_v4(), 1, 2);
        *tier.fail_batch_after.lock().unwrap() = Some(1);

        let err = cache
            .save_batch(vec![a.clone(), b.clone()])
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::DurableWriteFailed { count: 2, .. }));

        // `a` reached the durable tier, yet neither member is visible locally
        assert!(tier.inner.get_by_id(a.id).await.unwrap().is_some());
        assert!(cache.get_by_id(a.id).await.unwrap().is_none());
        assert!(cache.get_by_id(b.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_save_batch_visible_after_commit() {
        let (cache, _tier, observer) = observed_cache(FaultyTier::default()).await;
        let batch = vec![
            Account::new(Uuid::new_v4(), 1, 1),
            Account::new(Uuid::new_v4(), 3, 2),
        ];

        cache.save_batch(batch.clone()).await.unwrap();
        cache.save_batch(Vec::new()).await.unwrap();
        assert_eq!(observer.recorded("committed Account 2"), 1);
        assert_eq!(observer.recorded("committed Account 0"), 0);

        for account in batch {
            let cached = cache.get_by_id(account.id).await.unwrap().unwrap();
            assert_eq!(cached.version, account.version);
        }
        assert_eq!(cache.get_all().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_initialize_runs_once() {
        let (cache, tier) =
            ready_cache(FaultyTier::seeded(vec![Account::new(Uuid::new_v4(), 1, 0)])).await;

        cache.initialize().await.unwrap();

        assert_eq!(tier.init_calls.load(Ordering::SeqCst), 1);
        assert_eq!(tier.get_all_calls.load(Ordering::SeqCst), 1);
        assert!(cache.is_ready());
    }

    #[tokio::test]
    async fn test_fail_fast_before_initialize() {
        let cache: AggregateCache<Account, _> =
            AggregateCache::new(FaultyTier::default(), fail_fast());

        assert!(matches!(cache.get_all().await, Err(CacheError::NotReady)));
        assert!(matches!(
            cache.get_by_id(Uuid::new_v4()).await,
            Err(CacheError::NotReady)
        ));
        assert!(matches!(
            cache.save(Account::new(Uuid::new_v4(), 1, 0)).await,
            Err(CacheError::NotReady)
        ));
        assert!(matches!(cache.state(), InitState::Uninitialized));
    }

    #[tokio::test]
    async fn test_reads_wait_for_initialization() {
        let id = Uuid::new_v4();
        let cache: AggregateCache<Account, _> = AggregateCache::new(
            FaultyTier::seeded(vec![Account::new(id, 7, 70)]),
            CacheConfig::default(),
        );

        let reader = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.get_by_id(id).await })
        };
        tokio::task::yield_now().await;
        assert!(!reader.is_finished());

        cache.initialize().await.unwrap();
        let found = reader.await.unwrap().unwrap().unwrap();
        assert_eq!(found.version, 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_gives_up_after_ready_timeout() {
        let cache: AggregateCache<Account, _> = AggregateCache::new(
            FaultyTier::default(),
            CacheConfig {
                ready_timeout: Some(Duration::from_secs(5)),
                ..Default::default()
            },
        );

        assert!(matches!(cache.get_all().await, Err(CacheError::NotReady)));
    }

    #[tokio::test]
    async fn test_concurrent_initialize_is_rejected() {
        let gate = Arc::new(Notify::new());
        let tier = Arc::new(FaultyTier {
            init_gate: Some(Arc::clone(&gate)),
            ..FaultyTier::seeded(vec![Account::new(Uuid::new_v4(), 1, 0)])
        });
        let cache: AggregateCache<Account, _> =
            AggregateCache::new(Arc::clone(&tier), fail_fast());

        let first = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.initialize().await })
        };
        while !matches!(cache.state(), InitState::Initializing) {
            tokio::task::yield_now().await;
        }

        assert!(matches!(
            cache.initialize().await,
            Err(CacheError::AlreadyInitializing)
        ));
        assert!(matches!(cache.get_all().await, Err(CacheError::NotReady)));

        gate.notify_one();
        first.await.unwrap().unwrap();
        assert_eq!(tier.init_calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.get_all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_durable_initialize_failure_is_permanent() {
        let observer = Arc::new(RecordingObserver::default());
        let tier = FaultyTier::default();
        tier.fail_init.store(true, Ordering::SeqCst);
        let cache: AggregateCache<Account, _> = AggregateCache::with_observer(
            tier,
            CacheConfig::default(),
            Arc::clone(&observer) as Arc<dyn CacheObserver>,
        );

        let err = cache.initialize().await.unwrap_err();
        assert!(matches!(
            err,
            CacheError::InitializationFailed {
                stage: InitStage::DurableInitialize,
                ..
            }
        ));
        assert!(err.to_string().contains("event store unreachable"));

        // never reports Ready, and readers are told why
        assert!(!cache.is_ready());
        assert!(matches!(
            cache.initialize().await,
            Err(CacheError::InitializationFailed { .. })
        ));
        assert!(matches!(
            cache.get_all().await,
            Err(CacheError::InitializationFailed { .. })
        ));
        assert_eq!(
            *observer.events.lock().unwrap(),
            vec![
                "started Account".to_owned(),
                "failed Account durable initialize".to_owned()
            ]
        );
    }

    #[tokio::test]
    async fn test_bulk_pull_failure_reports_stage() {
        let tier = FaultyTier::seeded(vec![Account::new(Uuid::new_v4(), 1, 0)]);
        tier.fail_get_all.store(true, Ordering::SeqCst);
        let cache: AggregateCache<Account, _> =
            AggregateCache::new(tier, CacheConfig::default());

        assert!(matches!(
            cache.initialize().await,
            Err(CacheError::InitializationFailed {
                stage: InitStage::BulkPull,
                ..
            })
        ));
        assert!(matches!(
            cache.state(),
            InitState::Failed {
                stage: InitStage::BulkPull,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_waiting_reader_sees_initialization_failure() {
        let gate = Arc::new(Notify::new());
        let tier = FaultyTier {
            init_gate: Some(Arc::clone(&gate)),
            ..Default::default()
        };
        tier.fail_init.store(true, Ordering::SeqCst);
        let cache: AggregateCache<Account, _> =
            AggregateCache::new(tier, CacheConfig::default());

        let reader = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.get_all().await })
        };
        let init = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.initialize().await })
        };
        while !matches!(cache.state(), InitState::Initializing) {
            tokio::task::yield_now().await;
        }
        gate.notify_one();

        assert!(init.await.unwrap().is_err());
        assert!(matches!(
            reader.await.unwrap(),
            Err(CacheError::InitializationFailed { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_initialize_marks_failed() {
        let tier = FaultyTier {
            init_gate: Some(Arc::new(Notify::new())),
            ..Default::default()
        };
        let cache: AggregateCache<Account, _> =
            AggregateCache::new(tier, CacheConfig::default());

        let outcome = tokio::time::timeout(Duration::from_secs(1), cache.initialize()).await;
        assert!(outcome.is_err());

        assert!(matches!(
            cache.state(),
            InitState::Failed {
                stage: InitStage::Cancelled,
                ..
            }
        ));
        assert!(matches!(
            cache.get_all().await,
            Err(CacheError::InitializationFailed { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_durable_timeout_skips_local_update() {
        let tier = FaultyTier {
            upsert_delay: Some(Duration::from_secs(60)),
            ..Default::default()
        };
        let cache: AggregateCache<Account, _> = AggregateCache::new(
            tier,
            CacheConfig {
                durable_timeout: Some(Duration::from_secs(1)),
                ..Default::default()
            },
        );
        cache.initialize().await.unwrap();
        let id = Uuid::new_v4();

        let err = cache.save(Account::new(id, 1, 0)).await.unwrap_err();
        assert!(matches!(
            err,
            CacheError::DurableTimeout {
                operation: "upsert",
                ..
            }
        ));
        assert!(cache.get_by_id(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_get_where_scans_local_state() {
        let (cache, _tier) = ready_cache(FaultyTier::seeded(vec![
            Account::new(Uuid::new_v4(), 1, -10),
            Account::new(Uuid::new_v4(), 1, 0),
            Account::new(Uuid::new_v4(), 1, 30),
        ]))
        .await;

        let overdrawn = cache.get_where(|a| a.balance < 0).await.unwrap();
        assert_eq!(overdrawn.len(), 1);
        assert_eq!(overdrawn[0].balance, -10);
        assert!(cache.get_where(|a| a.balance > 100).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_resync_pulls_out_of_band_writes() {
        let (cache, tier, observer) = observed_cache(FaultyTier::default()).await;
        let peer_write = Account::new(Uuid::new_v4(), 4, 40);
        tier.inner.upsert(&peer_write).await.unwrap();
        assert!(cache.get_by_id(peer_write.id).await.unwrap().is_none());

        assert_eq!(cache.resync().await.unwrap(), 1);
        assert_eq!(observer.recorded("resynced Account 1"), 1);
        assert_eq!(
            cache.get_by_id(peer_write.id).await.unwrap().unwrap().version,
            4
        );
    }

    #[tokio::test]
    async fn test_follow_applies_foreign_notices_only() {
        let (cache, tier) = ready_cache(FaultyTier::default()).await;
        let own_origin = Uuid::new_v4();

        let peer = Account::new(Uuid::new_v4(), 1, 10);
        let own = Account::new(Uuid::new_v4(), 1, 20);
        let ahead = Account::new(Uuid::new_v4(), 3, 30);
        cache.save(ahead.clone()).await.unwrap();
        tier.inner.upsert(&peer).await.unwrap();
        tier.inner.upsert(&own).await.unwrap();
        // durable copy older than the local one must not win
        tier.inner
            .upsert(&Account::new(ahead.id, 2, 0))
            .await
            .unwrap();

        let feed = futures::stream::iter(vec![
            FeedEvent::Changed(ChangeNotice {
                origin: Uuid::new_v4(),
                ids: vec![peer.id, ahead.id],
            }),
            FeedEvent::Changed(ChangeNotice {
                origin: own_origin,
                ids: vec![own.id],
            }),
        ]);
        cache.follow(feed, Some(own_origin)).await.unwrap();

        assert_eq!(cache.get_by_id(peer.id).await.unwrap().unwrap().balance, 10);
        assert!(cache.get_by_id(own.id).await.unwrap().is_none());
        assert_eq!(cache.get_by_id(ahead.id).await.unwrap().unwrap().version, 3);
    }

    #[tokio::test]
    async fn test_follow_resyncs_on_subscribe() {
        let (cache, tier) = ready_cache(FaultyTier::default()).await;
        let missed = Account::new(Uuid::new_v4(), 1, 1);
        tier.inner.upsert(&missed).await.unwrap();

        cache
            .follow(futures::stream::iter(vec![FeedEvent::Subscribed]), None)
            .await
            .unwrap();

        assert!(cache.get_by_id(missed.id).await.unwrap().is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_saves_all_visible() {
        let (cache, tier) = ready_cache(FaultyTier::default()).await;
        let mut handles = Vec::new();

        for i in 0..16 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move {
                let account = Account::new(Uuid::new_v4(), 1, i);
                cache.save(account.clone()).await.map(|_| account.id)
            }));
        }

        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap().unwrap());
        }
        for id in ids {
            assert!(cache.get_by_id(id).await.unwrap().is_some());
            assert!(tier.inner.get_by_id(id).await.unwrap().is_some());
        }
    }
}
