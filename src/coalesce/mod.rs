//! Request-coalescing cache manager.
//!
//! When many tasks, in one process or across the fleet, miss on the same key
//! at once, exactly one of them runs the loader. The others wait for its
//! result, delivered over the store's pub/sub channel.
//!
//! # Protocol
//!
//! ```text
//! GET cache:<key> ──hit──▶ return
//!      │ miss
//! SET lock:<key> NX (30s)
//!      ├─ acquired ─▶ loader ─▶ SET cache:<key> ─▶ PUBLISH result ─▶ DEL lock:<key>
//!      └─ contended ─▶ wait on local slot (max(ttl, 30s))
//!                        ├─ resolved ─▶ value / loader error
//!                        └─ timed out ─▶ GET cache:<key> ─▶ value / CoalesceTimeout
//! ```
//!
//! If the store is unavailable the error is returned to the caller. Unlike
//! the plain `CacheService`, the manager never falls back to calling the
//! loader without coordination: that would give up single-flight, so store
//! outages surface as errors instead.

mod pending;

pub use pending::{PendingTable, PendingWaiter, WaitOutcome};

use crate::backend::{listen, Broadcaster, KeyStore, TtlStatus};
use crate::builder::CoalesceOperationBuilder;
use crate::config::{CoalesceConfig, LOCK_TTL};
use crate::error::{BoxError, Error, RemoteLoaderError, Result};
use crate::event::{CoalescedResponse, EvictionEvent};
use crate::eviction::{handle_eviction_event, EvictionHook, EvictionPropagator};
use crate::key::{validate_key, KeyNamespace};
use crate::observability::{CoalesceMetrics, NoOpMetrics};
use crate::serialization::{Codec, EnvelopeCodec};
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

/// Result of racing for `lock:<key>`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockAttempt {
    /// This caller runs the loader.
    Acquired,
    /// Someone else, here or in another process, is loading.
    Contended,
}

/// Fleet-wide single-flight cache.
///
/// # Example
///
/// ```
/// # use coalesce_kit::{CoalesceCacheManager, backend::InMemoryStore};
/// # use std::time::Duration;
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> coalesce_kit::Result<()> {
/// let store = InMemoryStore::new();
/// let manager = CoalesceCacheManager::new(store.clone(), store);
/// manager.start().await?;
///
/// let name: Option<String> = manager
///     .get_or_load(
///         "user:42",
///         || async { Ok::<_, std::io::Error>(Some("Jane".to_string())) },
///         Some(Duration::from_secs(300)),
///         false,
///     )
///     .await?;
/// assert_eq!(name.as_deref(), Some("Jane"));
/// # Ok(())
/// # }
/// ```
pub struct CoalesceCacheManager<S, B, C = EnvelopeCodec> {
    store: S,
    broadcaster: B,
    codec: C,
    config: CoalesceConfig,
    pending: Arc<PendingTable>,
    metrics: Arc<dyn CoalesceMetrics>,
    eviction_hook: Option<EvictionHook>,
    listeners: Mutex<Vec<JoinHandle<()>>>,
}

impl<S, B> CoalesceCacheManager<S, B, EnvelopeCodec>
where
    S: KeyStore,
    B: Broadcaster,
{
    /// Manager with default configuration and codec.
    ///
    /// Call [`start`](Self::start) before use so this process receives
    /// results loaded elsewhere.
    pub fn new(store: S, broadcaster: B) -> Self {
        Self::build(store, broadcaster, EnvelopeCodec, CoalesceConfig::default())
    }

    /// # Errors
    /// `Error::ConfigError` if `config` fails validation.
    pub fn with_config(store: S, broadcaster: B, config: CoalesceConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(store, broadcaster, EnvelopeCodec, config))
    }
}

impl<S, B, C> CoalesceCacheManager<S, B, C>
where
    S: KeyStore,
    B: Broadcaster,
    C: Codec,
{
    fn build(store: S, broadcaster: B, codec: C, config: CoalesceConfig) -> Self {
        CoalesceCacheManager {
            store,
            broadcaster,
            codec,
            config,
            pending: Arc::new(PendingTable::new()),
            metrics: Arc::new(NoOpMetrics),
            eviction_hook: None,
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// Swap the codec. Every process in the fleet must use the same one.
    pub fn with_codec<C2: Codec>(self, codec: C2) -> CoalesceCacheManager<S, B, C2> {
        let mut manager = CoalesceCacheManager::build(
            self.store.clone(),
            self.broadcaster.clone(),
            codec,
            self.config.clone(),
        );
        manager.metrics = Arc::clone(&self.metrics);
        manager.eviction_hook = self.eviction_hook.clone();
        manager
    }

    /// Set custom metrics handler.
    pub fn with_metrics(mut self, metrics: impl CoalesceMetrics + 'static) -> Self {
        self.metrics = Arc::new(metrics);
        self
    }

    /// Run `hook` for every eviction announced by any process.
    ///
    /// Meant for processes that keep a secondary in-memory tier.
    pub fn on_eviction(mut self, hook: impl Fn(&EvictionEvent) + Send + Sync + 'static) -> Self {
        self.eviction_hook = Some(Arc::new(hook));
        self
    }

    /// Subscribe to the result and eviction topics.
    ///
    /// Spawns one listener task per topic. The listeners resubscribe on
    /// their own when a stream ends. Calling `start` again is a no-op while
    /// they run, and restarts them if they were stopped.
    pub async fn start(&self) -> Result<()> {
        {
            let mut listeners = self.lock_listeners();
            listeners.retain(|handle| !handle.is_finished());
            if !listeners.is_empty() {
                return Ok(());
            }
        }

        let ns = &self.config.namespace;
        let results = self.broadcaster.subscribe(&ns.result_topic).await?;
        let evictions = self.broadcaster.subscribe(&ns.evict_topic).await?;

        let pending = Arc::clone(&self.pending);
        let codec = self.codec.clone();
        let result_listener = listen(
            self.broadcaster.clone(),
            ns.result_topic.clone(),
            results,
            move |payload| {
                let response: CoalescedResponse = codec.decode(payload)?;
                let key = response.coalescing_key.clone();
                let resolved = pending.resolve(&key, response.into_outcome());
                if resolved > 0 {
                    debug!("Completed {} pending request(s) for key: {}", resolved, key);
                }
                Ok(())
            },
        );

        let codec = self.codec.clone();
        let hook = self.eviction_hook.clone();
        let eviction_listener = listen(
            self.broadcaster.clone(),
            ns.evict_topic.clone(),
            evictions,
            move |payload| handle_eviction_event(&codec, payload, hook.as_ref()),
        );

        let mut listeners = self.lock_listeners();
        if listeners.is_empty() {
            listeners.push(result_listener);
            listeners.push(eviction_listener);
        } else {
            // Lost a concurrent start() race.
            result_listener.abort();
            eviction_listener.abort();
        }
        Ok(())
    }

    /// Stop the listener tasks. Waiters still blocked will time out.
    pub fn shutdown(&self) {
        for handle in self.lock_listeners().drain(..) {
            handle.abort();
        }
    }

    fn lock_listeners(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Create a builder for per-call options (TTL, null caching, retries).
    pub fn builder(&self, key: &str) -> CoalesceOperationBuilder<'_, S, B, C> {
        CoalesceOperationBuilder::new(self, key)
    }

    pub fn config(&self) -> &CoalesceConfig {
        &self.config
    }

    pub fn namespace(&self) -> &KeyNamespace {
        &self.config.namespace
    }

    /// Process-local waiters, mostly for diagnostics.
    pub fn pending(&self) -> &PendingTable {
        &self.pending
    }

    fn evictions(&self) -> EvictionPropagator<S, B, C> {
        EvictionPropagator::new(
            self.store.clone(),
            self.broadcaster.clone(),
            self.codec.clone(),
            self.config.namespace.clone(),
            self.config.scan_batch_size,
            Arc::clone(&self.metrics),
        )
    }

    // ------------------------------------------------------------------
    // Plain cache operations
    // ------------------------------------------------------------------

    /// Read `cache:<key>`.
    ///
    /// A cached null reads as `None`; use [`exists`](Self::exists) to tell it
    /// apart from a miss.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let full_key = self.config.namespace.cache_key(key);
        match self.store.get(&full_key).await? {
            Some(bytes) => {
                debug!("Cache hit for key: {}", full_key);
                let value: Option<T> = self.codec.decode(&bytes)?;
                Ok(value)
            }
            None => {
                debug!("Cache miss for key: {}", full_key);
                Ok(None)
            }
        }
    }

    /// Write `cache:<key>`. `None` or a zero TTL means no expiry.
    pub async fn put<T: Serialize>(&self, key: &str, value: &T, ttl: Option<Duration>) -> Result<()> {
        validate_key(key)?;
        let full_key = self.config.namespace.cache_key(key);
        let bytes = self.codec.encode(&Some(value))?;
        self.store.set(&full_key, bytes, ttl).await?;
        debug!("Cached value for key: {}", full_key);
        Ok(())
    }

    pub async fn evict(&self, key: &str) -> Result<bool> {
        self.evictions().evict(key).await
    }

    /// Evict every key starting with `prefix`, announcing each one.
    pub async fn evict_all(&self, prefix: &str) -> Result<u64> {
        self.evictions().evict_all(prefix).await
    }

    /// Evict every key matching the glob `pattern` (scoped to the cache
    /// namespace), announcing each one.
    pub async fn evict_pattern(&self, pattern: &str) -> Result<u64> {
        self.evictions().evict_pattern(pattern).await
    }

    pub async fn evict_multiple<K: AsRef<str>>(&self, keys: &[K]) -> Result<u64> {
        self.evictions().evict_multiple(keys).await
    }

    /// Delete every cache entry without announcing. Locks are untouched.
    pub async fn clear(&self) -> Result<u64> {
        self.evictions().clear().await
    }

    pub async fn exists(&self, key: &str) -> Result<bool> {
        self.store
            .exists(&self.config.namespace.cache_key(key))
            .await
    }

    pub async fn ttl(&self, key: &str) -> Result<TtlStatus> {
        self.store.ttl(&self.config.namespace.cache_key(key)).await
    }

    /// Returns `false` if the key does not exist.
    pub async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let full_key = self.config.namespace.cache_key(key);
        let updated = self.store.expire(&full_key, ttl).await?;
        debug!("Set expiration for key: {} to {:?} ({})", full_key, ttl, updated);
        Ok(updated)
    }

    // ------------------------------------------------------------------
    // Coalescing
    // ------------------------------------------------------------------

    /// Get `key` or load it, running `loader` at most once per episode
    /// across every process sharing the store.
    ///
    /// - `ttl`: expiry for the cached value (`None` or zero: no expiry). Also
    ///   sets how long waiters block: `max(ttl, 30s)`.
    /// - `cache_null`: cache a `None` result as an explicit null marker.
    ///
    /// If this caller wins the lock, the loader runs in its own task: dropping
    /// the returned future does not abandon the lock, the load still
    /// finishes, publishes and unlocks.
    ///
    /// # Errors
    ///
    /// - `Error::LoaderFailure`: the loader failed (here or in the process
    ///   that ran it)
    /// - `Error::CoalesceTimeout`: this caller waited and could not learn the
    ///   outcome in time
    /// - `Error::StoreUnavailable`: the store could not be reached
    /// - `Error::ValidationError`: empty key or key containing `*`
    /// - codec errors if a cached value cannot be decoded as `T`
    pub async fn get_or_load<T, F, Fut, E>(
        &self,
        key: &str,
        loader: F,
        ttl: Option<Duration>,
        cache_null: bool,
    ) -> Result<Option<T>>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<Option<T>, E>> + Send + 'static,
        E: Into<BoxError> + Send + 'static,
    {
        let result = self.coalesce(key, loader, ttl, cache_null).await;
        if let Err(e) = &result {
            match e {
                Error::CoalesceTimeout { waited, .. } => self.metrics.record_timeout(key, *waited),
                _ => self.metrics.record_error(key, &e.to_string()),
            }
        }
        result
    }

    async fn coalesce<T, F, Fut, E>(
        &self,
        key: &str,
        loader: F,
        ttl: Option<Duration>,
        cache_null: bool,
    ) -> Result<Option<T>>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<Option<T>, E>> + Send + 'static,
        E: Into<BoxError> + Send + 'static,
    {
        validate_key(key)?;
        let timer = Instant::now();
        let ns = &self.config.namespace;
        let cache_key = ns.cache_key(key);

        // Step 1: fast path, no lock touched
        if let Some(bytes) = self.store.get(&cache_key).await? {
            debug!("✓ Cache hit for coalesced key: {}", cache_key);
            let value: Option<T> = self.codec.decode(&bytes)?;
            self.metrics.record_hit(key, timer.elapsed());
            return Ok(value);
        }
        self.metrics.record_miss(key);

        // Step 2: race for the lock
        let request_id = Uuid::new_v4().to_string();
        match self.try_lock(key, &request_id).await? {
            LockAttempt::Acquired => {
                debug!("Acquired lock for key: {}, executing loader", cache_key);
                let episode = LoadEpisode {
                    key: key.to_string(),
                    cache_key,
                    lock_key: ns.lock_key(key),
                    result_topic: ns.result_topic.clone(),
                    ttl,
                    cache_null,
                    store: self.store.clone(),
                    broadcaster: self.broadcaster.clone(),
                    codec: self.codec.clone(),
                    metrics: Arc::clone(&self.metrics),
                };

                // Detached so caller cancellation cannot leak the lock.
                match tokio::spawn(episode.run(loader)).await {
                    Ok(result) => result,
                    Err(e) => Err(Error::Cancelled(format!(
                        "load task for key {} did not complete: {}",
                        key, e
                    ))),
                }
            }
            LockAttempt::Contended => {
                debug!("Lock not acquired for key: {}, waiting for result", cache_key);
                self.wait_for_result(key, ttl, timer).await
            }
        }
    }

    /// Atomic `SET lock:<key> <request_id> NX` with [`LOCK_TTL`].
    ///
    /// # Errors
    /// `Error::StoreUnavailable` if the store cannot be reached.
    pub async fn try_lock(&self, key: &str, request_id: &str) -> Result<LockAttempt> {
        let lock_key = self.config.namespace.lock_key(key);
        let acquired = self
            .store
            .set_if_absent(&lock_key, request_id.as_bytes().to_vec(), LOCK_TTL)
            .await?;

        Ok(if acquired {
            LockAttempt::Acquired
        } else {
            LockAttempt::Contended
        })
    }

    async fn wait_for_result<T>(&self, key: &str, ttl: Option<Duration>, timer: Instant) -> Result<Option<T>>
    where
        T: DeserializeOwned,
    {
        let cache_key = self.config.namespace.cache_key(key);
        let mut waiter = self.pending.register(key);

        // The winner may have published before we registered.
        if let Some(bytes) = self.store.get(&cache_key).await? {
            drop(waiter);
            let value: Option<T> = self.codec.decode(&bytes)?;
            self.metrics.record_coalesced(key, timer.elapsed());
            return Ok(value);
        }

        let bound = self.config.wait_bound(ttl);
        let outcome = waiter.wait(bound).await;
        drop(waiter);

        let cause = match outcome {
            WaitOutcome::Resolved(Ok(bytes)) => {
                debug!("Received coalesced result for key: {}", key);
                let value: Option<T> = self.codec.decode(&bytes)?;
                self.metrics.record_coalesced(key, timer.elapsed());
                return Ok(value);
            }
            WaitOutcome::Resolved(Err(message)) => {
                return Err(Error::LoaderFailure {
                    key: key.to_string(),
                    source: Box::new(RemoteLoaderError(message)),
                });
            }
            WaitOutcome::TimedOut => format!("no result within {:?}", bound),
            WaitOutcome::Abandoned => "result slot dropped".to_string(),
        };

        warn!(
            "Timeout or error waiting for coalesced result for key {}: {}",
            key, cause
        );

        // Last chance: the value may be cached even though delivery raced us.
        let cause = match self.store.get(&cache_key).await {
            Ok(Some(bytes)) => {
                let value: Option<T> = self.codec.decode(&bytes)?;
                self.metrics.record_coalesced(key, timer.elapsed());
                return Ok(value);
            }
            Ok(None) => cause,
            Err(e) => format!("{}; cache re-check failed: {}", cause, e),
        };

        Err(Error::CoalesceTimeout {
            key: key.to_string(),
            waited: timer.elapsed(),
            cause,
        })
    }
}

impl<S, B, C> Drop for CoalesceCacheManager<S, B, C> {
    fn drop(&mut self) {
        let listeners = match self.listeners.get_mut() {
            Ok(listeners) => listeners,
            Err(poisoned) => poisoned.into_inner(),
        };
        for handle in listeners.drain(..) {
            handle.abort();
        }
    }
}

/// Everything the lock winner needs, owned, so the load can outlive the
/// caller's future.
struct LoadEpisode<S, B, C> {
    key: String,
    cache_key: String,
    lock_key: String,
    result_topic: String,
    ttl: Option<Duration>,
    cache_null: bool,
    store: S,
    broadcaster: B,
    codec: C,
    metrics: Arc<dyn CoalesceMetrics>,
}

impl<S, B, C> LoadEpisode<S, B, C>
where
    S: KeyStore,
    B: Broadcaster,
    C: Codec,
{
    /// Loader → cache write → publish → unlock. Unlock runs on every path,
    /// including a panicking loader.
    async fn run<T, F, Fut, E>(self, loader: F) -> Result<Option<T>>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<Option<T>, E>> + Send + 'static,
        E: Into<BoxError> + Send + 'static,
    {
        let timer = Instant::now();

        // A previous episode may have finished between our miss and the lock.
        match self.store.get(&self.cache_key).await {
            Ok(Some(bytes)) => {
                debug!("✓ {} filled while acquiring lock, skipping loader", self.cache_key);
                self.unlock().await;
                let value: Option<T> = self.codec.decode(&bytes)?;
                self.metrics.record_hit(&self.key, timer.elapsed());
                return Ok(value);
            }
            Ok(None) => {}
            Err(e) => {
                self.unlock().await;
                return Err(e);
            }
        }

        let outcome = AssertUnwindSafe(async move { loader().await })
            .catch_unwind()
            .await;

        let result = match outcome {
            Ok(Ok(value)) => self.complete(value, timer).await,
            Ok(Err(e)) => {
                let source: BoxError = e.into();
                self.publish(CoalescedResponse::failure(&self.key, source.to_string()))
                    .await;
                Err(Error::LoaderFailure {
                    key: self.key.clone(),
                    source,
                })
            }
            Err(panic) => {
                let message = format!("loader panicked: {}", panic_message(panic.as_ref()));
                error!("Loader for key {} panicked", self.key);
                self.publish(CoalescedResponse::failure(&self.key, message.clone()))
                    .await;
                Err(Error::LoaderFailure {
                    key: self.key.clone(),
                    source: message.into(),
                })
            }
        };

        self.unlock().await;
        result
    }

    /// Cache (if allowed) before publishing, so a waiter that times out and
    /// re-reads the cache sees the value.
    async fn complete<T: Serialize>(&self, value: Option<T>, timer: Instant) -> Result<Option<T>> {
        let bytes = match self.codec.encode(&value) {
            Ok(bytes) => bytes,
            Err(e) => {
                self.publish(CoalescedResponse::failure(&self.key, e.to_string()))
                    .await;
                return Err(e);
            }
        };

        if value.is_some() || self.cache_null {
            match self.store.set(&self.cache_key, bytes.clone(), self.ttl).await {
                Ok(()) => debug!("Cached value for key: {}", self.cache_key),
                Err(e) => warn!(
                    "Loaded {} but could not cache it, serving uncached: {}",
                    self.cache_key, e
                ),
            }
        }

        self.publish(CoalescedResponse::success(&self.key, bytes)).await;
        self.metrics.record_load(&self.key, timer.elapsed());
        Ok(value)
    }

    async fn publish(&self, response: CoalescedResponse) {
        let payload = match self.codec.encode(&response) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Failed to encode coalesce result for key {}: {}", self.key, e);
                return;
            }
        };

        match self.broadcaster.publish(&self.result_topic, payload).await {
            Ok(()) => debug!("Published coalesce result for key: {}", self.key),
            Err(e) => warn!(
                "Failed to publish coalesce result for key {}, waiters will fall back to the cache: {}",
                self.key, e
            ),
        }
    }

    async fn unlock(&self) {
        if let Err(e) = self.store.delete(&self.lock_key).await {
            warn!(
                "Failed to release {}, it expires in {:?}: {}",
                self.lock_key, LOCK_TTL, e
            );
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(all(test, feature = "inmemory"))]
mod tests {
    use super::*;
    use crate::backend::InMemoryStore;
    use crate::observability::CacheStats;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn started(store: &InMemoryStore) -> CoalesceCacheManager<InMemoryStore, InMemoryStore> {
        let manager = CoalesceCacheManager::new(store.clone(), store.clone());
        manager.start().await.unwrap();
        manager
    }

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let store = InMemoryStore::new();
        let manager = started(&store).await;

        manager
            .put("user:42", &"Jane".to_string(), Some(Duration::from_secs(60)))
            .await
            .unwrap();

        let value: Option<String> = manager.get("user:42").await.unwrap();
        assert_eq!(value.as_deref(), Some("Jane"));
        assert!(manager.exists("user:42").await.unwrap());
        assert!(store.exists("cache:user:42").await.unwrap());
    }

    #[tokio::test]
    async fn test_loader_result_cached_with_ttl() {
        let store = InMemoryStore::new();
        let manager = started(&store).await;

        let value = manager
            .get_or_load(
                "user:42",
                || async { Ok::<_, std::io::Error>(Some("Jane".to_string())) },
                Some(Duration::from_secs(300)),
                false,
            )
            .await
            .unwrap();
        assert_eq!(value.as_deref(), Some("Jane"));

        assert!(matches!(manager.ttl("user:42").await.unwrap(), TtlStatus::Expires(_)));
        assert!(!store.exists("lock:user:42").await.unwrap());
    }

    #[tokio::test]
    async fn test_fast_path_skips_loader() {
        let store = InMemoryStore::new();
        let manager = started(&store).await;
        manager.put("k", &7u32, None).await.unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let value = manager
            .get_or_load(
                "k",
                move || async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, std::io::Error>(Some(0u32))
                },
                None,
                false,
            )
            .await
            .unwrap();

        assert_eq!(value, Some(7));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_null_result_not_cached_by_default() {
        let store = InMemoryStore::new();
        let manager = started(&store).await;

        let value: Option<String> = manager
            .get_or_load("nothing", || async { Ok::<_, std::io::Error>(None) }, None, false)
            .await
            .unwrap();

        assert_eq!(value, None);
        assert!(!manager.exists("nothing").await.unwrap());
    }

    #[tokio::test]
    async fn test_null_result_cached_as_marker() {
        let store = InMemoryStore::new();
        let manager = started(&store).await;

        let value: Option<String> = manager
            .get_or_load("nothing", || async { Ok::<_, std::io::Error>(None) }, None, true)
            .await
            .unwrap();
        assert_eq!(value, None);

        assert!(manager.exists("nothing").await.unwrap());
        let cached: Option<String> = manager.get("nothing").await.unwrap();
        assert_eq!(cached, None);

        // Served from the marker, loader not called again.
        let second: Option<String> = manager
            .get_or_load(
                "nothing",
                || async { Ok::<_, std::io::Error>(Some("late".to_string())) },
                None,
                true,
            )
            .await
            .unwrap();
        assert_eq!(second, None);
    }

    #[tokio::test]
    async fn test_loader_error_is_returned_verbatim_and_not_cached() {
        let store = InMemoryStore::new();
        let manager = started(&store).await;

        let err = manager
            .get_or_load::<String, _, _, _>(
                "broken",
                || async { Err(std::io::Error::new(std::io::ErrorKind::Other, "db down")) },
                None,
                true,
            )
            .await
            .unwrap_err();

        match err {
            Error::LoaderFailure { key, source } => {
                assert_eq!(key, "broken");
                assert!(source.downcast_ref::<std::io::Error>().is_some());
                assert_eq!(source.to_string(), "db down");
            }
            other => panic!("expected loader failure, got {other:?}"),
        }
        assert!(!manager.exists("broken").await.unwrap());
        assert!(!store.exists("lock:broken").await.unwrap());
    }

    async fn exploding_loader() -> std::result::Result<Option<String>, std::io::Error> {
        panic!("loader bug")
    }

    #[tokio::test]
    async fn test_panicking_loader_releases_lock() {
        let store = InMemoryStore::new();
        let manager = started(&store).await;

        let err = manager
            .get_or_load("explodes", exploding_loader, None, false)
            .await
            .unwrap_err();

        assert!(err.is_loader_failure());
        assert!(err.to_string().contains("loader bug"));
        assert!(!store.exists("lock:explodes").await.unwrap());
    }

    #[tokio::test]
    async fn test_store_unavailable_is_surfaced_without_loading() {
        let store = InMemoryStore::new();
        let manager = started(&store).await;
        store.set_offline(true);

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let err = manager
            .get_or_load(
                "k",
                move || async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, std::io::Error>(Some(1u8))
                },
                None,
                false,
            )
            .await
            .unwrap_err();

        assert!(err.is_store_unavailable());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_invalid_key_rejected() {
        let store = InMemoryStore::new();
        let manager = started(&store).await;

        let err = manager
            .get_or_load("bad*", || async { Ok::<_, std::io::Error>(Some(1u8)) }, None, false)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ValidationError(_)));
    }

    #[tokio::test]
    async fn test_try_lock_is_tri_state() {
        let store = InMemoryStore::new();
        let manager = CoalesceCacheManager::new(store.clone(), store.clone());

        assert_eq!(manager.try_lock("k", "r1").await.unwrap(), LockAttempt::Acquired);
        assert_eq!(manager.try_lock("k", "r2").await.unwrap(), LockAttempt::Contended);
        assert_eq!(store.get("lock:k").await.unwrap(), Some(b"r1".to_vec()));

        store.set_offline(true);
        assert!(manager.try_lock("other", "r3").await.unwrap_err().is_store_unavailable());
    }

    #[tokio::test]
    async fn test_metrics_record_hit_and_load() {
        let store = InMemoryStore::new();
        let stats = CacheStats::new();
        let manager = CoalesceCacheManager::new(store.clone(), store.clone()).with_metrics(stats.clone());
        manager.start().await.unwrap();

        for _ in 0..2 {
            manager
                .get_or_load("m", || async { Ok::<_, std::io::Error>(Some(1u8)) }, None, false)
                .await
                .unwrap();
        }

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.loads, 1);
        assert_eq!(snapshot.hits, 1);
        assert_eq!(snapshot.misses, 1);
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let store = InMemoryStore::new();
        let manager = started(&store).await;
        manager.start().await.unwrap();
        assert_eq!(manager.lock_listeners().len(), 2);

        manager.shutdown();
        assert!(manager.lock_listeners().is_empty());

        manager.start().await.unwrap();
        assert_eq!(manager.lock_listeners().len(), 2);
    }

    #[tokio::test]
    async fn test_expire_and_ttl() {
        let store = InMemoryStore::new();
        let manager = started(&store).await;
        manager.put("k", &1u8, None).await.unwrap();
        assert_eq!(manager.ttl("k").await.unwrap(), TtlStatus::Persistent);

        assert!(manager.expire("k", Duration::from_secs(60)).await.unwrap());
        assert!(matches!(manager.ttl("k").await.unwrap(), TtlStatus::Expires(_)));
        assert!(!manager.expire("missing", Duration::from_secs(60)).await.unwrap());
    }
}
