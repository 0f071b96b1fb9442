//! Builder pattern for coalesced loads.

use crate::backend::{Broadcaster, KeyStore};
use crate::coalesce::CoalesceCacheManager;
use crate::error::{BoxError, Error, Result};
use crate::serialization::Codec;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::time::Duration;

/// Fluent builder for one `get_or_load` call.
///
/// Provides chainable methods for TTL, null caching, a bypass condition and
/// retry on coordination failures.
///
/// # Example
///
/// ```ignore
/// use std::time::Duration;
///
/// let user = manager
///     .builder("user:42")
///     .with_ttl(Duration::from_secs(300))
///     .cache_null(true)
///     .with_retry(2)
///     .load(|| async move { repo.find_user(42).await })
///     .await?;
/// ```
pub struct CoalesceOperationBuilder<'a, S, B, C> {
    manager: &'a CoalesceCacheManager<S, B, C>,
    key: String,
    ttl: Option<Duration>,
    cache_null: bool,
    condition: bool,
    retry_count: u32,
}

impl<'a, S, B, C> CoalesceOperationBuilder<'a, S, B, C>
where
    S: KeyStore,
    B: Broadcaster,
    C: Codec,
{
    pub(crate) fn new(manager: &'a CoalesceCacheManager<S, B, C>, key: &str) -> Self {
        Self {
            manager,
            key: key.to_string(),
            ttl: None,
            cache_null: false,
            condition: true,
            retry_count: 0,
        }
    }

    /// Expiry for the cached value. Waiters block for `max(ttl, 30s)`.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Cache a `None` result as an explicit null marker.
    pub fn cache_null(mut self, cache_null: bool) -> Self {
        self.cache_null = cache_null;
        self
    }

    /// Skip the cache entirely when `condition` is false: the loader is
    /// called directly and nothing is read, written or locked.
    pub fn when(mut self, condition: bool) -> Self {
        self.condition = condition;
        self
    }

    /// Retry up to `count` times when the outcome could not be learned
    /// (`CoalesceTimeout`) or the store was unreachable (`StoreUnavailable`).
    ///
    /// Loader failures are never retried.
    pub fn with_retry(mut self, count: u32) -> Self {
        self.retry_count = count;
        self
    }

    /// Run the configured operation.
    ///
    /// # Errors
    ///
    /// Same as [`CoalesceCacheManager::get_or_load`], after retries are
    /// exhausted. When bypassed, a loader error is returned as
    /// `Error::LoaderFailure`.
    pub async fn load<T, F, Fut, E>(self, loader: F) -> Result<Option<T>>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Fut + Clone + Send + 'static,
        Fut: Future<Output = std::result::Result<Option<T>, E>> + Send + 'static,
        E: Into<BoxError> + Send + 'static,
    {
        if !self.condition {
            debug!("Bypassing cache for key: {}", self.key);
            return loader().await.map_err(|e| Error::LoaderFailure {
                key: self.key.clone(),
                source: e.into(),
            });
        }

        let mut attempts = 0;
        let max_attempts = self.retry_count + 1; // +1 for initial attempt

        loop {
            attempts += 1;

            match self
                .manager
                .get_or_load(&self.key, loader.clone(), self.ttl, self.cache_null)
                .await
            {
                Ok(value) => return Ok(value),
                Err(e) => {
                    if attempts >= max_attempts || !is_retryable(&e) {
                        return Err(e);
                    }

                    debug!(
                        "Coalesced load for {} failed (attempt {}/{}), retrying: {}",
                        self.key, attempts, max_attempts, e
                    );

                    tokio::time::sleep(retry_delay(attempts)).await;
                }
            }
        }
    }
}

/// First retry waits this long; each further retry doubles it.
const RETRY_BASE_DELAY: Duration = Duration::from_millis(100);

/// Doubling stops here (100ms · 2^10 ≈ 102s).
const MAX_BACKOFF_SHIFT: u32 = 10;

/// Exponential backoff after failed attempt number `attempt` (1-based).
fn retry_delay(attempt: u32) -> Duration {
    let shift = attempt.saturating_sub(1).min(MAX_BACKOFF_SHIFT);
    RETRY_BASE_DELAY.saturating_mul(1 << shift)
}

fn is_retryable(error: &Error) -> bool {
    error.is_timeout() || error.is_store_unavailable()
}

#[cfg(all(test, feature = "inmemory"))]
mod tests {
    use super::*;
    use crate::backend::InMemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    async fn manager(store: &InMemoryStore) -> CoalesceCacheManager<InMemoryStore, InMemoryStore> {
        let manager = CoalesceCacheManager::new(store.clone(), store.clone());
        manager.start().await.unwrap();
        manager
    }

    fn counting_loader(
        calls: &Arc<AtomicUsize>,
        value: Option<&'static str>,
    ) -> impl FnOnce() -> futures::future::Ready<std::result::Result<Option<String>, std::io::Error>>
           + Clone
           + Send
           + 'static {
        let calls = Arc::clone(calls);
        move || {
            calls.fetch_add(1, Ordering::SeqCst);
            futures::future::ready(Ok(value.map(str::to_string)))
        }
    }

    #[tokio::test]
    async fn test_builder_basic() {
        let store = InMemoryStore::new();
        let manager = manager(&store).await;
        let calls = Arc::new(AtomicUsize::new(0));

        let value = manager
            .builder("user:1")
            .load(counting_loader(&calls, Some("data")))
            .await
            .unwrap();

        assert_eq!(value.as_deref(), Some("data"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(manager.exists("user:1").await.unwrap());
    }

    #[tokio::test]
    async fn test_builder_with_ttl() {
        let store = InMemoryStore::new();
        let manager = manager(&store).await;
        let calls = Arc::new(AtomicUsize::new(0));

        manager
            .builder("user:1")
            .with_ttl(Duration::from_secs(300))
            .load(counting_loader(&calls, Some("data")))
            .await
            .unwrap();

        let remaining = manager.ttl("user:1").await.unwrap().as_duration().unwrap();
        assert!(remaining <= Duration::from_secs(300));
        assert!(remaining > Duration::from_secs(290));
    }

    #[tokio::test]
    async fn test_builder_cache_null() {
        let store = InMemoryStore::new();
        let manager = manager(&store).await;
        let calls = Arc::new(AtomicUsize::new(0));

        for _ in 0..2 {
            let value = manager
                .builder("missing")
                .cache_null(true)
                .load(counting_loader(&calls, None))
                .await
                .unwrap();
            assert_eq!(value, None);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_builder_bypass_skips_store() {
        let store = InMemoryStore::new();
        let manager = manager(&store).await;
        manager.put("user:1", &"cached".to_string(), None).await.unwrap();
        let calls = Arc::new(AtomicUsize::new(0));

        let value = manager
            .builder("user:1")
            .when(false)
            .load(counting_loader(&calls, Some("fresh")))
            .await
            .unwrap();

        assert_eq!(value.as_deref(), Some("fresh"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let cached: Option<String> = manager.get("user:1").await.unwrap();
        assert_eq!(cached.as_deref(), Some("cached"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_builder_retries_store_outage_then_gives_up() {
        let store = InMemoryStore::new();
        let manager = manager(&store).await;
        store.set_offline(true);
        let calls = Arc::new(AtomicUsize::new(0));

        let err = manager
            .builder("user:1")
            .with_retry(2)
            .load(counting_loader(&calls, Some("data")))
            .await
            .unwrap_err();

        assert!(err.is_store_unavailable());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_retry_delay_doubles_then_caps() {
        assert_eq!(retry_delay(1), Duration::from_millis(100));
        assert_eq!(retry_delay(2), Duration::from_millis(200));
        assert_eq!(retry_delay(3), Duration::from_millis(400));
        assert_eq!(retry_delay(11), Duration::from_millis(102_400));
        assert_eq!(retry_delay(58), Duration::from_millis(102_400));
        assert_eq!(retry_delay(u32::MAX), Duration::from_millis(102_400));
    }

    #[tokio::test]
    async fn test_builder_does_not_retry_loader_failure() {
        let store = InMemoryStore::new();
        let manager = manager(&store).await;
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);

        let err = manager
            .builder("user:1")
            .with_retry(3)
            .load(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err::<Option<String>, _>(std::io::Error::new(std::io::ErrorKind::Other, "boom")) }
            })
            .await
            .unwrap_err();

        assert!(err.is_loader_failure());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
