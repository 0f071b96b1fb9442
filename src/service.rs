//! Plain read-through caching without coalescing.
//!
//! `CacheService` keys entries as `<cache_name>:<key>` and never coordinates
//! with other processes. When the store fails it degrades to calling the
//! loader directly, which is the opposite trade-off from
//! [`CoalesceCacheManager`](crate::CoalesceCacheManager).

use crate::backend::{KeyStore, TtlStatus, DEFAULT_SCAN_COUNT};
use crate::error::{BoxError, Error, Result};
use crate::key::glob_escape;
use crate::serialization::{Codec, EnvelopeCodec};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::time::Duration;

/// TTL used by [`CacheService::cacheable_default`].
pub const DEFAULT_SERVICE_TTL: Duration = Duration::from_secs(600);

/// A value plus whether it came from the cache.
#[derive(Clone, Debug, PartialEq)]
pub struct CacheResult<T> {
    pub value: Option<T>,
    pub cache_hit: bool,
}

impl<T> CacheResult<T> {
    pub fn hit(value: T) -> Self {
        CacheResult {
            value: Some(value),
            cache_hit: true,
        }
    }

    pub fn miss(value: Option<T>) -> Self {
        CacheResult {
            value,
            cache_hit: false,
        }
    }

    pub fn is_cache_miss(&self) -> bool {
        !self.cache_hit
    }

    pub fn into_value(self) -> Option<T> {
        self.value
    }
}

/// Non-coalescing cache helper.
#[derive(Clone)]
pub struct CacheService<S, C = EnvelopeCodec> {
    store: S,
    codec: C,
}

impl<S: KeyStore> CacheService<S, EnvelopeCodec> {
    pub fn new(store: S) -> Self {
        CacheService {
            store,
            codec: EnvelopeCodec,
        }
    }
}

impl<S: KeyStore, C: Codec> CacheService<S, C> {
    pub fn with_codec<C2: Codec>(self, codec: C2) -> CacheService<S, C2> {
        CacheService {
            store: self.store,
            codec,
        }
    }

    /// Read-through: return the cached value or run `loader` and cache a
    /// non-null result.
    ///
    /// If the store fails (or holds an undecodable entry) the loader runs
    /// anyway and its result is returned uncached.
    ///
    /// # Errors
    /// `Error::ValidationError` for bad arguments, `Error::LoaderFailure` if
    /// the loader fails.
    pub async fn cacheable<T, F, Fut, E>(
        &self,
        cache_name: &str,
        key: &str,
        loader: F,
        ttl: Duration,
    ) -> Result<CacheResult<T>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<Option<T>, E>>,
        E: Into<BoxError>,
    {
        validate_cacheable(cache_name, key, ttl)?;
        let full_key = build_key(cache_name, key);

        let cached = match self.store.get(&full_key).await {
            Ok(cached) => cached,
            Err(e) => {
                error!("Error in cacheable operation for key {}: {}", full_key, e);
                let value = run_loader(&full_key, loader).await?;
                return Ok(CacheResult::miss(value));
            }
        };

        if let Some(bytes) = cached {
            match self.codec.decode::<T>(&bytes) {
                Ok(value) => {
                    debug!("Cache HIT - Key: {}", full_key);
                    return Ok(CacheResult::hit(value));
                }
                Err(e) => {
                    error!("Unreadable cache entry {}, reloading: {}", full_key, e);
                    let value = run_loader(&full_key, loader).await?;
                    return Ok(CacheResult::miss(value));
                }
            }
        }

        let value = run_loader(&full_key, loader).await?;
        if let Some(v) = &value {
            self.write(&full_key, v, ttl).await;
        }
        Ok(CacheResult::miss(value))
    }

    /// [`cacheable`](Self::cacheable) with [`DEFAULT_SERVICE_TTL`].
    pub async fn cacheable_default<T, F, Fut, E>(
        &self,
        cache_name: &str,
        key: &str,
        loader: F,
    ) -> Result<CacheResult<T>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<Option<T>, E>>,
        E: Into<BoxError>,
    {
        self.cacheable(cache_name, key, loader, DEFAULT_SERVICE_TTL)
            .await
    }

    /// Always run `loader` and overwrite the entry. A `None` result deletes it.
    pub async fn cache_put<T, F, Fut, E>(
        &self,
        cache_name: &str,
        key: &str,
        loader: F,
        ttl: Duration,
    ) -> Result<Option<T>>
    where
        T: Serialize,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<Option<T>, E>>,
        E: Into<BoxError>,
    {
        validate_cacheable(cache_name, key, ttl)?;
        let full_key = build_key(cache_name, key);
        let value = run_loader(&full_key, loader).await?;

        match &value {
            Some(v) => {
                self.write(&full_key, v, ttl).await;
                debug!("Cache UPDATED - Key: {}", full_key);
            }
            None => match self.store.delete(&full_key).await {
                Ok(_) => debug!("Cache EVICTED (null result) - Key: {}", full_key),
                Err(e) => error!("Error in cachePut operation for key {}: {}", full_key, e),
            },
        }
        Ok(value)
    }

    pub async fn cache_evict(&self, cache_name: &str, key: &str) -> Result<bool> {
        let full_key = build_key(cache_name, key);
        let deleted = self.store.delete(&full_key).await?;
        if deleted {
            debug!("Cache EVICTED - Key: {}", full_key);
        } else {
            debug!("Cache key not found - Key: {}", full_key);
        }
        Ok(deleted)
    }

    /// Delete every entry of `cache_name`, in batches of 100.
    pub async fn cache_evict_all(&self, cache_name: &str) -> Result<u64> {
        let pattern = format!("{}:*", glob_escape(cache_name));
        self.evict_matching(&pattern).await
    }

    pub async fn cache_evict_multiple<K: AsRef<str>>(&self, cache_name: &str, keys: &[K]) -> Result<u64> {
        let full_keys: Vec<String> = keys
            .iter()
            .map(|k| build_key(cache_name, k.as_ref()))
            .collect();
        let deleted = self.store.delete_many(&full_keys).await?;
        debug!("Cache EVICTED MULTIPLE - Count: {}", deleted);
        Ok(deleted)
    }

    /// Delete every store key matching the raw glob `pattern`.
    pub async fn cache_evict_by_pattern(&self, pattern: &str) -> Result<u64> {
        self.evict_matching(pattern).await
    }

    /// `false` if the key is missing or the store failed.
    pub async fn exists(&self, cache_name: &str, key: &str) -> bool {
        let full_key = build_key(cache_name, key);
        match self.store.exists(&full_key).await {
            Ok(exists) => exists,
            Err(e) => {
                error!("Error checking key existence {}: {}", full_key, e);
                false
            }
        }
    }

    /// `None` if the store failed.
    pub async fn ttl(&self, cache_name: &str, key: &str) -> Option<TtlStatus> {
        let full_key = build_key(cache_name, key);
        match self.store.ttl(&full_key).await {
            Ok(status) => Some(status),
            Err(e) => {
                error!("Error getting TTL for key {}: {}", full_key, e);
                None
            }
        }
    }

    async fn write<T: Serialize>(&self, full_key: &str, value: &T, ttl: Duration) {
        let bytes = match self.codec.encode(value) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!("Failed to encode value for {}: {}", full_key, e);
                return;
            }
        };
        match self.store.set(full_key, bytes, Some(ttl)).await {
            Ok(()) => debug!("Cached data - Key: {}", full_key),
            Err(e) => error!("Failed to cache {}: {}", full_key, e),
        }
    }

    async fn evict_matching(&self, pattern: &str) -> Result<u64> {
        let mut cursor = 0;
        let mut removed = 0;
        loop {
            let page = self
                .store
                .scan_page(pattern, cursor, DEFAULT_SCAN_COUNT)
                .await?;
            if !page.keys.is_empty() {
                removed += self.store.delete_many(&page.keys).await?;
            }
            if page.cursor == 0 {
                break;
            }
            cursor = page.cursor;
        }
        debug!("Cache EVICTED BY PATTERN - Pattern: {} ({} keys)", pattern, removed);
        Ok(removed)
    }
}

async fn run_loader<T, F, Fut, E>(full_key: &str, loader: F) -> Result<Option<T>>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = std::result::Result<Option<T>, E>>,
    E: Into<BoxError>,
{
    loader().await.map_err(|e| Error::LoaderFailure {
        key: full_key.to_string(),
        source: e.into(),
    })
}

fn build_key(cache_name: &str, key: &str) -> String {
    format!("{}:{}", cache_name, key)
}

/// # Errors
/// `Error::ValidationError` if the name or key is empty, the name contains
/// `:` or `*`, the key contains `*`, or the TTL is zero.
pub fn validate_cacheable(cache_name: &str, key: &str, ttl: Duration) -> Result<()> {
    if cache_name.trim().is_empty() {
        return Err(Error::ValidationError("Cache name cannot be empty".to_string()));
    }
    if cache_name.contains(':') || cache_name.contains('*') {
        return Err(Error::ValidationError(format!(
            "Cache name cannot contain ':' or '*': {}",
            cache_name
        )));
    }
    if key.trim().is_empty() {
        return Err(Error::ValidationError("Key cannot be empty".to_string()));
    }
    if key.contains('*') {
        return Err(Error::ValidationError(format!("Key cannot contain '*': {}", key)));
    }
    if ttl.is_zero() {
        return Err(Error::ValidationError("TTL must be positive".to_string()));
    }
    Ok(())
}
