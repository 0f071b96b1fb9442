//! Eviction with fleet-wide announcement.
//!
//! Every deleted cache entry is announced on the eviction topic, one
//! [`EvictionEvent`] per key, so processes holding a secondary in-memory tier
//! can drop their copy.

use crate::backend::{Broadcaster, KeyStore};
use crate::error::Result;
use crate::event::EvictionEvent;
use crate::key::KeyNamespace;
use crate::observability::CoalesceMetrics;
use crate::serialization::Codec;
use std::sync::Arc;

/// Deletes cache entries and announces each deletion.
#[derive(Clone)]
pub struct EvictionPropagator<S, B, C> {
    store: S,
    broadcaster: B,
    codec: C,
    namespace: KeyNamespace,
    batch_size: usize,
    metrics: Arc<dyn CoalesceMetrics>,
}

impl<S, B, C> EvictionPropagator<S, B, C>
where
    S: KeyStore,
    B: Broadcaster,
    C: Codec,
{
    pub fn new(
        store: S,
        broadcaster: B,
        codec: C,
        namespace: KeyNamespace,
        batch_size: usize,
        metrics: Arc<dyn CoalesceMetrics>,
    ) -> Self {
        EvictionPropagator {
            store,
            broadcaster,
            codec,
            namespace,
            batch_size: batch_size.max(1),
            metrics,
        }
    }

    /// Delete `cache:<key>` and announce it.
    ///
    /// The event is published even if the key was already gone.
    pub async fn evict(&self, key: &str) -> Result<bool> {
        let full_key = self.namespace.cache_key(key);
        let deleted = self.store.delete(&full_key).await?;
        info!("Evicted cache key: {} (existed: {})", full_key, deleted);

        self.announce(&full_key).await;
        Ok(deleted)
    }

    /// Delete every entry whose logical key starts with `prefix`.
    pub async fn evict_all(&self, prefix: &str) -> Result<u64> {
        let pattern = self.namespace.prefix_pattern(prefix);
        self.evict_matching(&pattern, true).await
    }

    /// Delete every entry whose logical key matches the glob `pattern`.
    pub async fn evict_pattern(&self, pattern: &str) -> Result<u64> {
        let pattern = self.namespace.scoped_pattern(pattern);
        self.evict_matching(&pattern, true).await
    }

    /// Delete the given logical keys in one round trip, announcing each.
    pub async fn evict_multiple<K: AsRef<str>>(&self, keys: &[K]) -> Result<u64> {
        if keys.is_empty() {
            return Ok(0);
        }

        let full_keys: Vec<String> = keys
            .iter()
            .map(|k| self.namespace.cache_key(k.as_ref()))
            .collect();

        let deleted = self.store.delete_many(&full_keys).await?;
        info!("Evicted {} cache keys ({} existed)", full_keys.len(), deleted);

        for full_key in &full_keys {
            self.announce(full_key).await;
        }
        Ok(deleted)
    }

    /// Delete the whole cache namespace without announcing.
    pub async fn clear(&self) -> Result<u64> {
        let pattern = self.namespace.scoped_pattern("*");
        let removed = self.evict_matching(&pattern, false).await?;
        warn!("⚠ Cleared all cache entries: {} keys", removed);
        Ok(removed)
    }

    /// Walk `pattern` page by page, deleting each page before fetching the
    /// next, so the full key set is never held in memory.
    async fn evict_matching(&self, pattern: &str, announce: bool) -> Result<u64> {
        let mut cursor = 0;
        let mut removed = 0;

        loop {
            let page = self
                .store
                .scan_page(pattern, cursor, self.batch_size)
                .await?;

            if !page.keys.is_empty() {
                removed += self.store.delete_many(&page.keys).await?;
                if announce {
                    for full_key in &page.keys {
                        self.announce(full_key).await;
                    }
                }
            }

            if page.cursor == 0 {
                break;
            }
            cursor = page.cursor;
        }

        info!("Evicted {} keys matching pattern: {}", removed, pattern);
        Ok(removed)
    }

    /// Best effort: a failed announcement is logged, the deletion stands.
    async fn announce(&self, full_key: &str) {
        self.metrics.record_eviction(self.namespace.logical_key(full_key));

        let payload = match self.codec.encode(&EvictionEvent::new(full_key)) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Failed to encode eviction event for {}: {}", full_key, e);
                return;
            }
        };

        if let Err(e) = self
            .broadcaster
            .publish(&self.namespace.evict_topic, payload)
            .await
        {
            warn!("Failed to publish eviction of {}: {}", full_key, e);
        }
    }
}

/// Hook invoked for every eviction event received from the fleet.
pub type EvictionHook = Arc<dyn Fn(&EvictionEvent) + Send + Sync>;

/// Subscription handler body for the eviction topic.
pub(crate) fn handle_eviction_event<C: Codec>(
    codec: &C,
    payload: &[u8],
    hook: Option<&EvictionHook>,
) -> Result<()> {
    let event: EvictionEvent = codec.decode(payload)?;
    debug!("Received eviction event for key: {}", event.key);

    if let Some(hook) = hook {
        hook(&event);
    }
    Ok(())
}
