//! Store adapters.
//!
//! A backend provides two capabilities over the shared store:
//!
//! - [`KeyStore`]: get/set/delete with TTL, the atomic `set_if_absent` lock
//!   primitive, and cursor-based scans
//! - [`Broadcaster`]: fire-and-forget publish and per-topic subscriptions
//!
//! Both are usually implemented by the same type (see [`InMemoryStore`] and
//! `RedisStore`).

use crate::error::Result;
use crate::key::glob_escape;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tokio::task::JoinHandle;

#[cfg(feature = "inmemory")]
pub mod inmemory;
#[cfg(feature = "redis")]
pub mod redis;

#[cfg(feature = "inmemory")]
pub use self::inmemory::InMemoryStore;
#[cfg(feature = "redis")]
pub use self::redis::{RedisConfig, RedisStatus, RedisStore};

/// Page size used by the provided scan collectors.
pub const DEFAULT_SCAN_COUNT: usize = 100;

/// One page of a cursor-based scan.
///
/// A returned `cursor` of `0` means the iteration is complete.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ScanPage {
    pub cursor: u64,
    pub keys: Vec<String>,
}

/// Remaining lifetime of a key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TtlStatus {
    /// Key does not exist.
    Missing,
    /// Key exists without an expiry.
    Persistent,
    Expires(Duration),
}

impl TtlStatus {
    /// Redis `TTL` reply → status. `-2` missing, `-1` no expiry.
    pub fn from_redis_reply(reply: i64) -> Self {
        match reply {
            -2 => TtlStatus::Missing,
            r if r < 0 => TtlStatus::Persistent,
            r => TtlStatus::Expires(Duration::from_secs(r as u64)),
        }
    }

    pub fn as_duration(&self) -> Option<Duration> {
        match self {
            TtlStatus::Expires(d) => Some(*d),
            _ => None,
        }
    }
}

/// Normalise a caller TTL: zero means "no expiry".
pub(crate) fn effective_ttl(ttl: Option<Duration>) -> Option<Duration> {
    ttl.filter(|d| !d.is_zero())
}

/// Key-value side of the shared store.
///
/// Every operation fails with `Error::StoreUnavailable` on connectivity loss.
/// Implementations do not retry.
pub trait KeyStore: Clone + Send + Sync + 'static {
    fn get(&self, key: &str) -> impl Future<Output = Result<Option<Vec<u8>>>> + Send;

    /// Store `value`. `None` or a zero TTL means no expiry.
    fn set(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Returns `true` if the key existed.
    fn delete(&self, key: &str) -> impl Future<Output = Result<bool>> + Send;

    /// Returns the number of keys actually removed.
    fn delete_many(&self, keys: &[String]) -> impl Future<Output = Result<u64>> + Send;

    fn exists(&self, key: &str) -> impl Future<Output = Result<bool>> + Send;

    /// Atomically store `value` only if `key` is absent.
    ///
    /// This is the mutual-exclusion primitive for coalescing locks. Returns
    /// `true` if this caller created the key.
    fn set_if_absent(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Duration,
    ) -> impl Future<Output = Result<bool>> + Send;

    /// Fetch one page of keys matching a Redis-style glob.
    ///
    /// Start with cursor `0`; keep calling with the returned cursor until it
    /// is `0` again. Deleting returned keys between pages must not make the
    /// scan skip other live keys.
    fn scan_page(
        &self,
        pattern: &str,
        cursor: u64,
        count: usize,
    ) -> impl Future<Output = Result<ScanPage>> + Send;

    fn ttl(&self, key: &str) -> impl Future<Output = Result<TtlStatus>> + Send;

    /// Returns `false` if the key does not exist.
    fn expire(&self, key: &str, ttl: Duration) -> impl Future<Output = Result<bool>> + Send;

    fn health_check(&self) -> impl Future<Output = Result<bool>> + Send;

    /// Collect every key matching `pattern`.
    ///
    /// Loads the whole match set; eviction paths use [`KeyStore::scan_page`]
    /// directly.
    fn scan_by_pattern(&self, pattern: &str) -> impl Future<Output = Result<Vec<String>>> + Send {
        async move {
            let mut keys = Vec::new();
            let mut cursor = 0;
            loop {
                let page = self.scan_page(pattern, cursor, DEFAULT_SCAN_COUNT).await?;
                keys.extend(page.keys);
                if page.cursor == 0 {
                    break;
                }
                cursor = page.cursor;
            }
            Ok(keys)
        }
    }

    fn scan_by_prefix(&self, prefix: &str) -> impl Future<Output = Result<Vec<String>>> + Send {
        async move {
            let pattern = format!("{}*", glob_escape(prefix));
            self.scan_by_pattern(&pattern).await
        }
    }
}

/// Stream of raw payloads delivered on one topic.
pub type Subscription = BoxStream<'static, Vec<u8>>;

/// Publish/subscribe side of the shared store.
///
/// Delivery is best effort. Per-topic ordering is whatever the transport
/// provides.
pub trait Broadcaster: Clone + Send + Sync + 'static {
    fn publish(&self, topic: &str, payload: Vec<u8>) -> impl Future<Output = Result<()>> + Send;

    fn subscribe(&self, topic: &str) -> impl Future<Output = Result<Subscription>> + Send;
}

/// First pause before resubscribing after a stream ends.
const RESUBSCRIBE_BACKOFF: Duration = Duration::from_millis(100);

/// Upper bound for the resubscribe pause.
const MAX_RESUBSCRIBE_BACKOFF: Duration = Duration::from_secs(30);

/// Spawn the listener task for one topic, starting from `subscription`.
///
/// `handler` runs for every payload. An `Err` or a panic in the handler is
/// logged and the loop keeps going. When the stream ends (for example a
/// dropped pub/sub connection) the task resubscribes through `broadcaster`
/// with exponential backoff, so it only stops when aborted.
pub fn listen<B, H>(
    broadcaster: B,
    topic: String,
    mut subscription: Subscription,
    handler: H,
) -> JoinHandle<()>
where
    B: Broadcaster,
    H: Fn(&[u8]) -> Result<()> + Send + Sync + 'static,
{
    tokio::spawn(async move {
        debug!("» Listening on topic {}", topic);
        let mut backoff = RESUBSCRIBE_BACKOFF;

        loop {
            let mut delivered = false;
            while let Some(payload) = subscription.next().await {
                delivered = true;
                match std::panic::catch_unwind(AssertUnwindSafe(|| handler(&payload))) {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => error!("Error handling message on {}: {}", topic, e),
                    Err(_) => error!("Handler for {} panicked, message dropped", topic),
                }
            }

            // A stream that ends without delivering keeps growing the pause.
            if delivered {
                backoff = RESUBSCRIBE_BACKOFF;
            }
            warn!("⚠ Subscription on {} closed, resubscribing", topic);

            subscription = loop {
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(MAX_RESUBSCRIBE_BACKOFF);

                match broadcaster.subscribe(&topic).await {
                    Ok(subscription) => {
                        info!("✓ Resubscribed to topic {}", topic);
                        break subscription;
                    }
                    Err(e) => error!(
                        "Failed to resubscribe to {}, retrying in {:?}: {}",
                        topic, backoff, e
                    ),
                }
            };
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use futures::stream;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_ttl_status_from_redis_reply() {
        assert_eq!(TtlStatus::from_redis_reply(-2), TtlStatus::Missing);
        assert_eq!(TtlStatus::from_redis_reply(-1), TtlStatus::Persistent);
        assert_eq!(
            TtlStatus::from_redis_reply(30),
            TtlStatus::Expires(Duration::from_secs(30))
        );
        assert_eq!(TtlStatus::Persistent.as_duration(), None);
    }

    #[test]
    fn test_effective_ttl() {
        assert_eq!(effective_ttl(None), None);
        assert_eq!(effective_ttl(Some(Duration::ZERO)), None);
        assert_eq!(
            effective_ttl(Some(Duration::from_secs(5))),
            Some(Duration::from_secs(5))
        );
    }

    /// Broadcaster handing out one scripted batch per subscribe call, then
    /// a stream that never yields.
    #[derive(Clone, Default)]
    struct ScriptedBus {
        batches: Arc<Mutex<VecDeque<Vec<Vec<u8>>>>>,
        subscribes: Arc<AtomicUsize>,
        failures_left: Arc<AtomicUsize>,
    }

    impl Broadcaster for ScriptedBus {
        async fn publish(&self, _topic: &str, _payload: Vec<u8>) -> Result<()> {
            Ok(())
        }

        async fn subscribe(&self, _topic: &str) -> Result<Subscription> {
            self.subscribes.fetch_add(1, Ordering::SeqCst);
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(Error::StoreUnavailable("connection refused".to_string()));
            }
            match self.batches.lock().unwrap().pop_front() {
                Some(batch) => Ok(stream::iter(batch).boxed()),
                None => Ok(stream::pending().boxed()),
            }
        }
    }

    async fn wait_for(counter: &AtomicUsize, expected: usize) {
        tokio::time::timeout(Duration::from_secs(120), async {
            while counter.load(Ordering::SeqCst) < expected {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("listener did not handle every payload");
    }

    #[tokio::test(start_paused = true)]
    async fn test_listener_survives_failing_handler() {
        let seen = Arc::new(AtomicUsize::new(0));
        let payloads: Vec<Vec<u8>> = vec![b"ok".to_vec(), b"err".to_vec(), b"panic".to_vec(), b"ok".to_vec()];
        let subscription: Subscription = stream::iter(payloads).boxed();

        let counter = seen.clone();
        let handle = listen(ScriptedBus::default(), "test".to_string(), subscription, move |payload| {
            counter.fetch_add(1, Ordering::SeqCst);
            match payload {
                b"err" => Err(Error::DecodeFailure("bad payload".to_string())),
                b"panic" => panic!("handler bug"),
                _ => Ok(()),
            }
        });

        wait_for(&seen, 4).await;
        assert!(!handle.is_finished());
        handle.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_listener_resubscribes_when_stream_ends() {
        let bus = ScriptedBus::default();
        bus.batches.lock().unwrap().push_back(vec![b"second".to_vec()]);
        bus.failures_left.store(2, Ordering::SeqCst);

        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let first: Subscription = stream::iter(vec![b"first".to_vec()]).boxed();
        let handle = listen(bus.clone(), "ready".to_string(), first, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        wait_for(&seen, 2).await;
        // Two refused attempts, then the one that delivered "second".
        assert!(bus.subscribes.load(Ordering::SeqCst) >= 3);
        assert!(!handle.is_finished());
        handle.abort();
    }
}
