//! In-memory store for tests and single-process use.

use super::{effective_ttl, Broadcaster, KeyStore, ScanPage, Subscription, TtlStatus};
use crate::error::{Error, Result};
use crate::key::glob_match;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::StreamExt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;

/// Per-topic channel capacity. Slow subscribers past this lag and lose messages,
/// which matches best-effort pub/sub delivery.
const TOPIC_CAPACITY: usize = 1024;

#[derive(Clone, Debug)]
struct StoredValue {
    data: Vec<u8>,
    expires_at: Option<Instant>,
    /// Stable insertion order, used as the scan cursor.
    seq: u64,
}

impl StoredValue {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

#[derive(Default)]
struct Inner {
    entries: DashMap<String, StoredValue>,
    topics: DashMap<String, broadcast::Sender<Vec<u8>>>,
    next_seq: AtomicU64,
    offline: AtomicBool,
}

/// In-memory key store and broadcaster.
///
/// Clones share the same data, so handing one clone to each
/// `CoalesceCacheManager` simulates a fleet of processes talking to one
/// store. Expiry uses `tokio::time`, so paused-clock tests can advance TTLs.
///
/// # Example
///
/// ```
/// # use coalesce_kit::backend::{InMemoryStore, KeyStore};
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> coalesce_kit::Result<()> {
/// let store = InMemoryStore::new();
/// store.set("cache:user:42", b"Jane".to_vec(), None).await?;
/// assert_eq!(store.get("cache:user:42").await?, Some(b"Jane".to_vec()));
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Default)]
pub struct InMemoryStore {
    inner: Arc<Inner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate connectivity loss: every operation fails with
    /// `Error::StoreUnavailable` until switched back.
    pub fn set_offline(&self, offline: bool) {
        self.inner.offline.store(offline, Ordering::SeqCst);
        if offline {
            warn!("⚠ In-memory store switched offline");
        }
    }

    /// Number of live keys.
    pub async fn len(&self) -> usize {
        let now = Instant::now();
        self.inner
            .entries
            .iter()
            .filter(|e| e.value().is_live(now))
            .count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Remove every key.
    pub async fn clear_all(&self) {
        self.inner.entries.clear();
        warn!("⚠ In-memory store cleared");
    }

    fn check_online(&self) -> Result<()> {
        if self.inner.offline.load(Ordering::SeqCst) {
            return Err(Error::StoreUnavailable(
                "in-memory store is offline".to_string(),
            ));
        }
        Ok(())
    }

    fn next_seq(&self) -> u64 {
        self.inner.next_seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn expiry(ttl: Option<Duration>) -> Option<Instant> {
        effective_ttl(ttl).map(|d| Instant::now() + d)
    }

    /// Drop `key` if it has expired.
    fn purge_expired(&self, key: &str) {
        let now = Instant::now();
        self.inner.entries.remove_if(key, |_, v| !v.is_live(now));
    }

    fn live_value(&self, key: &str) -> Option<StoredValue> {
        let now = Instant::now();
        let value = self.inner.entries.get(key).map(|v| v.value().clone());
        match value {
            Some(v) if v.is_live(now) => Some(v),
            Some(_) => {
                self.purge_expired(key);
                None
            }
            None => None,
        }
    }
}

impl KeyStore for InMemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.check_online()?;
        Ok(self.live_value(key).map(|v| v.data))
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
        self.check_online()?;
        let now = Instant::now();
        let expires_at = Self::expiry(ttl);

        match self.inner.entries.entry(key.to_string()) {
            Entry::Occupied(mut slot) => {
                let seq = if slot.get().is_live(now) {
                    slot.get().seq
                } else {
                    self.next_seq()
                };
                slot.insert(StoredValue {
                    data: value,
                    expires_at,
                    seq,
                });
            }
            Entry::Vacant(slot) => {
                slot.insert(StoredValue {
                    data: value,
                    expires_at,
                    seq: self.next_seq(),
                });
            }
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.check_online()?;
        let now = Instant::now();
        Ok(self
            .inner
            .entries
            .remove(key)
            .is_some_and(|(_, v)| v.is_live(now)))
    }

    async fn delete_many(&self, keys: &[String]) -> Result<u64> {
        self.check_online()?;
        let now = Instant::now();
        let removed = keys
            .iter()
            .filter(|k| {
                self.inner
                    .entries
                    .remove(k.as_str())
                    .is_some_and(|(_, v)| v.is_live(now))
            })
            .count();
        Ok(removed as u64)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.check_online()?;
        Ok(self.live_value(key).is_some())
    }

    async fn set_if_absent(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<bool> {
        self.check_online()?;
        let now = Instant::now();
        let expires_at = Self::expiry(Some(ttl));

        match self.inner.entries.entry(key.to_string()) {
            Entry::Occupied(mut slot) => {
                if slot.get().is_live(now) {
                    return Ok(false);
                }
                slot.insert(StoredValue {
                    data: value,
                    expires_at,
                    seq: self.next_seq(),
                });
                Ok(true)
            }
            Entry::Vacant(slot) => {
                slot.insert(StoredValue {
                    data: value,
                    expires_at,
                    seq: self.next_seq(),
                });
                Ok(true)
            }
        }
    }

    async fn scan_page(&self, pattern: &str, cursor: u64, count: usize) -> Result<ScanPage> {
        self.check_online()?;
        let now = Instant::now();

        let mut matches: Vec<(u64, String)> = self
            .inner
            .entries
            .iter()
            .filter(|e| {
                let v = e.value();
                v.seq >= cursor && v.is_live(now) && glob_match(pattern, e.key())
            })
            .map(|e| (e.value().seq, e.key().clone()))
            .collect();
        matches.sort_unstable_by_key(|(seq, _)| *seq);

        let count = count.max(1);
        let next_cursor = if matches.len() > count {
            matches[count].0
        } else {
            0
        };
        matches.truncate(count);

        Ok(ScanPage {
            cursor: next_cursor,
            keys: matches.into_iter().map(|(_, k)| k).collect(),
        })
    }

    async fn ttl(&self, key: &str) -> Result<TtlStatus> {
        self.check_online()?;
        let now = Instant::now();
        Ok(match self.live_value(key) {
            None => TtlStatus::Missing,
            Some(StoredValue {
                expires_at: None, ..
            }) => TtlStatus::Persistent,
            Some(StoredValue {
                expires_at: Some(at),
                ..
            }) => TtlStatus::Expires(at.saturating_duration_since(now)),
        })
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        self.check_online()?;
        self.purge_expired(key);

        if ttl.is_zero() {
            return Ok(self.inner.entries.remove(key).is_some());
        }

        match self.inner.entries.get_mut(key) {
            Some(mut v) => {
                v.expires_at = Some(Instant::now() + ttl);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(!self.inner.offline.load(Ordering::SeqCst))
    }
}

impl Broadcaster for InMemoryStore {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        self.check_online()?;
        let sender = self.inner.topics.get(topic).map(|s| s.value().clone());
        match sender {
            Some(tx) => {
                let receivers = tx.send(payload).unwrap_or(0);
                debug!("✓ PUBLISH {} -> {} receivers", topic, receivers);
            }
            None => debug!("PUBLISH {} -> no subscribers", topic),
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription> {
        self.check_online()?;
        let rx = self
            .inner
            .topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .subscribe();

        let topic = topic.to_string();
        let stream = futures::stream::unfold(rx, move |mut rx| {
            let topic = topic.clone();
            async move {
                loop {
                    match rx.recv().await {
                        Ok(payload) => return Some((payload, rx)),
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            warn!("Subscriber on {} lagged, {} messages lost", topic, missed);
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        });
        Ok(stream.boxed())
    }
}
