//! Process-local table of callers waiting on another loader.

use crate::event::Outcome;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

/// Waiters keyed by logical cache key.
///
/// Every local waiter gets its own single-assignment slot, so several tasks
/// waiting on the same key are all resolved by one broadcast.
#[derive(Default)]
pub struct PendingTable {
    waiters: DashMap<String, Vec<(u64, oneshot::Sender<Outcome>)>>,
    next_id: AtomicU64,
}

/// How a wait ended.
#[derive(Debug, PartialEq)]
pub enum WaitOutcome {
    Resolved(Outcome),
    TimedOut,
    /// The slot was dropped without a value.
    Abandoned,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a waiter for `key`. The slot is removed when the returned
    /// handle is dropped.
    pub fn register(self: &Arc<Self>, key: &str) -> PendingWaiter {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.waiters
            .entry(key.to_string())
            .or_default()
            .push((id, tx));

        PendingWaiter {
            table: Arc::clone(self),
            key: key.to_string(),
            id,
            rx,
        }
    }

    /// Complete every waiter registered for `key`.
    ///
    /// Returns how many were resolved; `0` is normal when this process has no
    /// waiter for the key.
    pub fn resolve(&self, key: &str, outcome: Outcome) -> usize {
        let Some((_, slots)) = self.waiters.remove(key) else {
            return 0;
        };

        slots
            .into_iter()
            .filter_map(|(_, tx)| tx.send(outcome.clone()).ok())
            .count()
    }

    /// Number of waiters currently registered for `key`.
    pub fn waiters_for(&self, key: &str) -> usize {
        self.waiters.get(key).map_or(0, |slots| slots.len())
    }

    /// Number of keys with at least one waiter.
    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }

    fn remove_waiter(&self, key: &str, id: u64) {
        if let Some(mut slots) = self.waiters.get_mut(key) {
            slots.retain(|(slot_id, _)| *slot_id != id);
        }
        self.waiters.remove_if(key, |_, slots| slots.is_empty());
    }
}

/// One registered waiter.
pub struct PendingWaiter {
    table: Arc<PendingTable>,
    key: String,
    id: u64,
    rx: oneshot::Receiver<Outcome>,
}

impl PendingWaiter {
    /// Block until resolved or until `bound` elapses.
    pub async fn wait(&mut self, bound: Duration) -> WaitOutcome {
        match tokio::time::timeout(bound, &mut self.rx).await {
            Ok(Ok(outcome)) => WaitOutcome::Resolved(outcome),
            Ok(Err(_)) => WaitOutcome::Abandoned,
            Err(_) => WaitOutcome::TimedOut,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for PendingWaiter {
    fn drop(&mut self) {
        self.table.remove_waiter(&self.key, self.id);
    }
}
