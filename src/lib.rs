//! # coalesce-kit
//!
//! Fleet-wide single-flight caching over a Redis-compatible store.
//!
//! When many tasks across many processes miss on the same key at the same
//! moment, exactly one of them runs the expensive loader. The rest wait for
//! its result, delivered over pub/sub, or read it from the cache.
//!
//! ## Features
//!
//! - **Single-flight across processes:** a short-lived `lock:<key>` entry
//!   (`SET NX`, 30s) elects one loader per key
//! - **Result broadcast:** the winner publishes success or failure, so waiters
//!   see the loader's error instead of re-running it
//! - **Self-healing:** a crashed loader's lock expires on its own
//! - **Eviction propagation:** every deletion is announced to the fleet
//! - **Backend agnostic:** `KeyStore` and `Broadcaster` traits, with Redis and
//!   in-memory implementations
//!
//! ## Quick Start
//!
//! ```ignore
//! use coalesce_kit::{backend::RedisStore, CoalesceCacheManager};
//! use std::time::Duration;
//!
//! let store = RedisStore::from_url("redis://localhost:6379".to_string()).await?;
//! let manager = CoalesceCacheManager::new(store.clone(), store);
//! manager.start().await?;
//!
//! let user: Option<User> = manager
//!     .get_or_load(
//!         "user:42",
//!         move || async move { repo.find_user(42).await },
//!         Some(Duration::from_secs(300)),
//!         false,
//!     )
//!     .await?;
//! ```

#[macro_use]
extern crate log;

pub mod backend;
pub mod builder;
pub mod coalesce;
pub mod config;
pub mod error;
pub mod event;
pub mod eviction;
pub mod key;
pub mod observability;
pub mod serialization;
pub mod service;

// Re-exports for convenience
pub use backend::{Broadcaster, KeyStore, TtlStatus};
pub use builder::CoalesceOperationBuilder;
pub use coalesce::{CoalesceCacheManager, LockAttempt};
pub use config::{CoalesceConfig, LOCK_TTL};
pub use error::{Error, Result};
pub use event::{CoalescedResponse, EvictionEvent};
pub use eviction::EvictionPropagator;
pub use observability::{CacheStats, CoalesceMetrics};
pub use serialization::{Codec, EnvelopeCodec, JsonCodec};
pub use service::{CacheResult, CacheService};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
