//! Error types for coalesce-kit.

use std::fmt;
use std::time::Duration;

/// Boxed error type carried by loader failures.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Crate-wide error type.
#[derive(Debug)]
pub enum Error {
    /// The shared store or its pub/sub transport could not be reached, or a
    /// command against it failed. Never retried internally.
    StoreUnavailable(String),

    /// The loader itself failed.
    ///
    /// The lock winner receives its loader's own error as `source`. Waiters
    /// receive a [`RemoteLoaderError`] rebuilt from the broadcast message.
    LoaderFailure { key: String, source: BoxError },

    /// A waiter exceeded its bound without receiving a result and the final
    /// cache re-check also missed.
    CoalesceTimeout {
        key: String,
        waited: Duration,
        cause: String,
    },

    /// Payload could not be decoded.
    DecodeFailure(String),

    /// Value could not be encoded.
    SerializationError(String),

    /// Envelope header is missing or corrupted.
    InvalidCacheEntry(String),

    /// Envelope was written by an incompatible schema version.
    VersionMismatch { expected: u32, found: u32 },

    /// Caller input rejected.
    ValidationError(String),

    /// Invalid configuration.
    ConfigError(String),

    /// The spawned load task was cancelled by the runtime.
    Cancelled(String),
}

impl Error {
    /// `true` if this caller could not learn the outcome in time.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::CoalesceTimeout { .. })
    }

    /// `true` if the computation itself failed.
    pub fn is_loader_failure(&self) -> bool {
        matches!(self, Error::LoaderFailure { .. })
    }

    pub fn is_store_unavailable(&self) -> bool {
        matches!(self, Error::StoreUnavailable(_))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::StoreUnavailable(msg) => write!(f, "Store unavailable: {msg}"),
            Error::LoaderFailure { key, source } => {
                write!(f, "Loader failed for key {key}: {source}")
            }
            Error::CoalesceTimeout { key, waited, cause } => write!(
                f,
                "Failed to get coalesced result for key {key} after {waited:?}: {cause}"
            ),
            Error::DecodeFailure(msg) => write!(f, "Decode failure: {msg}"),
            Error::SerializationError(msg) => write!(f, "Serialization error: {msg}"),
            Error::InvalidCacheEntry(msg) => write!(f, "Invalid cache entry: {msg}"),
            Error::VersionMismatch { expected, found } => write!(
                f,
                "Cache schema version mismatch: expected {expected}, found {found}"
            ),
            Error::ValidationError(msg) => write!(f, "Validation error: {msg}"),
            Error::ConfigError(msg) => write!(f, "Configuration error: {msg}"),
            Error::Cancelled(msg) => write!(f, "Cancelled: {msg}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::LoaderFailure { source, .. } => Some(source.as_ref()),
            _ => None,
        }
    }
}

/// Loader error as seen by a waiter: the message published by the process
/// that ran the loader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteLoaderError(pub String);

impl fmt::Display for RemoteLoaderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for RemoteLoaderError {}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_timeout_is_distinct_from_loader_failure() {
        let timeout = Error::CoalesceTimeout {
            key: "user:42".to_string(),
            waited: Duration::from_secs(30),
            cause: "deadline elapsed".to_string(),
        };
        let failed = Error::LoaderFailure {
            key: "user:42".to_string(),
            source: Box::new(RemoteLoaderError("db down".to_string())),
        };

        assert!(timeout.is_timeout());
        assert!(!timeout.is_loader_failure());
        assert!(failed.is_loader_failure());
        assert!(!failed.is_timeout());
    }

    #[test]
    fn test_loader_failure_exposes_source() {
        let failed = Error::LoaderFailure {
            key: "k".to_string(),
            source: "boom".into(),
        };
        assert_eq!(failed.source().map(|s| s.to_string()), Some("boom".into()));
        assert_eq!(failed.to_string(), "Loader failed for key k: boom");
    }
}
