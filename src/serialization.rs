//! Codecs for cached values and broadcast payloads.
//!
//! The store only ever sees bytes. Everything written under `cache:<key>` and
//! everything published on a topic goes through a [`Codec`]:
//!
//! - [`EnvelopeCodec`] (default): postcard payload behind a versioned header
//! - [`JsonCodec`]: plain JSON, for fleets with non-Rust participants
//!
//! # Envelope format
//!
//! ```text
//! [MAGIC: 4 bytes] [VERSION: 4 bytes LE] [POSTCARD PAYLOAD]
//! ```

use crate::error::{Error, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Envelope magic.
pub const CACHE_MAGIC: [u8; 4] = *b"COAL";

/// Bump when the layout of cached values or broadcast payloads changes.
pub const CURRENT_SCHEMA_VERSION: u32 = 1;

const HEADER_LEN: usize = 8;

/// Value codec shared by every process in the fleet.
///
/// Decode failures are ordinary errors; callers on subscription paths log and
/// drop them.
pub trait Codec: Clone + Send + Sync + 'static {
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>>;

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T>;
}

/// Postcard with a magic/version envelope.
#[derive(Clone, Copy, Debug, Default)]
pub struct EnvelopeCodec;

impl Codec for EnvelopeCodec {
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        let payload = postcard::to_allocvec(value)
            .map_err(|e| Error::SerializationError(e.to_string()))?;

        let mut bytes = Vec::with_capacity(HEADER_LEN + payload.len());
        bytes.extend_from_slice(&CACHE_MAGIC);
        bytes.extend_from_slice(&CURRENT_SCHEMA_VERSION.to_le_bytes());
        bytes.extend_from_slice(&payload);
        Ok(bytes)
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        if bytes.len() < HEADER_LEN {
            return Err(Error::InvalidCacheEntry(format!(
                "entry too short: {} bytes",
                bytes.len()
            )));
        }

        let (header, payload) = bytes.split_at(HEADER_LEN);
        if header[..4] != CACHE_MAGIC {
            return Err(Error::InvalidCacheEntry("bad magic header".to_string()));
        }

        let mut version = [0u8; 4];
        version.copy_from_slice(&header[4..8]);
        let found = u32::from_le_bytes(version);
        if found != CURRENT_SCHEMA_VERSION {
            return Err(Error::VersionMismatch {
                expected: CURRENT_SCHEMA_VERSION,
                found,
            });
        }

        postcard::from_bytes(payload).map_err(|e| Error::DecodeFailure(e.to_string()))
    }
}

/// Plain JSON.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        serde_json::to_vec(value).map_err(|e| Error::SerializationError(e.to_string()))
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        serde_json::from_slice(bytes).map_err(|e| Error::DecodeFailure(e.to_string()))
    }
}
