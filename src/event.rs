//! Broadcast payloads.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Outcome delivered to local waiters: the encoded `Option<T>` on success, or
/// the loader's error message.
pub type Outcome = std::result::Result<Vec<u8>, String>;

/// Result of one load attempt, published on the result topic.
///
/// Exactly one is published per attempt, success or failure. Never stored.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CoalescedResponse {
    pub request_id: String,
    pub coalescing_key: String,
    /// Encoded `Option<T>`. `None` when the loader failed.
    pub result: Option<Vec<u8>>,
    pub error: Option<String>,
    pub completed_at: DateTime<Utc>,
}

impl CoalescedResponse {
    pub fn success(key: &str, encoded: Vec<u8>) -> Self {
        Self::new(key, Some(encoded), None)
    }

    pub fn failure(key: &str, error: String) -> Self {
        Self::new(key, None, Some(error))
    }

    fn new(key: &str, result: Option<Vec<u8>>, error: Option<String>) -> Self {
        CoalescedResponse {
            request_id: Uuid::new_v4().to_string(),
            coalescing_key: key.to_string(),
            result,
            error,
            completed_at: Utc::now(),
        }
    }

    /// An error wins over a result.
    pub fn into_outcome(self) -> Outcome {
        match (self.error, self.result) {
            (Some(error), _) => Err(error),
            (None, Some(bytes)) => Ok(bytes),
            (None, None) => Err(format!(
                "empty coalesced response for key {}",
                self.coalescing_key
            )),
        }
    }
}

/// Announcement that a cache entry was deleted, one per key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvictionEvent {
    /// Full store key, e.g. `cache:users:1`.
    pub key: String,
    pub timestamp: DateTime<Utc>,
}

impl EvictionEvent {
    pub fn new(key: &str) -> Self {
        EvictionEvent {
            key: key.to_string(),
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serialization::{Codec, EnvelopeCodec};

    #[test]
    fn test_outcome_prefers_error() {
        let mut response = CoalescedResponse::success("k", vec![1, 2]);
        response.error = Some("boom".to_string());
        assert_eq!(response.into_outcome(), Err("boom".to_string()));

        let ok = CoalescedResponse::success("k", vec![1, 2]);
        assert_eq!(ok.into_outcome(), Ok(vec![1, 2]));
    }

    #[test]
    fn test_empty_response_is_an_error() {
        let mut response = CoalescedResponse::failure("k", "x".to_string());
        response.error = None;
        assert!(response.into_outcome().is_err());
    }

    #[test]
    fn test_each_response_gets_its_own_request_id() {
        let a = CoalescedResponse::success("k", vec![]);
        let b = CoalescedResponse::success("k", vec![]);
        assert_ne!(a.request_id, b.request_id);
    }

    #[test]
    fn test_response_survives_envelope_codec() {
        let response = CoalescedResponse::failure("user:42", "db down".to_string());
        let bytes = EnvelopeCodec.encode(&response).unwrap();
        let decoded: CoalescedResponse = EnvelopeCodec.decode(&bytes).unwrap();
        assert_eq!(decoded, response);
    }
}
