//! Adaptive cache models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// A cached processing result.
///
/// Entries are immutable once written: a recomputation stores a new entry
/// under the same key rather than mutating the old one. Only `hit_count` and
/// `last_hit_at` move on lookup, and `expires_at` is never extended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub tenant_id: String,
    /// Hex SHA-256 over fingerprint, job type and canonical parameters.
    pub key: String,
    pub payload: JsonValue,
    /// Result quality estimate in `[0.0, 1.0]`.
    pub confidence: f64,
    pub hit_count: i64,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub last_hit_at: Option<DateTime<Utc>>,
}

impl CacheEntry {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Input for storing a cache entry; the repository stamps times.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewCacheEntry {
    pub tenant_id: String,
    pub key: String,
    pub payload: JsonValue,
    pub confidence: f64,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl NewCacheEntry {
    pub fn into_entry(self) -> CacheEntry {
        CacheEntry {
            tenant_id: self.tenant_id,
            key: self.key,
            payload: self.payload,
            confidence: self.confidence,
            hit_count: 0,
            created_at: self.created_at,
            expires_at: self.expires_at,
            last_hit_at: None,
        }
    }
}
