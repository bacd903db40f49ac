//! Cache keying and confidence-weighted expiry.

use chrono::{DateTime, Duration, Utc};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};

use crate::config::CachePolicy;
use crate::models::JobType;

/// Retention for a result of the given confidence.
///
/// Monotonic non-decreasing in confidence. NaN and negative values fall in the
/// lowest band.
pub fn ttl_for(confidence: f64, policy: &CachePolicy) -> Duration {
    let c = if confidence.is_nan() { 0.0 } else { confidence };
    let secs = if c >= policy.high_confidence {
        policy.ttl_high_secs
    } else if c >= policy.medium_confidence {
        policy.ttl_medium_secs
    } else if c >= policy.low_confidence {
        policy.ttl_low_secs
    } else {
        policy.ttl_dedup_secs
    };
    Duration::seconds(secs as i64)
}

/// Expiry anchored to creation time.
pub fn expires_at(created_at: DateTime<Utc>, confidence: f64, policy: &CachePolicy) -> DateTime<Utc> {
    created_at + ttl_for(confidence, policy)
}

/// Clamp a processor-reported confidence into `[0, 1]`.
pub fn normalize_confidence(confidence: f64) -> f64 {
    if confidence.is_nan() {
        0.0
    } else {
        confidence.clamp(0.0, 1.0)
    }
}

/// Content fingerprint of document bytes: `blake3:<hex>`.
pub fn content_fingerprint(bytes: &[u8]) -> String {
    format!("blake3:{}", blake3::hash(bytes).to_hex())
}

/// Recursively sort object keys so equal parameters hash equally.
pub fn canonical_json(value: &JsonValue) -> JsonValue {
    match value {
        JsonValue::Object(map) => {
            let mut entries: Vec<(&String, &JsonValue)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            JsonValue::Object(
                entries
                    .into_iter()
                    .map(|(k, v)| (k.clone(), canonical_json(v)))
                    .collect(),
            )
        }
        JsonValue::Array(items) => JsonValue::Array(items.iter().map(canonical_json).collect()),
        other => other.clone(),
    }
}

/// Cache key: hex SHA-256 over fingerprint, job type and canonical parameters.
pub fn cache_key(fingerprint: &str, job_type: JobType, parameters: Option<&JsonValue>) -> String {
    let params = parameters
        .map(|p| canonical_json(p).to_string())
        .unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(fingerprint.as_bytes());
    hasher.update([0u8]);
    hasher.update(job_type.as_str().as_bytes());
    hasher.update([0u8]);
    hasher.update(params.as_bytes());
    hex::encode(hasher.finalize())
}
