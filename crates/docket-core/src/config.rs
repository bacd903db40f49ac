//! Versioned runtime configuration.
//!
//! Rate-limit policies, cache confidence bands, retention windows, scheduler
//! knobs and detector thresholds live in a [`ConfigSnapshot`]. Components hold
//! a [`ConfigHandle`] and read `current()` once per operation, so a concurrent
//! administrative update is observed atomically: either the whole old
//! snapshot or the whole new one.
//!
//! Process-level settings are read from the environment by
//! [`ConfigSnapshot::from_env`]:
//!
//! | Variable | Default |
//! |----------|---------|
//! | `WORKER_COUNT` | `4` |
//! | `JOB_LEASE_SECS` | `30` |
//! | `JOB_MAX_RETRIES` | `3` |
//! | `JOB_BACKOFF_BASE_MS` | `1000` |
//! | `JOB_BACKOFF_MAX_MS` | `300000` |
//! | `RATE_LIMIT_REQUESTS` | `100` |
//! | `RATE_LIMIT_WINDOW_SECS` | `60` |
//! | `RATE_LIMIT_BLOCK_SECS` | `60` |

use std::sync::{Arc, RwLock};

use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::defaults;
use crate::error::{Error, Result};
use crate::models::{ProgressivePenalty, RateLimit, RateLimitPolicy};

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

/// Lease, retry and fairness settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerPolicy {
    pub lease_secs: u64,
    pub max_retries: i32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Worker slots across the pool; the fairness cap is half of this.
    pub total_workers: usize,
}

impl Default for SchedulerPolicy {
    fn default() -> Self {
        Self {
            lease_secs: defaults::JOB_LEASE_SECS,
            max_retries: defaults::JOB_MAX_RETRIES,
            backoff_base_ms: defaults::JOB_BACKOFF_BASE_MS,
            backoff_max_ms: defaults::JOB_BACKOFF_MAX_MS,
            total_workers: defaults::WORKER_COUNT,
        }
    }
}

impl SchedulerPolicy {
    pub fn lease_duration(&self) -> Duration {
        Duration::seconds(self.lease_secs as i64)
    }
}

/// Confidence bands that drive cache retention.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachePolicy {
    pub high_confidence: f64,
    pub medium_confidence: f64,
    pub low_confidence: f64,
    pub ttl_high_secs: u64,
    pub ttl_medium_secs: u64,
    pub ttl_low_secs: u64,
    /// Below `low_confidence`: a dedup window rather than a cache.
    pub ttl_dedup_secs: u64,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            high_confidence: 0.9,
            medium_confidence: 0.8,
            low_confidence: 0.7,
            ttl_high_secs: defaults::CACHE_TTL_HIGH_SECS,
            ttl_medium_secs: defaults::CACHE_TTL_MEDIUM_SECS,
            ttl_low_secs: defaults::CACHE_TTL_LOW_SECS,
            ttl_dedup_secs: defaults::CACHE_TTL_DEDUP_SECS,
        }
    }
}

impl CachePolicy {
    /// Bands must be descending and TTLs non-increasing, otherwise expiry
    /// would not be monotonic in confidence.
    pub fn validate(&self) -> Result<()> {
        let thresholds_ok = self.high_confidence >= self.medium_confidence
            && self.medium_confidence >= self.low_confidence
            && (0.0..=1.0).contains(&self.low_confidence)
            && (0.0..=1.0).contains(&self.high_confidence);
        let ttls_ok = self.ttl_high_secs >= self.ttl_medium_secs
            && self.ttl_medium_secs >= self.ttl_low_secs
            && self.ttl_low_secs >= self.ttl_dedup_secs;
        if thresholds_ok && ttls_ok {
            Ok(())
        } else {
            Err(Error::InvalidInput(
                "cache bands must be descending with non-increasing TTLs".to_string(),
            ))
        }
    }
}

/// Retention windows applied by the sweeper.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    pub audit_days: i64,
    pub rate_window_ttl_secs: i64,
    pub session_idle_secs: i64,
    pub session_absolute_secs: i64,
    pub archive_days: i64,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            audit_days: defaults::RETENTION_AUDIT_DAYS,
            rate_window_ttl_secs: defaults::RETENTION_RATE_WINDOW_TTL_SECS,
            session_idle_secs: defaults::RETENTION_SESSION_IDLE_SECS,
            session_absolute_secs: defaults::RETENTION_SESSION_ABSOLUTE_SECS,
            archive_days: defaults::RETENTION_ARCHIVE_DAYS,
        }
    }
}

impl RetentionPolicy {
    pub fn validate(&self) -> Result<()> {
        let all_positive = [
            self.audit_days,
            self.rate_window_ttl_secs,
            self.session_idle_secs,
            self.session_absolute_secs,
            self.archive_days,
        ]
        .iter()
        .all(|v| *v > 0);
        if all_positive {
            Ok(())
        } else {
            Err(Error::InvalidInput(
                "retention windows must be positive".to_string(),
            ))
        }
    }
}

/// Anomaly detector thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectorPolicy {
    pub brute_force_threshold: usize,
    pub brute_force_window_secs: i64,
    pub origin_threshold: usize,
    pub origin_window_secs: i64,
    pub failure_rate_threshold: f64,
    pub failure_rate_min_samples: usize,
    pub failure_rate_window_secs: i64,
}

impl Default for DetectorPolicy {
    fn default() -> Self {
        Self {
            brute_force_threshold: defaults::DETECT_BRUTE_FORCE_THRESHOLD,
            brute_force_window_secs: defaults::DETECT_BRUTE_FORCE_WINDOW_SECS,
            origin_threshold: defaults::DETECT_ORIGIN_THRESHOLD,
            origin_window_secs: defaults::DETECT_ORIGIN_WINDOW_SECS,
            failure_rate_threshold: defaults::DETECT_FAILURE_RATE_THRESHOLD,
            failure_rate_min_samples: defaults::DETECT_FAILURE_RATE_MIN_SAMPLES,
            failure_rate_window_secs: defaults::DETECT_FAILURE_RATE_WINDOW_SECS,
        }
    }
}

impl DetectorPolicy {
    /// Longest trailing window any rule inspects.
    pub fn max_window_secs(&self) -> i64 {
        self.brute_force_window_secs
            .max(self.origin_window_secs)
            .max(self.failure_rate_window_secs)
    }
}

/// Immutable, versioned configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigSnapshot {
    pub version: i64,
    pub scheduler: SchedulerPolicy,
    pub cache: CachePolicy,
    pub rate_limits: Vec<RateLimitPolicy>,
    pub retention: RetentionPolicy,
    pub detector: DetectorPolicy,
}

impl Default for ConfigSnapshot {
    fn default() -> Self {
        Self {
            version: 1,
            scheduler: SchedulerPolicy::default(),
            cache: CachePolicy::default(),
            rate_limits: vec![RateLimitPolicy::global_default()],
            retention: RetentionPolicy::default(),
            detector: DetectorPolicy::default(),
        }
    }
}

impl ConfigSnapshot {
    /// Build the initial snapshot from environment variables.
    pub fn from_env() -> Self {
        let scheduler = SchedulerPolicy {
            lease_secs: env_or("JOB_LEASE_SECS", defaults::JOB_LEASE_SECS).max(1),
            max_retries: env_or("JOB_MAX_RETRIES", defaults::JOB_MAX_RETRIES).max(0),
            backoff_base_ms: env_or("JOB_BACKOFF_BASE_MS", defaults::JOB_BACKOFF_BASE_MS),
            backoff_max_ms: env_or("JOB_BACKOFF_MAX_MS", defaults::JOB_BACKOFF_MAX_MS),
            total_workers: env_or("WORKER_COUNT", defaults::WORKER_COUNT).max(1),
        };

        let limit = RateLimit {
            max_requests: env_or("RATE_LIMIT_REQUESTS", defaults::RATE_LIMIT_REQUESTS),
            window_secs: env_or("RATE_LIMIT_WINDOW_SECS", defaults::RATE_LIMIT_WINDOW_SECS),
            block_secs: env_or("RATE_LIMIT_BLOCK_SECS", defaults::RATE_LIMIT_BLOCK_SECS),
            penalty: Some(ProgressivePenalty::default()),
        };

        Self {
            scheduler,
            rate_limits: vec![RateLimitPolicy {
                limit,
                ..RateLimitPolicy::global_default()
            }],
            ..Self::default()
        }
    }
}

/// Shared handle to the current snapshot.
#[derive(Debug, Clone)]
pub struct ConfigHandle {
    inner: Arc<RwLock<Arc<ConfigSnapshot>>>,
}

impl ConfigHandle {
    pub fn new(snapshot: ConfigSnapshot) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(snapshot))),
        }
    }

    /// The snapshot in force right now.
    pub fn current(&self) -> Arc<ConfigSnapshot> {
        self.inner
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// Apply `f` to a copy of the current snapshot and install it with the
    /// next version. Returns `(previous, installed)`.
    pub fn update<F>(&self, f: F) -> Result<(Arc<ConfigSnapshot>, Arc<ConfigSnapshot>)>
    where
        F: FnOnce(&mut ConfigSnapshot) -> Result<()>,
    {
        let mut guard = self.inner.write().unwrap_or_else(|p| p.into_inner());
        let previous = guard.clone();
        let mut next = (*previous).clone();
        f(&mut next)?;
        next.version = previous.version + 1;
        let next = Arc::new(next);
        *guard = next.clone();
        Ok((previous, next))
    }

    /// Reinstall a snapshot (used to roll back when the audit write fails).
    pub fn restore(&self, snapshot: Arc<ConfigSnapshot>) {
        let mut guard = self.inner.write().unwrap_or_else(|p| p.into_inner());
        *guard = snapshot;
    }
}

impl Default for ConfigHandle {
    fn default() -> Self {
        Self::new(ConfigSnapshot::default())
    }
}
