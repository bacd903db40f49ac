//! Adaptive result cache.
//!
//! Entries are tenant-scoped and immutable; expiry is fixed at creation from
//! the result's confidence band. The cache is a best-effort fast path: store
//! errors are logged and swallowed, and hit/store audit events go through a
//! bounded channel to a background writer so they never block a lookup.
//!
//! Concurrent computations of one cold key are collapsed in-process: the
//! first caller claims the key, later callers wait a bounded time for its
//! entry and then compute on their own.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use serde_json::{json, Value as JsonValue};
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use docket_core::{
    action, cache_policy, defaults, entity, AuditAction, AuditCategory, AuditRepository,
    CacheEntry, CacheRepository, ConfigHandle, NewAuditEvent, NewCacheEntry, Result, SharedClock,
};

type InflightKey = (String, String);
type AuditItem = (NewAuditEvent, DateTime<Utc>);

/// Result of [`AdaptiveCache::get_or_compute`].
#[derive(Debug, Clone, PartialEq)]
pub struct CacheOutcome {
    pub payload: JsonValue,
    pub confidence: f64,
    /// Served from a stored entry.
    pub hit: bool,
}

pub struct AdaptiveCache {
    repo: Arc<dyn CacheRepository>,
    config: ConfigHandle,
    clock: SharedClock,
    audit_tx: mpsc::Sender<AuditItem>,
    inflight: Mutex<HashMap<InflightKey, watch::Receiver<bool>>>,
    inflight_wait: StdDuration,
}

/// Releases a claimed key when the leader finishes, fails or is dropped.
struct InflightGuard<'a> {
    cache: &'a AdaptiveCache,
    key: InflightKey,
    done: watch::Sender<bool>,
}

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        self.cache
            .inflight
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&self.key);
        let _ = self.done.send(true);
    }
}

enum Claim<'a> {
    Leader(InflightGuard<'a>),
    Follower(watch::Receiver<bool>),
}

impl AdaptiveCache {
    /// Must be called inside a Tokio runtime; spawns the audit writer.
    pub fn new(
        repo: Arc<dyn CacheRepository>,
        audit: Arc<dyn AuditRepository>,
        config: ConfigHandle,
        clock: SharedClock,
    ) -> Self {
        let (audit_tx, mut audit_rx) = mpsc::channel::<AuditItem>(defaults::CACHE_AUDIT_BUFFER);
        tokio::spawn(async move {
            while let Some((event, at)) = audit_rx.recv().await {
                if let Err(e) = audit.append(event, at).await {
                    warn!(
                        subsystem = "cache",
                        error = %e,
                        "Dropped cache audit event after write failure"
                    );
                }
            }
        });
        Self {
            repo,
            config,
            clock,
            audit_tx,
            inflight: Mutex::new(HashMap::new()),
            inflight_wait: StdDuration::from_millis(defaults::CACHE_INFLIGHT_WAIT_MS),
        }
    }

    /// Override how long followers wait for an in-flight computation.
    pub fn with_inflight_wait(mut self, wait: StdDuration) -> Self {
        self.inflight_wait = wait;
        self
    }

    fn audit(&self, event: NewAuditEvent, at: DateTime<Utc>) {
        if self.audit_tx.try_send((event, at)).is_err() {
            warn!(subsystem = "cache", "Cache audit buffer full, event dropped");
        }
    }

    /// Live entry for `key`, or `None` on a miss or store error.
    pub async fn lookup(&self, tenant_id: &str, actor_id: &str, key: &str) -> Option<CacheEntry> {
        let now = self.clock.now();
        match self.repo.get(tenant_id, key, now).await {
            Ok(Some(entry)) => {
                debug!(subsystem = "cache", tenant_id, key, hits = entry.hit_count, "Cache hit");
                self.audit(
                    NewAuditEvent::new(
                        tenant_id,
                        actor_id,
                        entity::CACHE_ENTRY,
                        key,
                        AuditAction::custom(action::CACHE_HIT),
                        AuditCategory::Cache,
                    )
                    .with_metadata(json!({
                        "hit_count": entry.hit_count,
                        "confidence": entry.confidence,
                    })),
                    now,
                );
                Some(entry)
            }
            Ok(None) => None,
            Err(e) => {
                warn!(subsystem = "cache", tenant_id, key, error = %e, "Cache lookup failed");
                None
            }
        }
    }

    /// Store a new immutable entry. Returns `None` if the write failed.
    pub async fn store(
        &self,
        tenant_id: &str,
        actor_id: &str,
        key: &str,
        payload: JsonValue,
        confidence: f64,
    ) -> Option<CacheEntry> {
        let now = self.clock.now();
        let snapshot = self.config.current();
        let confidence = cache_policy::normalize_confidence(confidence);
        let new = NewCacheEntry {
            tenant_id: tenant_id.to_string(),
            key: key.to_string(),
            payload,
            confidence,
            created_at: now,
            expires_at: cache_policy::expires_at(now, confidence, &snapshot.cache),
        };
        match self.repo.put(new).await {
            Ok(entry) => {
                self.audit(
                    NewAuditEvent::new(
                        tenant_id,
                        actor_id,
                        entity::CACHE_ENTRY,
                        key,
                        AuditAction::Create,
                        AuditCategory::Cache,
                    )
                    .with_after(json!({
                        "key": entry.key,
                        "confidence": entry.confidence,
                        "expires_at": entry.expires_at,
                    })),
                    now,
                );
                Some(entry)
            }
            Err(e) => {
                warn!(subsystem = "cache", tenant_id, key, error = %e, "Cache store failed, continuing");
                None
            }
        }
    }

    fn claim(&self, tenant_id: &str, key: &str) -> Claim<'_> {
        let id = (tenant_id.to_string(), key.to_string());
        let mut inflight = self.inflight.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(rx) = inflight.get(&id) {
            return Claim::Follower(rx.clone());
        }
        let (done, rx) = watch::channel(false);
        inflight.insert(id.clone(), rx);
        Claim::Leader(InflightGuard {
            cache: self,
            key: id,
            done,
        })
    }

    /// Serve `key` from the cache or compute and store it. `compute` returns
    /// the payload and its confidence.
    pub async fn get_or_compute<F, Fut>(
        &self,
        tenant_id: &str,
        actor_id: &str,
        key: &str,
        compute: F,
    ) -> Result<CacheOutcome>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(JsonValue, f64)>>,
    {
        if let Some(entry) = self.lookup(tenant_id, actor_id, key).await {
            return Ok(hit(entry));
        }

        let _guard = match self.claim(tenant_id, key) {
            Claim::Leader(guard) => Some(guard),
            Claim::Follower(mut rx) => {
                let timed_out = tokio::time::timeout(self.inflight_wait, rx.wait_for(|done| *done))
                    .await
                    .is_err();
                if timed_out {
                    debug!(subsystem = "cache", key, "In-flight wait elapsed, computing independently");
                }
                if let Some(entry) = self.lookup(tenant_id, actor_id, key).await {
                    return Ok(hit(entry));
                }
                None
            }
        };

        let (payload, confidence) = compute().await?;
        let confidence = cache_policy::normalize_confidence(confidence);
        self.store(tenant_id, actor_id, key, payload.clone(), confidence)
            .await;
        Ok(CacheOutcome {
            payload,
            confidence,
            hit: false,
        })
    }
}

fn hit(entry: CacheEntry) -> CacheOutcome {
    CacheOutcome {
        payload: entry.payload,
        confidence: entry.confidence,
        hit: true,
    }
}
