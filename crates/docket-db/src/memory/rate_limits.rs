use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use docket_core::{
    changes, rate_window, RateDecision, RateLimit, RateLimitRepository, RateLimitWindow, Result,
    WindowKey,
};

use super::{lock, MemoryAuditLog};

/// Counter windows keyed by `(actor_key, endpoint, window_secs)`. The map lock
/// linearizes increments for every key.
pub struct MemoryRateLimitRepository {
    windows: Mutex<HashMap<WindowKey, RateLimitWindow>>,
    audit: Arc<MemoryAuditLog>,
}

impl MemoryRateLimitRepository {
    pub fn new(audit: Arc<MemoryAuditLog>) -> Self {
        Self {
            windows: Mutex::new(HashMap::new()),
            audit,
        }
    }
}

#[async_trait]
impl RateLimitRepository for MemoryRateLimitRepository {
    async fn check_and_increment(
        &self,
        key: &WindowKey,
        limit: &RateLimit,
        tenant_id: &str,
        actor_id: &str,
        now: DateTime<Utc>,
    ) -> Result<RateDecision> {
        let mut windows = lock(&self.windows);
        let existing = windows.get(key);
        let outcome = rate_window::evaluate(existing, key, limit, now);
        if outcome.newly_blocked {
            let event = changes::rate_limit_blocked(existing, &outcome.window, tenant_id, actor_id);
            self.audit.record(event, now)?;
        }
        windows.insert(key.clone(), outcome.window);
        Ok(outcome.decision)
    }

    async fn get(&self, key: &WindowKey) -> Result<Option<RateLimitWindow>> {
        Ok(lock(&self.windows).get(key).cloned())
    }

    async fn purge_idle(&self, idle_before: DateTime<Utc>, now: DateTime<Utc>) -> Result<u64> {
        let mut windows = lock(&self.windows);
        let before = windows.len();
        windows.retain(|_, w| w.updated_at >= idle_before || w.is_blocked(now));
        Ok((before - windows.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn limit(max: u32) -> RateLimit {
        RateLimit {
            max_requests: max,
            window_secs: 60,
            block_secs: 120,
            penalty: None,
        }
    }

    #[tokio::test]
    async fn test_block_is_audited_once() {
        let audit = Arc::new(MemoryAuditLog::new());
        let repo = MemoryRateLimitRepository::new(audit.clone());
        let key = WindowKey::actor("acme", "alice", "POST /jobs", 60);
        let now = Utc::now();

        for _ in 0..3 {
            let d = repo
                .check_and_increment(&key, &limit(3), "acme", "alice", now)
                .await
                .unwrap();
            assert!(d.is_allowed());
        }
        let denied = repo
            .check_and_increment(&key, &limit(3), "acme", "alice", now)
            .await
            .unwrap();
        assert_eq!(denied, RateDecision::Deny { retry_after_secs: 120 });
        repo.check_and_increment(&key, &limit(3), "acme", "alice", now)
            .await
            .unwrap();

        assert_eq!(audit.len(), 1);
        assert_eq!(audit.events()[0].action.as_str(), "blocked");
    }

    #[tokio::test]
    async fn test_purge_keeps_blocked_windows() {
        let audit = Arc::new(MemoryAuditLog::new());
        let repo = MemoryRateLimitRepository::new(audit);
        let now = Utc::now();
        let idle = WindowKey::actor("acme", "bob", "GET /jobs", 60);
        let blocked = WindowKey::actor("acme", "eve", "GET /jobs", 60);
        repo.check_and_increment(&idle, &limit(5), "acme", "bob", now)
            .await
            .unwrap();
        for _ in 0..2 {
            repo.check_and_increment(&blocked, &limit(1), "acme", "eve", now)
                .await
                .unwrap();
        }

        let later = now + Duration::seconds(90);
        let purged = repo.purge_idle(later - Duration::seconds(30), later).await.unwrap();
        assert_eq!(purged, 1);
        assert!(repo.get(&idle).await.unwrap().is_none());
        assert!(repo.get(&blocked).await.unwrap().is_some());
    }
}
