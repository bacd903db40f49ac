//! Rate limiter.
//!
//! Every request is counted against up to three windows, in order:
//!
//! 1. the `(actor, endpoint)` window of the most specific matching
//!    [`RateLimitPolicy`](docket_core::RateLimitPolicy),
//! 2. the tenant's per-minute quota window,
//! 3. the tenant's per-hour quota window.
//!
//! The first denial wins. Windows already incremented by this request keep
//! their count. A quota of zero disables that quota window.

use std::sync::Arc;

use tracing::{debug, warn};

use docket_core::{
    select_policy, ConfigHandle, Error, RateDecision, RateLimit, RateLimitRepository, Result,
    SharedClock, WindowKey,
};

use crate::tenants::TenantRegistry;

/// Endpoint name for job submission.
pub const ENDPOINT_SUBMIT: &str = "jobs.submit";

pub struct RateLimiter {
    repo: Arc<dyn RateLimitRepository>,
    tenants: Arc<TenantRegistry>,
    config: ConfigHandle,
    clock: SharedClock,
}

/// Quota windows have no progressive penalty and block until the window ends.
fn quota_limit(max_requests: u32, window_secs: u64) -> RateLimit {
    RateLimit {
        max_requests,
        window_secs,
        block_secs: 0,
        penalty: None,
    }
}

impl RateLimiter {
    pub fn new(
        repo: Arc<dyn RateLimitRepository>,
        tenants: Arc<TenantRegistry>,
        config: ConfigHandle,
        clock: SharedClock,
    ) -> Self {
        Self {
            repo,
            tenants,
            config,
            clock,
        }
    }

    /// Count one request and decide whether it is admitted.
    pub async fn check(
        &self,
        tenant_id: &str,
        actor_id: &str,
        role: Option<&str>,
        endpoint: &str,
    ) -> Result<RateDecision> {
        let tenant = self.tenants.get(tenant_id).await?;
        let snapshot = self.config.current();
        let now = self.clock.now();

        let mut windows: Vec<(WindowKey, RateLimit)> = Vec::with_capacity(3);
        if let Some(policy) = select_policy(&snapshot.rate_limits, tenant_id, role, endpoint) {
            debug!(
                subsystem = "ratelimit",
                policy = %policy.name,
                endpoint,
                "Selected rate-limit policy"
            );
            windows.push((
                WindowKey::actor(tenant_id, actor_id, endpoint, policy.limit.window_secs),
                policy.limit,
            ));
        }
        for (max, secs) in [
            (tenant.quota.max_requests_per_minute, 60),
            (tenant.quota.max_requests_per_hour, 3_600),
        ] {
            if max > 0 {
                windows.push((WindowKey::tenant(tenant_id, secs), quota_limit(max, secs)));
            }
        }

        let mut remaining = u32::MAX;
        for (key, limit) in &windows {
            match self
                .repo
                .check_and_increment(key, limit, tenant_id, actor_id, now)
                .await?
            {
                RateDecision::Allow { remaining: r } => remaining = remaining.min(r),
                deny @ RateDecision::Deny { .. } => return Ok(deny),
            }
        }
        Ok(RateDecision::Allow { remaining })
    }

    /// [`check`](Self::check), mapping a denial to `Error::RateLimited`.
    pub async fn admit(
        &self,
        tenant_id: &str,
        actor_id: &str,
        role: Option<&str>,
        endpoint: &str,
    ) -> Result<u32> {
        match self.check(tenant_id, actor_id, role, endpoint).await? {
            RateDecision::Allow { remaining } => Ok(remaining),
            RateDecision::Deny { retry_after_secs } => {
                warn!(
                    subsystem = "ratelimit",
                    tenant_id,
                    actor_id,
                    endpoint,
                    retry_after_secs,
                    "Request denied by rate limiter"
                );
                Err(Error::RateLimited {
                    retry_after_secs,
                    reason: endpoint.to_string(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use docket_core::{
        AuditCategory, Clock, ConfigSnapshot, ManualClock, RateLimitPolicy, TenantQuota,
        UpsertTenantRequest,
    };
    use docket_db::memory::MemoryAuditLog;
    use docket_db::Database;

    struct Fixture {
        log: Arc<MemoryAuditLog>,
        clock: Arc<ManualClock>,
        limiter: RateLimiter,
    }

    async fn fixture(policies: Vec<RateLimitPolicy>, quota: TenantQuota) -> Fixture {
        let log = Arc::new(MemoryAuditLog::new());
        let db = Database::from_memory(log.clone());
        let clock = Arc::new(ManualClock::starting_now());
        db.tenants
            .upsert(
                "acme",
                &UpsertTenantRequest {
                    name: "Acme".into(),
                    quota,
                    features: Default::default(),
                },
                "admin",
                clock.now(),
            )
            .await
            .unwrap();
        let tenants = Arc::new(TenantRegistry::new(db.tenants.clone(), clock.clone()));
        let config = ConfigHandle::new(ConfigSnapshot {
            rate_limits: policies,
            ..ConfigSnapshot::default()
        });
        let limiter = RateLimiter::new(db.rate_limits.clone(), tenants, config, clock.clone());
        Fixture {
            log,
            clock,
            limiter,
        }
    }

    fn policy(name: &str, role: Option<&str>, max: u32) -> RateLimitPolicy {
        RateLimitPolicy {
            name: name.into(),
            endpoint_pattern: "jobs.*".into(),
            tenant_id: None,
            role: role.map(Into::into),
            limit: RateLimit {
                max_requests: max,
                window_secs: 60,
                block_secs: 120,
                penalty: None,
            },
        }
    }

    #[tokio::test]
    async fn test_block_after_limit_then_release() {
        let f = fixture(vec![policy("base", None, 2)], TenantQuota::default()).await;
        for _ in 0..2 {
            f.limiter
                .admit("acme", "alice", None, ENDPOINT_SUBMIT)
                .await
                .unwrap();
        }
        let err = f
            .limiter
            .admit("acme", "alice", None, ENDPOINT_SUBMIT)
            .await
            .unwrap_err();
        match err {
            Error::RateLimited {
                retry_after_secs, ..
            } => assert_eq!(retry_after_secs, 120),
            other => panic!("unexpected {other:?}"),
        }
        // Other actors are unaffected.
        assert!(f
            .limiter
            .admit("acme", "bob", None, ENDPOINT_SUBMIT)
            .await
            .is_ok());

        f.clock.advance(Duration::seconds(121));
        assert!(f
            .limiter
            .admit("acme", "alice", None, ENDPOINT_SUBMIT)
            .await
            .is_ok());

        let blocks: Vec<_> = f
            .log
            .events()
            .into_iter()
            .filter(|e| e.category == AuditCategory::RateLimit)
            .collect();
        assert_eq!(blocks.len(), 1);
    }

    #[tokio::test]
    async fn test_role_override_gets_higher_ceiling() {
        let f = fixture(
            vec![policy("base", None, 1), policy("elevated", Some("admin"), 5)],
            TenantQuota::default(),
        )
        .await;
        for _ in 0..5 {
            f.limiter
                .admit("acme", "root", Some("admin"), ENDPOINT_SUBMIT)
                .await
                .unwrap();
        }
        f.limiter
            .admit("acme", "alice", None, ENDPOINT_SUBMIT)
            .await
            .unwrap();
        assert!(f
            .limiter
            .admit("acme", "alice", None, ENDPOINT_SUBMIT)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_tenant_minute_quota_spans_actors() {
        let quota = TenantQuota {
            max_requests_per_minute: 3,
            ..TenantQuota::default()
        };
        let f = fixture(vec![], quota).await;
        for actor in ["a", "b", "c"] {
            f.limiter.admit("acme", actor, None, "audit.query").await.unwrap();
        }
        let decision = f.limiter.check("acme", "d", None, "audit.query").await.unwrap();
        assert!(!decision.is_allowed());

        // The block lasts until the minute window ends.
        f.clock.advance(Duration::seconds(60));
        assert!(f
            .limiter
            .check("acme", "d", None, "audit.query")
            .await
            .unwrap()
            .is_allowed());
    }

    #[tokio::test]
    async fn test_unknown_tenant_is_rejected() {
        let f = fixture(vec![], TenantQuota::default()).await;
        assert!(matches!(
            f.limiter.check("ghost", "a", None, "jobs.submit").await,
            Err(Error::TenantNotFound(_))
        ));
    }
}
