//! Shared application state.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter as Governor,
};

use docket_audit::{AlertService, AuditRecorder, ConfigAdmin};
use docket_core::{ConfigHandle, EventBus, SessionRepository, SharedClock};
use docket_db::Database;
use docket_jobs::{RateLimiter, Scheduler, TenantRegistry};

use crate::identity::Caller;

/// Process-wide limiter in front of the router (direct quota, not keyed).
pub type GlobalRateLimiter = Governor<NotKeyed, InMemoryState, DefaultClock>;

/// Build the process-wide limiter. `None` when either value is zero.
pub fn global_limiter(requests: u32, period: Duration) -> Option<Arc<GlobalRateLimiter>> {
    let burst = NonZeroU32::new(requests)?;
    let quota = Quota::with_period(period)?.allow_burst(burst);
    Some(Arc::new(Governor::direct(quota)))
}

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub scheduler: Arc<Scheduler>,
    pub limiter: Arc<RateLimiter>,
    pub tenants: Arc<TenantRegistry>,
    pub recorder: AuditRecorder,
    pub alerts: AlertService,
    pub admin: Arc<ConfigAdmin>,
    pub sessions: Arc<dyn SessionRepository>,
    pub events: EventBus,
    pub clock: SharedClock,
    /// Global rate limiter (None if disabled).
    pub global_limiter: Option<Arc<GlobalRateLimiter>>,
}

impl AppState {
    /// Wire every service over one store and one config handle.
    pub fn new(db: &Database, config: ConfigHandle, events: EventBus, clock: SharedClock) -> Self {
        let tenants = Arc::new(TenantRegistry::new(db.tenants.clone(), clock.clone()));
        let limiter = Arc::new(RateLimiter::new(
            db.rate_limits.clone(),
            tenants.clone(),
            config.clone(),
            clock.clone(),
        ));
        let scheduler = Arc::new(Scheduler::new(
            db.jobs.clone(),
            tenants.clone(),
            limiter.clone(),
            config.clone(),
            events.clone(),
            clock.clone(),
        ));
        let recorder = AuditRecorder::new(db.audit.clone(), clock.clone());
        let alerts = AlertService::new(db.alerts.clone(), events.clone(), clock.clone());
        let admin = Arc::new(ConfigAdmin::new(config, recorder.clone(), events.clone()));
        Self {
            scheduler,
            limiter,
            tenants,
            recorder,
            alerts,
            admin,
            sessions: db.sessions.clone(),
            events,
            clock,
            global_limiter: None,
        }
    }

    pub fn with_global_limiter(mut self, limiter: Option<Arc<GlobalRateLimiter>>) -> Self {
        self.global_limiter = limiter;
        self
    }

    /// Count one request against the caller's per-actor and tenant windows.
    pub async fn admit(&self, caller: &Caller, endpoint: &str) -> docket_core::Result<u32> {
        self.limiter
            .admit(
                &caller.tenant_id,
                &caller.actor_id,
                caller.role.as_deref(),
                endpoint,
            )
            .await
    }
}
