//! Storage traits.
//!
//! Every shared store sits behind one of these traits so services can run
//! against the in-process backend in tests and PostgreSQL in production.
//! Methods take `now` explicitly; services own the clock.
//!
//! Mutating methods that change entity state append their audit event inside
//! the same critical section as the mutation. If the audit append fails, the
//! mutation is not applied and `Error::AuditWrite` is returned.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::config::SchedulerPolicy;
use crate::error::Result;
use crate::models::*;
use crate::scheduling::LeasePolicy;

// =============================================================================
// JOB LEDGER
// =============================================================================

/// Durable job ledger.
#[async_trait]
pub trait JobRepository: Send + Sync {
    /// Insert a QUEUED job. With `new.dedupe`, an existing non-terminal job
    /// for the same tenant, type and document is returned instead
    /// (`deduplicated = true`).
    async fn insert(&self, new: NewJob, now: DateTime<Utc>) -> Result<(Job, bool)>;

    /// Atomically select and lease the next job for `caps`.
    async fn lease_next(
        &self,
        caps: &WorkerCapabilities,
        policy: &LeasePolicy,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>>;

    /// Extend the lease held by `worker_id`.
    async fn heartbeat(
        &self,
        job_id: Uuid,
        worker_id: &str,
        lease_duration: Duration,
        now: DateTime<Utc>,
    ) -> Result<HeartbeatAck>;

    async fn report_progress(
        &self,
        job_id: Uuid,
        worker_id: &str,
        percent: i32,
        step: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<()>;

    async fn complete(
        &self,
        job_id: Uuid,
        worker_id: &str,
        result_ref: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Job>;

    async fn fail(
        &self,
        job_id: Uuid,
        worker_id: &str,
        error: &str,
        retryable: bool,
        policy: &SchedulerPolicy,
        now: DateTime<Utc>,
    ) -> Result<Job>;

    /// Cancel a job owned by `tenant_id`.
    async fn cancel(
        &self,
        tenant_id: &str,
        job_id: Uuid,
        actor_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(CancelOutcome, Job)>;

    /// Requeue or fail every RUNNING job whose lease deadline has passed.
    async fn reclaim_expired(&self, now: DateTime<Utc>) -> Result<Vec<Job>>;

    async fn get(&self, job_id: Uuid) -> Result<Option<Job>>;

    async fn list(
        &self,
        tenant_id: &str,
        filter: &JobFilter,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Job>>;

    async fn stats(&self, tenant_id: Option<&str>, now: DateTime<Utc>) -> Result<QueueStats>;

    /// Flag terminal, unarchived jobs finished before `cutoff` as archived.
    async fn archive_idle(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
        now: DateTime<Utc>,
    ) -> Result<Vec<Job>>;
}

// =============================================================================
// AUDIT LOG
// =============================================================================

/// Append-only audit log.
#[async_trait]
pub trait AuditRepository: Send + Sync {
    /// Durably append one event and return it with its sequence number.
    async fn append(&self, event: NewAuditEvent, now: DateTime<Utc>) -> Result<AuditEvent>;

    async fn query(&self, query: &AuditQuery) -> Result<AuditPage>;

    /// Events after sequence `after_seq` that occurred at or after `since`,
    /// ordered by sequence.
    async fn scan(&self, since: DateTime<Utc>, after_seq: i64, limit: i64)
        -> Result<Vec<AuditEvent>>;

    /// Delete events older than `cutoff`. The only deletion path.
    async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}

// =============================================================================
// RATE LIMITING
// =============================================================================

/// Linearized counter windows.
#[async_trait]
pub trait RateLimitRepository: Send + Sync {
    /// Evaluate and record one request against `key`. A transition into a
    /// block is audited atomically with the window update.
    async fn check_and_increment(
        &self,
        key: &WindowKey,
        limit: &RateLimit,
        tenant_id: &str,
        actor_id: &str,
        now: DateTime<Utc>,
    ) -> Result<RateDecision>;

    async fn get(&self, key: &WindowKey) -> Result<Option<RateLimitWindow>>;

    /// Delete unblocked windows not touched since `idle_before`.
    async fn purge_idle(&self, idle_before: DateTime<Utc>, now: DateTime<Utc>) -> Result<u64>;
}

// =============================================================================
// CACHE
// =============================================================================

/// Tenant-scoped cache store.
#[async_trait]
pub trait CacheRepository: Send + Sync {
    /// Live entry for `(tenant_id, key)`, recording the hit. Expired entries
    /// are misses. `expires_at` is never changed.
    async fn get(&self, tenant_id: &str, key: &str, now: DateTime<Utc>)
        -> Result<Option<CacheEntry>>;

    /// Store a new entry, replacing any previous entry for the key.
    async fn put(&self, entry: NewCacheEntry) -> Result<CacheEntry>;

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64>;
}

// =============================================================================
// ALERTS
// =============================================================================

/// Security and operational alerts.
#[async_trait]
pub trait AlertRepository: Send + Sync {
    /// Merge a candidate into an active alert of the same type, tenant and
    /// actor whose last occurrence lies within the candidate's window, or
    /// create a new OPEN alert.
    async fn upsert_candidate(
        &self,
        candidate: &AlertCandidate,
        actor_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(SecurityAlert, UpsertOutcome)>;

    /// Move an alert along the one-way review lattice.
    async fn transition(
        &self,
        alert_id: Uuid,
        update: &AlertStatusUpdate,
        actor_id: &str,
        now: DateTime<Utc>,
    ) -> Result<SecurityAlert>;

    async fn get(&self, alert_id: Uuid) -> Result<Option<SecurityAlert>>;

    /// Matching alerts newest first, plus the total match count.
    async fn list(&self, filter: &AlertFilter) -> Result<(Vec<SecurityAlert>, i64)>;
}

// =============================================================================
// TENANTS
// =============================================================================

/// Tenant registry store.
#[async_trait]
pub trait TenantRepository: Send + Sync {
    async fn get(&self, tenant_id: &str) -> Result<Option<Tenant>>;

    async fn list(&self) -> Result<Vec<Tenant>>;

    /// Create or update a tenant (administrative, audited).
    async fn upsert(
        &self,
        tenant_id: &str,
        request: &UpsertTenantRequest,
        actor_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Tenant>;
}

// =============================================================================
// SESSIONS
// =============================================================================

/// Front-door sessions.
#[async_trait]
pub trait SessionRepository: Send + Sync {
    async fn create(
        &self,
        tenant_id: &str,
        actor_id: &str,
        origin: Option<&str>,
        device: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Session>;

    /// Refresh `last_seen_at` for a session owned by `tenant_id`.
    async fn touch(&self, tenant_id: &str, session_id: Uuid, now: DateTime<Utc>)
        -> Result<Session>;

    async fn get(&self, session_id: Uuid) -> Result<Option<Session>>;

    /// Delete sessions idle since `idle_before` or created before
    /// `created_before`.
    async fn purge_stale(
        &self,
        idle_before: DateTime<Utc>,
        created_before: DateTime<Utc>,
    ) -> Result<u64>;
}

// =============================================================================
// LEADER LOCK
// =============================================================================

/// Named, time-bounded leadership for singleton background tasks.
#[async_trait]
pub trait LeaderLock: Send + Sync {
    /// Acquire or renew `name` for `holder` until `now + ttl`. Returns false
    /// when another holder's lease is still live.
    async fn try_acquire(
        &self,
        name: &str,
        holder: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    async fn release(&self, name: &str, holder: &str) -> Result<()>;
}
