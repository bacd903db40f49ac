//! Lease selection and retry backoff.
//!
//! Pure functions over ledger snapshots. Storage backends call
//! [`select_next`] inside their lease critical section so the decision and
//! the claim are atomic.

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Duration, Utc};

use crate::config::SchedulerPolicy;
use crate::defaults;
use crate::models::{Job, TenantLoad, WorkerCapabilities};

/// Inputs to a single lease decision.
#[derive(Debug, Clone)]
pub struct LeasePolicy {
    /// Max concurrent leases per tenant while other tenants are waiting.
    pub fairness_cap: u32,
    /// Per-tenant `max_concurrent_jobs` quotas.
    pub tenant_limits: HashMap<String, u32>,
    /// Quota for tenants missing from `tenant_limits`.
    pub default_tenant_limit: u32,
    pub lease_duration: Duration,
}

impl LeasePolicy {
    pub fn from_scheduler(policy: &SchedulerPolicy, tenant_limits: HashMap<String, u32>) -> Self {
        Self {
            fairness_cap: fairness_cap(policy.total_workers),
            tenant_limits,
            default_tenant_limit: defaults::TENANT_MAX_CONCURRENT_JOBS,
            lease_duration: policy.lease_duration(),
        }
    }

    pub fn tenant_limit(&self, tenant_id: &str) -> u32 {
        self.tenant_limits
            .get(tenant_id)
            .copied()
            .unwrap_or(self.default_tenant_limit)
    }
}

/// `ceil(total_workers / 2)`, at least 1.
pub fn fairness_cap(total_workers: usize) -> u32 {
    total_workers.div_ceil(2).max(1) as u32
}

/// Dispatch order: priority descending, then creation time, then id.
pub fn dispatch_order(a: &Job, b: &Job) -> Ordering {
    b.priority
        .cmp(&a.priority)
        .then(a.created_at.cmp(&b.created_at))
        .then(a.id.cmp(&b.id))
}

/// Pick the job `caps` should run next, if any.
///
/// A job is eligible when it is QUEUED or RETRYING, its backoff has elapsed,
/// no cancellation is pending, the worker can run it, and its tenant is below
/// its concurrency quota. When eligible work spans more than one tenant, a
/// tenant already holding `fairness_cap` leases is passed over.
pub fn select_next<'a>(
    candidates: impl IntoIterator<Item = &'a Job>,
    caps: &WorkerCapabilities,
    load: &TenantLoad,
    policy: &LeasePolicy,
    now: DateTime<Utc>,
) -> Option<&'a Job> {
    let running = |tenant: &str| load.get(tenant).copied().unwrap_or(0);

    let mut eligible: Vec<&Job> = candidates
        .into_iter()
        .filter(|j| j.status.is_runnable())
        .filter(|j| j.available_at <= now && !j.cancel_requested && !j.archived)
        .filter(|j| caps.fits(&j.resources) && caps.accepts(j.job_type))
        .filter(|j| running(&j.tenant_id) < policy.tenant_limit(&j.tenant_id))
        .collect();

    if eligible.is_empty() {
        return None;
    }

    let tenants: BTreeSet<&str> = eligible.iter().map(|j| j.tenant_id.as_str()).collect();
    let contended = tenants.len() > 1;

    eligible.sort_by(|a, b| dispatch_order(a, b));
    eligible
        .into_iter()
        .find(|j| !contended || running(&j.tenant_id) < policy.fairness_cap)
}

/// Tenants whose running count has reached their concurrency quota. Storage
/// backends that prefilter candidates exclude these before ranking.
pub fn saturated_tenants(load: &TenantLoad, policy: &LeasePolicy) -> Vec<String> {
    let mut saturated: Vec<String> = load
        .iter()
        .filter(|(tenant, running)| **running >= policy.tenant_limit(tenant))
        .map(|(tenant, _)| tenant.clone())
        .collect();
    saturated.sort();
    saturated
}

/// Retry delay: `base × 2^retry_count`, capped at `max_ms`.
///
/// `retry_count` is the count before the failing attempt is recorded, so the
/// first retry waits `base`.
pub fn backoff_delay(retry_count: i32, base_ms: u64, max_ms: u64) -> Duration {
    let exp = retry_count.clamp(0, 32) as u32;
    let delay = 2u64
        .checked_pow(exp)
        .and_then(|factor| base_ms.checked_mul(factor))
        .unwrap_or(max_ms)
        .min(max_ms);
    Duration::milliseconds(delay as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{JobStatus, JobType, NewJob, ResourceRequirements};
    use uuid::Uuid;

    fn job(tenant: &str, priority: i32, created_offset_secs: i64, now: DateTime<Utc>) -> Job {
        Job::from_new(
            Uuid::now_v7(),
            NewJob {
                tenant_id: tenant.into(),
                actor_id: "u".into(),
                job_type: JobType::TextExtraction,
                document_ref: "doc".into(),
                priority,
                resources: ResourceRequirements::default(),
                parameters: None,
                max_retries: 3,
                dedupe: false,
            },
            now + Duration::seconds(created_offset_secs),
        )
    }

    fn policy(cap: u32) -> LeasePolicy {
        LeasePolicy {
            fairness_cap: cap,
            tenant_limits: HashMap::new(),
            default_tenant_limit: 100,
            lease_duration: Duration::seconds(30),
        }
    }

    fn caps() -> WorkerCapabilities {
        WorkerCapabilities::new("w1", 4096, false)
    }

    #[test]
    fn test_fairness_cap_rounds_up() {
        assert_eq!(fairness_cap(0), 1);
        assert_eq!(fairness_cap(1), 1);
        assert_eq!(fairness_cap(4), 2);
        assert_eq!(fairness_cap(5), 3);
    }

    #[test]
    fn test_highest_priority_first() {
        let now = Utc::now();
        let jobs = vec![job("a", 5, -10, now), job("a", 8, -5, now)];
        let picked = select_next(&jobs, &caps(), &TenantLoad::new(), &policy(2), now).unwrap();
        assert_eq!(picked.priority, 8);
    }

    #[test]
    fn test_fifo_within_priority() {
        let now = Utc::now();
        let jobs = vec![job("a", 5, -1, now), job("a", 5, -10, now)];
        let picked = select_next(&jobs, &caps(), &TenantLoad::new(), &policy(2), now).unwrap();
        assert_eq!(picked.id, jobs[1].id);
    }

    #[test]
    fn test_backoff_not_elapsed_is_skipped() {
        let now = Utc::now();
        let mut j = job("a", 5, -10, now);
        j.status = JobStatus::Retrying;
        j.available_at = now + Duration::seconds(5);
        let jobs = vec![j];
        assert!(select_next(&jobs, &caps(), &TenantLoad::new(), &policy(2), now).is_none());
    }

    #[test]
    fn test_resource_mismatch_is_skipped() {
        let now = Utc::now();
        let mut j = job("a", 9, -10, now);
        j.resources.exclusive_accelerator = true;
        let other = job("a", 1, -10, now);
        let jobs = vec![j, other];
        let picked = select_next(&jobs, &caps(), &TenantLoad::new(), &policy(2), now).unwrap();
        assert_eq!(picked.priority, 1);
    }

    #[test]
    fn test_fairness_cap_applies_under_contention() {
        let now = Utc::now();
        let jobs = vec![job("a", 9, -10, now), job("b", 1, -10, now)];
        let mut load = TenantLoad::new();
        load.insert("a".into(), 2);
        let picked = select_next(&jobs, &caps(), &load, &policy(2), now).unwrap();
        assert_eq!(picked.tenant_id, "b");
    }

    #[test]
    fn test_fairness_cap_ignored_without_contention() {
        let now = Utc::now();
        let jobs = vec![job("a", 9, -10, now)];
        let mut load = TenantLoad::new();
        load.insert("a".into(), 3);
        let picked = select_next(&jobs, &caps(), &load, &policy(2), now).unwrap();
        assert_eq!(picked.tenant_id, "a");
    }

    #[test]
    fn test_tenant_quota_is_hard_limit() {
        let now = Utc::now();
        let jobs = vec![job("a", 9, -10, now)];
        let mut load = TenantLoad::new();
        load.insert("a".into(), 1);
        let mut p = policy(4);
        p.tenant_limits.insert("a".into(), 1);
        assert!(select_next(&jobs, &caps(), &load, &p, now).is_none());
    }

    #[test]
    fn test_saturated_tenants_lists_only_those_at_quota() {
        let mut load = TenantLoad::new();
        load.insert("a".into(), 4);
        load.insert("b".into(), 1);
        load.insert("c".into(), 7);
        let mut p = policy(2);
        p.tenant_limits.insert("a".into(), 4);
        p.tenant_limits.insert("b".into(), 4);
        p.default_tenant_limit = 5;
        assert_eq!(saturated_tenants(&load, &p), vec!["a".to_string(), "c".to_string()]);
    }

    #[test]
    fn test_deep_backlog_at_quota_does_not_block_other_tenant() {
        let now = Utc::now();
        let mut jobs: Vec<Job> = (0..300).map(|i| job("a", 9, -300 + i, now)).collect();
        jobs.push(job("b", 1, 0, now));
        let mut load = TenantLoad::new();
        load.insert("a".into(), 4);
        let mut p = policy(2);
        p.tenant_limits.insert("a".into(), 4);

        let saturated = saturated_tenants(&load, &p);
        let candidates: Vec<&Job> = jobs
            .iter()
            .filter(|j| !saturated.contains(&j.tenant_id))
            .collect();
        let picked = select_next(candidates, &caps(), &load, &p, now).unwrap();
        assert_eq!(picked.tenant_id, "b");
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        assert_eq!(backoff_delay(0, 1000, 60_000), Duration::milliseconds(1000));
        assert_eq!(backoff_delay(1, 1000, 60_000), Duration::milliseconds(2000));
        assert_eq!(backoff_delay(3, 1000, 60_000), Duration::milliseconds(8000));
        assert_eq!(backoff_delay(20, 1000, 60_000), Duration::milliseconds(60_000));
        assert_eq!(backoff_delay(100, 1000, 60_000), Duration::milliseconds(60_000));
    }
}
