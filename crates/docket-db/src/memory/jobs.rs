//! In-process job ledger.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tracing::debug;
use uuid::Uuid;

use docket_core::{
    ledger, new_v7, scheduling::select_next, CancelOutcome, Error, HeartbeatAck, Job, JobFilter,
    JobRepository, JobStatus, LeasePolicy, NewJob, QueueStats, Result, SchedulerPolicy,
    TenantLoad, WorkerCapabilities,
};

use super::{lock, MemoryAuditLog};

/// Job ledger held in a single map. The map lock is the lease critical
/// section, so two workers can never claim the same job.
pub struct MemoryJobRepository {
    jobs: Mutex<HashMap<Uuid, Job>>,
    audit: Arc<MemoryAuditLog>,
}

impl MemoryJobRepository {
    pub fn new(audit: Arc<MemoryAuditLog>) -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            audit,
        }
    }

    /// Apply `f` to a copy of the job, append its audit event, then commit.
    fn mutate<T>(
        &self,
        job_id: Uuid,
        now: DateTime<Utc>,
        f: impl FnOnce(&mut Job) -> Result<(T, Option<docket_core::NewAuditEvent>)>,
    ) -> Result<(T, Job)> {
        let mut jobs = lock(&self.jobs);
        let current = jobs.get(&job_id).ok_or(Error::JobNotFound(job_id))?;
        let mut next = current.clone();
        let (out, event) = f(&mut next)?;
        if let Some(event) = event {
            self.audit.record(event, now)?;
        }
        jobs.insert(job_id, next.clone());
        Ok((out, next))
    }
}

fn running_load(jobs: &HashMap<Uuid, Job>) -> TenantLoad {
    let mut load = TenantLoad::new();
    for job in jobs.values().filter(|j| j.status == JobStatus::Running) {
        *load.entry(job.tenant_id.clone()).or_insert(0) += 1;
    }
    load
}

#[async_trait]
impl JobRepository for MemoryJobRepository {
    async fn insert(&self, new: NewJob, now: DateTime<Utc>) -> Result<(Job, bool)> {
        let mut jobs = lock(&self.jobs);
        if new.dedupe {
            if let Some(existing) = jobs.values().find(|j| j.is_duplicate_of(&new)) {
                return Ok((existing.clone(), true));
            }
        }
        let job = Job::from_new(new_v7(), new, now);
        self.audit.record(ledger::created(&job), now)?;
        jobs.insert(job.id, job.clone());
        Ok((job, false))
    }

    async fn lease_next(
        &self,
        caps: &WorkerCapabilities,
        policy: &LeasePolicy,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>> {
        let mut jobs = lock(&self.jobs);
        let load = running_load(&jobs);
        let Some(id) = select_next(jobs.values(), caps, &load, policy, now).map(|j| j.id) else {
            return Ok(None);
        };
        let Some(current) = jobs.get(&id) else {
            return Ok(None);
        };
        let mut next = current.clone();
        let event = ledger::lease(&mut next, &caps.worker_id, policy.lease_duration, now)?;
        self.audit.record(event, now)?;
        debug!(job_id = %id, worker_id = %caps.worker_id, "Leased job");
        jobs.insert(id, next.clone());
        Ok(Some(next))
    }

    async fn heartbeat(
        &self,
        job_id: Uuid,
        worker_id: &str,
        lease_duration: Duration,
        now: DateTime<Utc>,
    ) -> Result<HeartbeatAck> {
        let (deadline, job) = self.mutate(job_id, now, |job| {
            Ok((ledger::heartbeat(job, worker_id, lease_duration, now)?, None))
        })?;
        Ok(HeartbeatAck {
            lease_expires_at: deadline,
            cancel_requested: job.cancel_requested,
        })
    }

    async fn report_progress(
        &self,
        job_id: Uuid,
        worker_id: &str,
        percent: i32,
        step: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.mutate(job_id, now, |job| {
            Ok(((), Some(ledger::progress(job, worker_id, percent, step)?)))
        })?;
        Ok(())
    }

    async fn complete(
        &self,
        job_id: Uuid,
        worker_id: &str,
        result_ref: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Job> {
        let ((), job) = self.mutate(job_id, now, |job| {
            Ok(((), Some(ledger::complete(job, worker_id, result_ref, now)?)))
        })?;
        Ok(job)
    }

    async fn fail(
        &self,
        job_id: Uuid,
        worker_id: &str,
        error: &str,
        retryable: bool,
        policy: &SchedulerPolicy,
        now: DateTime<Utc>,
    ) -> Result<Job> {
        let ((), job) = self.mutate(job_id, now, |job| {
            let event = ledger::fail(job, worker_id, error, retryable, policy, now)?;
            Ok(((), Some(event)))
        })?;
        Ok(job)
    }

    async fn cancel(
        &self,
        tenant_id: &str,
        job_id: Uuid,
        actor_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(CancelOutcome, Job)> {
        self.mutate(job_id, now, |job| {
            if job.tenant_id != tenant_id {
                return Err(Error::JobNotFound(job_id));
            }
            let (outcome, event) = ledger::cancel(job, actor_id, now)?;
            Ok((outcome, Some(event)))
        })
    }

    async fn reclaim_expired(&self, now: DateTime<Utc>) -> Result<Vec<Job>> {
        let mut jobs = lock(&self.jobs);
        let expired: Vec<Uuid> = jobs
            .values()
            .filter(|j| j.lease_expired(now))
            .map(|j| j.id)
            .collect();

        let mut reclaimed = Vec::with_capacity(expired.len());
        for id in expired {
            let Some(current) = jobs.get(&id) else {
                continue;
            };
            let mut next = current.clone();
            let event = ledger::reclaim(&mut next, now)?;
            self.audit.record(event, now)?;
            jobs.insert(id, next.clone());
            reclaimed.push(next);
        }
        Ok(reclaimed)
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<Job>> {
        Ok(lock(&self.jobs).get(&job_id).cloned())
    }

    async fn list(
        &self,
        tenant_id: &str,
        filter: &JobFilter,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Job>> {
        let jobs = lock(&self.jobs);
        let mut matching: Vec<&Job> = jobs
            .values()
            .filter(|j| j.tenant_id == tenant_id && filter.matches(j))
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(matching
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn stats(&self, tenant_id: Option<&str>, now: DateTime<Utc>) -> Result<QueueStats> {
        let jobs = lock(&self.jobs);
        let hour_ago = now - Duration::hours(1);
        let mut stats = QueueStats::default();
        for job in jobs
            .values()
            .filter(|j| tenant_id.is_none_or(|t| t == j.tenant_id))
        {
            stats.total += 1;
            let recent = job.completed_at.is_some_and(|c| c >= hour_ago);
            match job.status {
                JobStatus::Queued => stats.queued += 1,
                JobStatus::Running => stats.running += 1,
                JobStatus::Retrying => stats.retrying += 1,
                JobStatus::Completed if recent => stats.completed_last_hour += 1,
                JobStatus::Failed if recent => stats.failed_last_hour += 1,
                _ => {}
            }
        }
        Ok(stats)
    }

    async fn archive_idle(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
        now: DateTime<Utc>,
    ) -> Result<Vec<Job>> {
        let mut jobs = lock(&self.jobs);
        let mut idle: Vec<&Job> = jobs
            .values()
            .filter(|j| j.status.is_terminal() && !j.archived)
            .filter(|j| j.completed_at.is_some_and(|c| c < cutoff))
            .collect();
        idle.sort_by_key(|j| j.completed_at);
        let ids: Vec<Uuid> = idle
            .into_iter()
            .take(limit.max(0) as usize)
            .map(|j| j.id)
            .collect();

        let mut archived = Vec::with_capacity(ids.len());
        for id in ids {
            let Some(current) = jobs.get(&id) else {
                continue;
            };
            let mut next = current.clone();
            let event = ledger::archive(&mut next)?;
            self.audit.record(event, now)?;
            jobs.insert(id, next.clone());
            archived.push(next);
        }
        Ok(archived)
    }
}
