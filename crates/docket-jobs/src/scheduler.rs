//! Job ledger service and dispatcher.
//!
//! Admission (validation, tenant features, rate limiting) happens here; the
//! atomic lease claim and every state transition happen in the
//! [`JobRepository`], which appends the matching audit event in the same
//! critical section. Each transition is also published on the [`EventBus`].

use std::sync::Arc;
use std::time::{Duration as StdDuration, Instant};

use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use docket_core::{
    defaults, CancelOutcome, ConfigHandle, Error, EventBus, HeartbeatAck, Job, JobFilter,
    JobRepository, JobStatusView, LeasePolicy, NewJob, QueueStats, Result, ServerEvent,
    SharedClock, SubmitJob, Submission, WorkerCapabilities,
};

use crate::rate_limiter::{RateLimiter, ENDPOINT_SUBMIT};
use crate::tenants::TenantRegistry;

pub struct Scheduler {
    jobs: Arc<dyn JobRepository>,
    tenants: Arc<TenantRegistry>,
    limiter: Arc<RateLimiter>,
    config: ConfigHandle,
    events: EventBus,
    clock: SharedClock,
    // Woken when work may have become leasable.
    wakeup: Notify,
}

fn validate(req: &SubmitJob) -> Result<()> {
    if req.tenant_id.trim().is_empty() || req.actor_id.trim().is_empty() {
        return Err(Error::InvalidInput(
            "tenant_id and actor_id are required".to_string(),
        ));
    }
    if req.document_ref.trim().is_empty() {
        return Err(Error::InvalidInput("document_ref is required".to_string()));
    }
    if let Some(p) = req.priority {
        if !(defaults::JOB_PRIORITY_MIN..=defaults::JOB_PRIORITY_MAX).contains(&p) {
            return Err(Error::InvalidInput(format!(
                "priority must be {}-{}, got {p}",
                defaults::JOB_PRIORITY_MIN,
                defaults::JOB_PRIORITY_MAX
            )));
        }
    }
    if req.resources.memory_mb == 0 {
        return Err(Error::InvalidInput(
            "resources.memory_mb must be positive".to_string(),
        ));
    }
    if req.parameters.as_ref().is_some_and(|p| !p.is_object()) {
        return Err(Error::InvalidInput(
            "parameters must be a JSON object".to_string(),
        ));
    }
    Ok(())
}

impl Scheduler {
    pub fn new(
        jobs: Arc<dyn JobRepository>,
        tenants: Arc<TenantRegistry>,
        limiter: Arc<RateLimiter>,
        config: ConfigHandle,
        events: EventBus,
        clock: SharedClock,
    ) -> Self {
        Self {
            jobs,
            tenants,
            limiter,
            config,
            events,
            clock,
            wakeup: Notify::new(),
        }
    }

    fn publish(&self, job: &Job) {
        self.events.emit(ServerEvent::JobStatusChanged {
            job_id: job.id,
            tenant_id: job.tenant_id.clone(),
            status: job.status,
            retry_count: job.retry_count,
        });
    }

    /// Admit and enqueue a job.
    #[instrument(skip(self, req), fields(subsystem = "jobs", component = "scheduler", op = "submit", tenant_id = %req.tenant_id, job_type = %req.job_type))]
    pub async fn submit(&self, req: SubmitJob) -> Result<Submission> {
        validate(&req)?;
        let tenant = self.tenants.get(&req.tenant_id).await?;
        if let Some(feature) = req.job_type.required_feature() {
            if !tenant.has_feature(feature) {
                return Err(Error::FeatureDisabled(format!(
                    "{} requires feature '{feature}'",
                    req.job_type
                )));
            }
        }
        self.limiter
            .admit(&req.tenant_id, &req.actor_id, req.role.as_deref(), ENDPOINT_SUBMIT)
            .await?;

        let snapshot = self.config.current();
        let new = NewJob {
            tenant_id: req.tenant_id,
            actor_id: req.actor_id,
            job_type: req.job_type,
            document_ref: req.document_ref,
            priority: req.priority.unwrap_or_else(|| req.job_type.default_priority()),
            resources: req.resources,
            parameters: req.parameters,
            max_retries: snapshot.scheduler.max_retries,
            dedupe: req.dedupe,
        };
        let (job, deduplicated) = self.jobs.insert(new, self.clock.now()).await?;

        if deduplicated {
            debug!(job_id = %job.id, "Submission matched an existing job");
        } else {
            info!(job_id = %job.id, priority = job.priority, "Job queued");
            self.events.emit(ServerEvent::JobQueued {
                job_id: job.id,
                tenant_id: job.tenant_id.clone(),
                job_type: job.job_type,
                priority: job.priority,
            });
            self.wakeup.notify_waiters();
        }
        Ok(Submission {
            job_id: job.id,
            status: job.status,
            deduplicated,
        })
    }

    async fn lease_policy(&self) -> Result<LeasePolicy> {
        let snapshot = self.config.current();
        let limits = self.tenants.concurrency_limits().await?;
        Ok(LeasePolicy::from_scheduler(&snapshot.scheduler, limits))
    }

    /// Lease the next job `caps` can run, without waiting.
    pub async fn lease_next(&self, caps: &WorkerCapabilities) -> Result<Option<Job>> {
        let policy = self.lease_policy().await?;
        let leased = self.jobs.lease_next(caps, &policy, self.clock.now()).await?;
        if let Some(job) = &leased {
            debug!(
                subsystem = "jobs",
                component = "scheduler",
                op = "lease_next",
                job_id = %job.id,
                worker_id = %caps.worker_id,
                "Lease granted"
            );
            self.publish(job);
        }
        Ok(leased)
    }

    /// Lease the next job, waiting up to `wait` for one to become available.
    pub async fn lease_next_wait(
        &self,
        caps: &WorkerCapabilities,
        wait: StdDuration,
    ) -> Result<Option<Job>> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let notified = self.wakeup.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(job) = self.lease_next(caps).await? {
                return Ok(Some(job));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    /// Extend the caller's lease by the configured lease duration.
    pub async fn heartbeat(&self, job_id: Uuid, worker_id: &str) -> Result<HeartbeatAck> {
        let lease = self.config.current().scheduler.lease_duration();
        self.jobs
            .heartbeat(job_id, worker_id, lease, self.clock.now())
            .await
    }

    pub async fn report_progress(
        &self,
        job_id: Uuid,
        worker_id: &str,
        percent: i32,
        step: Option<&str>,
    ) -> Result<()> {
        self.jobs
            .report_progress(job_id, worker_id, percent, step, self.clock.now())
            .await
    }

    pub async fn complete(
        &self,
        job_id: Uuid,
        worker_id: &str,
        result_ref: Option<&str>,
    ) -> Result<Job> {
        let job = self
            .jobs
            .complete(job_id, worker_id, result_ref, self.clock.now())
            .await?;
        self.publish(&job);
        self.wakeup.notify_waiters();
        Ok(job)
    }

    /// Record a failed attempt. Retryable failures back off exponentially
    /// until retries are exhausted.
    pub async fn fail(
        &self,
        job_id: Uuid,
        worker_id: &str,
        error: &str,
        retryable: bool,
    ) -> Result<Job> {
        let snapshot = self.config.current();
        let job = self
            .jobs
            .fail(
                job_id,
                worker_id,
                error,
                retryable,
                &snapshot.scheduler,
                self.clock.now(),
            )
            .await?;
        self.publish(&job);
        self.wakeup.notify_waiters();
        Ok(job)
    }

    /// Cancel a job owned by `tenant_id`.
    pub async fn cancel(
        &self,
        tenant_id: &str,
        job_id: Uuid,
        actor_id: &str,
    ) -> Result<(CancelOutcome, Job)> {
        let (outcome, job) = self
            .jobs
            .cancel(tenant_id, job_id, actor_id, self.clock.now())
            .await?;
        info!(
            subsystem = "jobs",
            component = "scheduler",
            op = "cancel",
            job_id = %job_id,
            ?outcome,
            "Cancellation processed"
        );
        self.publish(&job);
        Ok((outcome, job))
    }

    /// Caller-facing status. Jobs of other tenants are reported as missing.
    pub async fn status(&self, tenant_id: &str, job_id: Uuid) -> Result<JobStatusView> {
        match self.jobs.get(job_id).await? {
            Some(job) if job.tenant_id == tenant_id => Ok(JobStatusView::from(&job)),
            _ => Err(Error::JobNotFound(job_id)),
        }
    }

    pub async fn list(
        &self,
        tenant_id: &str,
        filter: &JobFilter,
        limit: Option<i64>,
        offset: Option<i64>,
    ) -> Result<Vec<JobStatusView>> {
        let limit = limit
            .unwrap_or(defaults::PAGE_LIMIT)
            .clamp(1, defaults::PAGE_LIMIT_MAX);
        let offset = offset.unwrap_or(0).max(0);
        let jobs = self.jobs.list(tenant_id, filter, limit, offset).await?;
        Ok(jobs.iter().map(JobStatusView::from).collect())
    }

    pub async fn stats(&self, tenant_id: Option<&str>) -> Result<QueueStats> {
        self.jobs.stats(tenant_id, self.clock.now()).await
    }

    /// Requeue or fail every job whose lease deadline has passed.
    pub async fn reclaim_expired(&self) -> Result<Vec<Job>> {
        let reclaimed = self.jobs.reclaim_expired(self.clock.now()).await?;
        for job in &reclaimed {
            warn!(
                subsystem = "jobs",
                component = "reaper",
                job_id = %job.id,
                status = %job.status,
                retry_count = job.retry_count,
                "Reclaimed job with expired lease"
            );
            self.publish(job);
        }
        if !reclaimed.is_empty() {
            self.wakeup.notify_waiters();
        }
        Ok(reclaimed)
    }

    /// Run the lease reaper every `interval` until `shutdown` flips to true.
    pub fn spawn_reaper(
        self: Arc<Self>,
        interval: StdDuration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                subsystem = "jobs",
                component = "reaper",
                interval_ms = interval.as_millis() as u64,
                "Lease reaper started"
            );
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        let start = Instant::now();
                        match self.reclaim_expired().await {
                            Ok(jobs) if !jobs.is_empty() => debug!(
                                subsystem = "jobs",
                                component = "reaper",
                                reclaimed = jobs.len(),
                                duration_ms = start.elapsed().as_millis() as u64,
                                "Reaper pass finished"
                            ),
                            Ok(_) => {}
                            Err(e) => warn!(
                                subsystem = "jobs",
                                component = "reaper",
                                error = %e,
                                "Reaper pass failed"
                            ),
                        }
                    }
                }
            }
            info!(subsystem = "jobs", component = "reaper", "Lease reaper stopped");
        })
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    pub fn config(&self) -> &ConfigHandle {
        &self.config
    }
}
