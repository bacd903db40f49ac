//! Worker pool end to end: lease, execute, report.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use docket_core::{
    CancelOutcome, Clock, ConfigHandle, ConfigSnapshot, EventBus, JobStatus, JobType,
    ManualClock, ResourceRequirements, SchedulerPolicy, SubmitJob, UpsertTenantRequest,
};
use docket_db::Database;
use docket_jobs::{
    JobContext, JobHandler, JobResult, NoOpHandler, RateLimiter, Scheduler, TenantRegistry,
    WorkerBuilder, WorkerConfig, WorkerEvent,
};
use tokio::sync::{broadcast, Notify};
use uuid::Uuid;

async fn scheduler(policy: SchedulerPolicy) -> Arc<Scheduler> {
    scheduler_with_clock(policy).await.0
}

async fn scheduler_with_clock(policy: SchedulerPolicy) -> (Arc<Scheduler>, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let db = Database::in_memory();
    db.tenants
        .upsert(
            "acme",
            &UpsertTenantRequest {
                name: "Acme".into(),
                quota: Default::default(),
                features: Default::default(),
            },
            "admin",
            clock.now(),
        )
        .await
        .unwrap();
    let config = ConfigHandle::new(ConfigSnapshot {
        scheduler: policy,
        ..ConfigSnapshot::default()
    });
    let tenants = Arc::new(TenantRegistry::new(db.tenants.clone(), clock.clone()));
    let limiter = Arc::new(RateLimiter::new(
        db.rate_limits.clone(),
        tenants.clone(),
        config.clone(),
        clock.clone(),
    ));
    let scheduler = Arc::new(Scheduler::new(
        db.jobs.clone(),
        tenants,
        limiter,
        config,
        EventBus::new(64),
        clock.clone(),
    ));
    (scheduler, clock)
}

fn fast_retries() -> SchedulerPolicy {
    SchedulerPolicy {
        lease_secs: 1,
        backoff_base_ms: 0,
        ..SchedulerPolicy::default()
    }
}

async fn submit(scheduler: &Scheduler, job_type: JobType) -> Uuid {
    scheduler
        .submit(SubmitJob {
            tenant_id: "acme".into(),
            actor_id: "alice".into(),
            role: None,
            job_type,
            document_ref: format!("doc-{}", Uuid::new_v4()),
            priority: None,
            resources: ResourceRequirements::default(),
            parameters: None,
            dedupe: false,
        })
        .await
        .unwrap()
        .job_id
}

fn config() -> WorkerConfig {
    WorkerConfig::default()
        .with_worker_count(2)
        .with_poll_interval(20)
}

async fn wait_for<F>(events: &mut broadcast::Receiver<WorkerEvent>, mut pred: F) -> WorkerEvent
where
    F: FnMut(&WorkerEvent) -> bool,
{
    tokio::time::timeout(StdDuration::from_secs(10), async {
        loop {
            match events.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(e) => panic!("event stream closed: {e}"),
            }
        }
    })
    .await
    .expect("timed out waiting for worker event")
}

#[tokio::test]
async fn test_noop_job_runs_to_completion() {
    let scheduler = scheduler(SchedulerPolicy::default()).await;
    let job_id = submit(&scheduler, JobType::Embedding).await;

    let worker = WorkerBuilder::new(scheduler.clone())
        .with_config(config())
        .with_handler(NoOpHandler::new(JobType::Embedding))
        .build();
    let mut events = worker.events();
    let handle = worker.start();

    wait_for(&mut events, |e| matches!(e, WorkerEvent::JobCompleted { job_id: id, .. } if *id == job_id)).await;
    handle.stop().await;

    let view = scheduler.status("acme", job_id).await.unwrap();
    assert_eq!(view.status, JobStatus::Completed);
    assert_eq!(view.progress_percent, 100);
}

#[tokio::test]
async fn test_unhandled_job_type_is_left_queued() {
    let scheduler = scheduler(SchedulerPolicy::default()).await;
    let job_id = submit(&scheduler, JobType::Classification).await;

    let worker = WorkerBuilder::new(scheduler.clone())
        .with_config(config())
        .with_handler(NoOpHandler::new(JobType::Embedding))
        .build();
    let handle = worker.start();
    tokio::time::sleep(StdDuration::from_millis(100)).await;
    handle.stop().await;

    let view = scheduler.status("acme", job_id).await.unwrap();
    assert_eq!(view.status, JobStatus::Queued);
}

/// Fails transiently on the first attempt.
struct FlakyHandler {
    attempts: AtomicUsize,
}

#[async_trait]
impl JobHandler for FlakyHandler {
    fn job_type(&self) -> JobType {
        JobType::TextExtraction
    }

    async fn execute(&self, _ctx: JobContext) -> JobResult {
        if self.attempts.fetch_add(1, Ordering::SeqCst) == 0 {
            JobResult::Retry("upstream 503".into())
        } else {
            JobResult::Success(Some("results/1".into()))
        }
    }
}

#[tokio::test]
async fn test_transient_failure_is_retried() {
    let scheduler = scheduler(fast_retries()).await;
    let job_id = submit(&scheduler, JobType::TextExtraction).await;

    let worker = WorkerBuilder::new(scheduler.clone())
        .with_config(config())
        .with_handler(FlakyHandler {
            attempts: AtomicUsize::new(0),
        })
        .build();
    let mut events = worker.events();
    let handle = worker.start();

    let failed = wait_for(&mut events, |e| matches!(e, WorkerEvent::JobFailed { .. })).await;
    assert!(matches!(failed, WorkerEvent::JobFailed { will_retry: true, .. }));
    wait_for(&mut events, |e| matches!(e, WorkerEvent::JobCompleted { .. })).await;
    handle.stop().await;

    let view = scheduler.status("acme", job_id).await.unwrap();
    assert_eq!(view.status, JobStatus::Completed);
    assert_eq!(view.retry_count, 1);
    assert_eq!(view.result_ref.as_deref(), Some("results/1"));
}

struct BrokenHandler;

#[async_trait]
impl JobHandler for BrokenHandler {
    fn job_type(&self) -> JobType {
        JobType::Classification
    }

    async fn execute(&self, _ctx: JobContext) -> JobResult {
        JobResult::Failed("unsupported document format".into())
    }
}

#[tokio::test]
async fn test_permanent_failure_is_not_retried() {
    let scheduler = scheduler(fast_retries()).await;
    let job_id = submit(&scheduler, JobType::Classification).await;

    let worker = WorkerBuilder::new(scheduler.clone())
        .with_config(config())
        .with_handler(BrokenHandler)
        .build();
    let mut events = worker.events();
    let handle = worker.start();

    let failed = wait_for(&mut events, |e| matches!(e, WorkerEvent::JobFailed { .. })).await;
    assert!(matches!(failed, WorkerEvent::JobFailed { will_retry: false, .. }));
    handle.stop().await;

    let view = scheduler.status("acme", job_id).await.unwrap();
    assert_eq!(view.status, JobStatus::Failed);
    assert_eq!(view.retry_count, 0);
    assert_eq!(view.last_error.as_deref(), Some("unsupported document format"));
}

/// Works in small steps until asked to stop.
struct PatientHandler;

#[async_trait]
impl JobHandler for PatientHandler {
    fn job_type(&self) -> JobType {
        JobType::Embedding
    }

    async fn execute(&self, ctx: JobContext) -> JobResult {
        for step in 0..500 {
            if ctx.is_cancelled() {
                return JobResult::Cancelled;
            }
            ctx.report_progress(step / 5, Some("analysing"));
            tokio::time::sleep(StdDuration::from_millis(20)).await;
        }
        JobResult::Success(None)
    }
}

#[tokio::test]
async fn test_running_job_stops_after_cancel_request() {
    let scheduler = scheduler(fast_retries()).await;
    let job_id = submit(&scheduler, JobType::Embedding).await;

    let worker = WorkerBuilder::new(scheduler.clone())
        .with_config(config())
        .with_handler(PatientHandler)
        .build();
    let mut events = worker.events();
    let handle = worker.start();

    wait_for(&mut events, |e| matches!(e, WorkerEvent::JobStarted { .. })).await;
    let (outcome, _) = scheduler.cancel("acme", job_id, "bob").await.unwrap();
    assert_eq!(outcome, CancelOutcome::Requested);

    wait_for(&mut events, |e| matches!(e, WorkerEvent::JobCancelled { job_id: id, .. } if *id == job_id)).await;
    handle.stop().await;

    let view = scheduler.status("acme", job_id).await.unwrap();
    assert_eq!(view.status, JobStatus::Failed);
    assert_eq!(view.last_error.as_deref(), Some("cancelled"));
}

#[tokio::test]
async fn test_disabled_worker_does_nothing() {
    let scheduler = scheduler(SchedulerPolicy::default()).await;
    let job_id = submit(&scheduler, JobType::Embedding).await;

    let worker = WorkerBuilder::new(scheduler.clone())
        .with_config(config().with_enabled(false))
        .with_handler(NoOpHandler::new(JobType::Embedding))
        .build();
    worker.start().stop().await;

    let view = scheduler.status("acme", job_id).await.unwrap();
    assert_eq!(view.status, JobStatus::Queued);
}

/// Retries wait a minute on the manual clock, so a failed job stays RETRYING.
fn slow_retries() -> SchedulerPolicy {
    SchedulerPolicy {
        backoff_base_ms: 60_000,
        backoff_max_ms: 600_000,
        ..SchedulerPolicy::default()
    }
}

/// Never finishes on its own.
struct StuckHandler;

#[async_trait]
impl JobHandler for StuckHandler {
    fn job_type(&self) -> JobType {
        JobType::TextExtraction
    }

    async fn execute(&self, _ctx: JobContext) -> JobResult {
        tokio::time::sleep(StdDuration::from_secs(60)).await;
        JobResult::Success(Some("results/never".into()))
    }
}

#[tokio::test]
async fn test_handler_timeout_is_a_retryable_failure() {
    let scheduler = scheduler(slow_retries()).await;
    let job_id = submit(&scheduler, JobType::TextExtraction).await;

    let worker = WorkerBuilder::new(scheduler.clone())
        .with_config(config().with_worker_count(1).with_job_timeout(1))
        .with_handler(StuckHandler)
        .build();
    let mut events = worker.events();
    let handle = worker.start();

    let failed = wait_for(&mut events, |e| matches!(e, WorkerEvent::JobFailed { .. })).await;
    assert!(matches!(failed, WorkerEvent::JobFailed { will_retry: true, .. }));
    handle.stop().await;

    let view = scheduler.status("acme", job_id).await.unwrap();
    assert_eq!(view.status, JobStatus::Retrying);
    assert_eq!(view.retry_count, 1);
    let last_error = view.last_error.unwrap_or_default();
    assert!(last_error.contains("timeout"), "last_error was {last_error:?}");
    assert!(view.result_ref.is_none());
}

/// Ignores cancellation and finishes only when released.
struct LateHandler {
    release: Arc<Notify>,
}

#[async_trait]
impl JobHandler for LateHandler {
    fn job_type(&self) -> JobType {
        JobType::Classification
    }

    async fn execute(&self, _ctx: JobContext) -> JobResult {
        self.release.notified().await;
        JobResult::Success(Some("results/late".into()))
    }
}

#[tokio::test]
async fn test_result_after_lost_lease_is_discarded() {
    let (scheduler, clock) = scheduler_with_clock(slow_retries()).await;
    let job_id = submit(&scheduler, JobType::Classification).await;
    let lease_secs = scheduler.config().current().scheduler.lease_secs as i64;

    let release = Arc::new(Notify::new());
    let worker = WorkerBuilder::new(scheduler.clone())
        .with_config(config().with_worker_count(1))
        .with_handler(LateHandler {
            release: release.clone(),
        })
        .build();
    let mut events = worker.events();
    let handle = worker.start();

    wait_for(&mut events, |e| matches!(e, WorkerEvent::JobStarted { .. })).await;
    clock.advance(Duration::seconds(lease_secs + 1));
    let reclaimed = scheduler.reclaim_expired().await.unwrap();
    assert_eq!(reclaimed.len(), 1);
    assert_eq!(reclaimed[0].id, job_id);

    // Stop leasing once the in-flight job returns, then let it finish.
    handle.shutdown();
    release.notify_one();
    handle.stop().await;

    while let Ok(event) = events.try_recv() {
        assert!(
            !matches!(event, WorkerEvent::JobCompleted { .. }),
            "late result completed the job"
        );
    }
    let view = scheduler.status("acme", job_id).await.unwrap();
    assert_eq!(view.status, JobStatus::Retrying);
    assert_eq!(view.retry_count, 1);
    assert!(view.result_ref.is_none());
}
