//! Scheduler behaviour against the in-process backend with a manual clock.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use docket_core::{
    AuditCategory, CancelOutcome, Clock, ConfigHandle, ConfigSnapshot, Error, EventBus,
    JobFilter, JobStatus, JobType, ManualClock, RateLimit, RateLimitPolicy,
    ResourceRequirements, SchedulerPolicy, ServerEvent, SubmitJob, TenantQuota,
    UpsertTenantRequest, WorkerCapabilities,
};
use docket_db::memory::MemoryAuditLog;
use docket_db::Database;
use docket_jobs::{RateLimiter, Scheduler, TenantRegistry};
use proptest::prelude::*;
use uuid::Uuid;

struct Harness {
    clock: Arc<ManualClock>,
    log: Arc<MemoryAuditLog>,
    events: EventBus,
    scheduler: Arc<Scheduler>,
}

struct TenantSetup {
    id: &'static str,
    max_concurrent: u32,
    features: &'static [&'static str],
}

fn tenant(id: &'static str, max_concurrent: u32) -> TenantSetup {
    TenantSetup {
        id,
        max_concurrent,
        features: &[],
    }
}

async fn harness(config: ConfigSnapshot, tenants: &[TenantSetup]) -> Harness {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let log = Arc::new(MemoryAuditLog::new());
    let db = Database::from_memory(log.clone());
    for setup in tenants {
        db.tenants
            .upsert(
                setup.id,
                &UpsertTenantRequest {
                    name: setup.id.to_uppercase(),
                    quota: TenantQuota {
                        max_concurrent_jobs: setup.max_concurrent,
                        ..TenantQuota::default()
                    },
                    features: setup.features.iter().map(|f| f.to_string()).collect(),
                },
                "admin",
                clock.now(),
            )
            .await
            .unwrap();
    }
    let config = ConfigHandle::new(config);
    let registry = Arc::new(TenantRegistry::new(db.tenants.clone(), clock.clone()));
    let limiter = Arc::new(RateLimiter::new(
        db.rate_limits.clone(),
        registry.clone(),
        config.clone(),
        clock.clone(),
    ));
    let events = EventBus::new(256);
    let scheduler = Arc::new(Scheduler::new(
        db.jobs.clone(),
        registry,
        limiter,
        config,
        events.clone(),
        clock.clone(),
    ));
    Harness {
        clock,
        log,
        events,
        scheduler,
    }
}

fn request(tenant_id: &str, doc: &str, priority: Option<i32>) -> SubmitJob {
    SubmitJob {
        tenant_id: tenant_id.into(),
        actor_id: "alice".into(),
        role: None,
        job_type: JobType::TextExtraction,
        document_ref: doc.into(),
        priority,
        resources: ResourceRequirements::default(),
        parameters: None,
        dedupe: false,
    }
}

fn worker(id: &str) -> WorkerCapabilities {
    WorkerCapabilities::new(id, 4096, false)
}

#[tokio::test]
async fn test_higher_priority_leased_first_within_tenant_quota() {
    let h = harness(ConfigSnapshot::default(), &[tenant("t1", 1)]).await;
    let low = h
        .scheduler
        .submit(request("t1", "doc-low", Some(5)))
        .await
        .unwrap();
    h.clock.advance(Duration::milliseconds(10));
    let high = h
        .scheduler
        .submit(request("t1", "doc-high", Some(8)))
        .await
        .unwrap();

    let first = h.scheduler.lease_next(&worker("w1")).await.unwrap().unwrap();
    assert_eq!(first.id, high.job_id);
    assert_eq!(first.status, JobStatus::Running);

    // Quota of one: the second worker waits.
    assert!(h.scheduler.lease_next(&worker("w2")).await.unwrap().is_none());

    h.scheduler.complete(first.id, "w1", Some("r-1")).await.unwrap();
    let second = h.scheduler.lease_next(&worker("w2")).await.unwrap().unwrap();
    assert_eq!(second.id, low.job_id);
}

#[tokio::test]
async fn test_expired_lease_is_reclaimed_and_leasable_again() {
    let h = harness(ConfigSnapshot::default(), &[tenant("t1", 4)]).await;
    let sub = h
        .scheduler
        .submit(request("t1", "doc-1", None))
        .await
        .unwrap();
    let leased = h.scheduler.lease_next(&worker("w1")).await.unwrap().unwrap();
    assert_eq!(leased.id, sub.job_id);

    // Not yet expired.
    h.clock.advance(Duration::seconds(29));
    assert!(h.scheduler.reclaim_expired().await.unwrap().is_empty());

    h.clock.advance(Duration::seconds(2));
    let reclaimed = h.scheduler.reclaim_expired().await.unwrap();
    assert_eq!(reclaimed.len(), 1);
    assert_eq!(reclaimed[0].status, JobStatus::Retrying);
    assert_eq!(reclaimed[0].retry_count, 1);

    let view = h.scheduler.status("t1", sub.job_id).await.unwrap();
    assert_eq!(view.status, JobStatus::Retrying);
    assert_eq!(view.retry_count, 1);

    let again = h.scheduler.lease_next(&worker("w2")).await.unwrap().unwrap();
    assert_eq!(again.id, sub.job_id);
    assert_eq!(again.worker_id.as_deref(), Some("w2"));

    // The stale worker can no longer report.
    let err = h.scheduler.complete(sub.job_id, "w1", None).await.unwrap_err();
    assert!(matches!(err, Error::LeaseLost(_)));
}

#[tokio::test]
async fn test_heartbeat_keeps_lease_alive() {
    let h = harness(ConfigSnapshot::default(), &[tenant("t1", 4)]).await;
    let sub = h.scheduler.submit(request("t1", "doc-1", None)).await.unwrap();
    h.scheduler.lease_next(&worker("w1")).await.unwrap().unwrap();

    for _ in 0..4 {
        h.clock.advance(Duration::seconds(20));
        let ack = h.scheduler.heartbeat(sub.job_id, "w1").await.unwrap();
        assert!(!ack.cancel_requested);
        assert!(h.scheduler.reclaim_expired().await.unwrap().is_empty());
    }
    let err = h.scheduler.heartbeat(sub.job_id, "w2").await.unwrap_err();
    assert!(matches!(err, Error::LeaseLost(_)));
}

#[tokio::test]
async fn test_missing_feature_is_rejected() {
    let h = harness(
        ConfigSnapshot::default(),
        &[
            tenant("plain", 4),
            TenantSetup {
                id: "scanner",
                max_concurrent: 4,
                features: &["ocr"],
            },
        ],
    )
    .await;

    let mut req = request("plain", "scan.tiff", None);
    req.job_type = JobType::Ocr;
    let err = h.scheduler.submit(req.clone()).await.unwrap_err();
    assert!(matches!(err, Error::FeatureDisabled(_)));

    req.tenant_id = "scanner".into();
    assert!(h.scheduler.submit(req).await.is_ok());
}

#[tokio::test]
async fn test_unknown_tenant_is_rejected() {
    let h = harness(ConfigSnapshot::default(), &[]).await;
    let err = h
        .scheduler
        .submit(request("ghost", "doc-1", None))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::TenantNotFound(_)));
}

#[tokio::test]
async fn test_submission_rate_limit_reports_retry_after() {
    let config = ConfigSnapshot {
        rate_limits: vec![RateLimitPolicy {
            name: "submit".into(),
            endpoint_pattern: "jobs.*".into(),
            tenant_id: None,
            role: None,
            limit: RateLimit {
                max_requests: 2,
                window_secs: 60,
                block_secs: 90,
                penalty: None,
            },
        }],
        ..ConfigSnapshot::default()
    };
    let h = harness(config, &[tenant("t1", 4)]).await;

    for i in 0..2 {
        h.scheduler
            .submit(request("t1", &format!("doc-{i}"), None))
            .await
            .unwrap();
    }
    match h.scheduler.submit(request("t1", "doc-3", None)).await {
        Err(Error::RateLimited {
            retry_after_secs, ..
        }) => assert_eq!(retry_after_secs, 90),
        other => panic!("expected rate limit, got {other:?}"),
    }
    let stats = h.scheduler.stats(Some("t1")).await.unwrap();
    assert_eq!(stats.queued, 2);
}

#[tokio::test]
async fn test_dedupe_returns_active_job() {
    let h = harness(ConfigSnapshot::default(), &[tenant("t1", 4)]).await;
    let mut events = h.events.subscribe();

    let mut req = request("t1", "doc-1", None);
    req.dedupe = true;
    let first = h.scheduler.submit(req.clone()).await.unwrap();
    let second = h.scheduler.submit(req).await.unwrap();
    assert!(!first.deduplicated);
    assert!(second.deduplicated);
    assert_eq!(first.job_id, second.job_id);

    let mut queued = 0;
    while let Ok(envelope) = events.try_recv() {
        if matches!(envelope.payload, ServerEvent::JobQueued { .. }) {
            queued += 1;
        }
    }
    assert_eq!(queued, 1);
}

#[tokio::test]
async fn test_cancel_queued_and_running() {
    let h = harness(ConfigSnapshot::default(), &[tenant("t1", 4)]).await;
    let running = h.scheduler.submit(request("t1", "doc-1", Some(9))).await.unwrap();
    let queued = h.scheduler.submit(request("t1", "doc-2", Some(1))).await.unwrap();
    h.scheduler.lease_next(&worker("w1")).await.unwrap().unwrap();

    let (outcome, job) = h.scheduler.cancel("t1", queued.job_id, "bob").await.unwrap();
    assert_eq!(outcome, CancelOutcome::Cancelled);
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.last_error.as_deref(), Some("cancelled by bob"));

    let (outcome, job) = h.scheduler.cancel("t1", running.job_id, "bob").await.unwrap();
    assert_eq!(outcome, CancelOutcome::Requested);
    assert_eq!(job.status, JobStatus::Running);

    let ack = h.scheduler.heartbeat(running.job_id, "w1").await.unwrap();
    assert!(ack.cancel_requested);

    // Cancelled work is terminal; nothing left to lease.
    assert!(h.scheduler.lease_next(&worker("w2")).await.unwrap().is_none());
}

#[tokio::test]
async fn test_tenants_cannot_see_each_other() {
    let h = harness(ConfigSnapshot::default(), &[tenant("t1", 4), tenant("t2", 4)]).await;
    let sub = h.scheduler.submit(request("t1", "doc-1", None)).await.unwrap();
    h.scheduler.submit(request("t2", "doc-1", None)).await.unwrap();

    assert!(matches!(
        h.scheduler.status("t2", sub.job_id).await,
        Err(Error::JobNotFound(_))
    ));
    assert!(matches!(
        h.scheduler.cancel("t2", sub.job_id, "mallory").await,
        Err(Error::JobNotFound(_))
    ));

    let listed = h
        .scheduler
        .list("t2", &JobFilter::default(), None, None)
        .await
        .unwrap();
    assert_eq!(listed.len(), 1);
    assert!(listed.iter().all(|j| j.tenant_id == "t2"));
}

#[tokio::test]
async fn test_every_transition_is_audited() {
    let h = harness(ConfigSnapshot::default(), &[tenant("t1", 4)]).await;
    let sub = h.scheduler.submit(request("t1", "doc-1", None)).await.unwrap();
    h.scheduler.lease_next(&worker("w1")).await.unwrap().unwrap();
    h.scheduler
        .report_progress(sub.job_id, "w1", 40, Some("ocr"))
        .await
        .unwrap();
    h.scheduler
        .fail(sub.job_id, "w1", "upstream 503", true)
        .await
        .unwrap();
    h.clock.advance(Duration::seconds(5));
    h.scheduler.lease_next(&worker("w1")).await.unwrap().unwrap();
    h.scheduler.complete(sub.job_id, "w1", Some("r-1")).await.unwrap();

    let job_id = sub.job_id.to_string();
    let transitions: Vec<String> = h
        .log
        .events()
        .into_iter()
        .filter(|e| e.category == AuditCategory::Job && e.entity_id == job_id)
        .filter_map(|e| e.metadata?.get("transition")?.as_str().map(String::from))
        .collect();
    assert_eq!(
        transitions,
        ["submit", "lease", "progress", "retry", "lease", "complete"]
    );
}

#[tokio::test]
async fn test_lease_wait_wakes_on_submission() {
    let h = harness(ConfigSnapshot::default(), &[tenant("t1", 4)]).await;
    let scheduler = h.scheduler.clone();
    let waiter = tokio::spawn(async move {
        scheduler
            .lease_next_wait(&worker("w1"), StdDuration::from_secs(5))
            .await
    });
    tokio::task::yield_now().await;
    let sub = h.scheduler.submit(request("t1", "doc-1", None)).await.unwrap();

    let leased = waiter.await.unwrap().unwrap().unwrap();
    assert_eq!(leased.id, sub.job_id);
}

#[tokio::test]
async fn test_concurrent_workers_never_share_a_job() {
    let h = harness(ConfigSnapshot::default(), &[tenant("t1", 50)]).await;
    for i in 0..20 {
        h.scheduler
            .submit(request("t1", &format!("doc-{i}"), None))
            .await
            .unwrap();
    }
    let leases = futures::future::join_all((0..30).map(|i| {
        let scheduler = h.scheduler.clone();
        async move { scheduler.lease_next(&worker(&format!("w{i}"))).await }
    }))
    .await;

    let ids: Vec<Uuid> = leases
        .into_iter()
        .filter_map(|r| r.unwrap())
        .map(|j| j.id)
        .collect();
    let unique: HashSet<Uuid> = ids.iter().copied().collect();
    assert_eq!(ids.len(), 20);
    assert_eq!(unique.len(), 20);
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// With both tenants backlogged, no tenant holds more than half the pool.
    #[test]
    fn prop_fairness_cap_bounds_each_tenant(
        workers in 2usize..8,
        backlog_a in 8usize..16,
        backlog_b in 8usize..16,
    ) {
        runtime().block_on(async {
            let config = ConfigSnapshot {
                scheduler: SchedulerPolicy { total_workers: workers, ..SchedulerPolicy::default() },
                ..ConfigSnapshot::default()
            };
            let h = harness(config, &[tenant("a", 100), tenant("b", 100)]).await;
            for i in 0..backlog_a {
                h.scheduler.submit(request("a", &format!("a-{i}"), Some(9))).await.unwrap();
            }
            for i in 0..backlog_b {
                h.scheduler.submit(request("b", &format!("b-{i}"), Some(1))).await.unwrap();
            }

            let mut held: HashMap<String, usize> = HashMap::new();
            for slot in 0..workers {
                if let Some(job) = h.scheduler.lease_next(&worker(&format!("w{slot}"))).await.unwrap() {
                    *held.entry(job.tenant_id).or_default() += 1;
                }
            }
            let cap = workers.div_ceil(2);
            prop_assert!(held.values().all(|n| *n <= cap), "held {:?} cap {}", held, cap);
            prop_assert_eq!(held.values().sum::<usize>(), workers);
            Ok(())
        })?;
    }

    /// Retry count only grows, backoff never shrinks, and retries stop at
    /// the configured maximum.
    #[test]
    fn prop_retries_are_monotonic_and_bounded(max_retries in 0i32..5, base_ms in 100u64..5_000) {
        runtime().block_on(async {
            let config = ConfigSnapshot {
                scheduler: SchedulerPolicy {
                    max_retries,
                    backoff_base_ms: base_ms,
                    ..SchedulerPolicy::default()
                },
                ..ConfigSnapshot::default()
            };
            let h = harness(config, &[tenant("t1", 4)]).await;
            let sub = h.scheduler.submit(request("t1", "doc-1", None)).await.unwrap();

            let mut last_count = 0;
            let mut last_delay = Duration::zero();
            let mut attempts = 0;
            loop {
                h.clock.advance(Duration::hours(1));
                let leased = h.scheduler.lease_next(&worker("w1")).await.unwrap();
                let Some(job) = leased else { break };
                attempts += 1;
                let failed = h.scheduler.fail(job.id, "w1", "boom", true).await.unwrap();
                prop_assert!(failed.retry_count >= last_count);
                if failed.status == JobStatus::Retrying {
                    let delay = failed.available_at - h.clock.now();
                    prop_assert!(delay >= last_delay);
                    last_delay = delay;
                } else {
                    prop_assert_eq!(failed.status, JobStatus::Failed);
                }
                last_count = failed.retry_count;
            }
            prop_assert_eq!(attempts, max_retries + 1);
            let view = h.scheduler.status("t1", sub.job_id).await.unwrap();
            prop_assert_eq!(view.status, JobStatus::Failed);
            Ok(())
        })?;
    }

    /// However leases and completions interleave, a job is held by at most
    /// one worker and RUNNING count matches the leases handed out.
    #[test]
    fn prop_no_job_is_leased_twice(ops in proptest::collection::vec(0u8..3, 1..40)) {
        runtime().block_on(async {
            let h = harness(ConfigSnapshot::default(), &[tenant("t1", 100)]).await;
            for i in 0..10 {
                h.scheduler.submit(request("t1", &format!("doc-{i}"), None)).await.unwrap();
            }
            let mut held: Vec<(Uuid, String)> = Vec::new();
            let mut ever: BTreeSet<Uuid> = BTreeSet::new();
            for (n, op) in ops.into_iter().enumerate() {
                match op {
                    0 | 1 => {
                        let id = format!("w{n}");
                        if let Some(job) = h.scheduler.lease_next(&worker(&id)).await.unwrap() {
                            prop_assert!(held.iter().all(|(j, _)| *j != job.id));
                            prop_assert!(ever.insert(job.id));
                            held.push((job.id, id));
                        }
                    }
                    _ => {
                        if let Some((job_id, w)) = held.pop() {
                            h.scheduler.complete(job_id, &w, None).await.unwrap();
                        }
                    }
                }
            }
            let stats = h.scheduler.stats(Some("t1")).await.unwrap();
            prop_assert_eq!(stats.running as usize, held.len());
            Ok(())
        })?;
    }
}
