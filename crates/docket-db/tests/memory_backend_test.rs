//! Concurrency and atomicity checks for the in-process backend.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{Duration, Utc};
use docket_core::{
    AuditQuery, JobStatus, JobType, LeasePolicy, NewJob, ResourceRequirements,
    SchedulerPolicy, WorkerCapabilities,
};
use docket_db::memory::MemoryAuditLog;
use docket_db::Database;

fn new_job(tenant: &str, doc: &str) -> NewJob {
    NewJob {
        tenant_id: tenant.into(),
        actor_id: "alice".into(),
        job_type: JobType::TextExtraction,
        document_ref: doc.into(),
        priority: 5,
        resources: ResourceRequirements::default(),
        parameters: None,
        max_retries: 3,
        dedupe: false,
    }
}

fn lease_policy() -> LeasePolicy {
    LeasePolicy::from_scheduler(&SchedulerPolicy::default(), Default::default())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_workers_never_share_a_job() {
    let db = Database::in_memory();
    let now = Utc::now();
    for i in 0..40 {
        db.jobs
            .insert(new_job(&format!("t{}", i % 4), &format!("doc-{i}")), now)
            .await
            .unwrap();
    }

    let mut policy = lease_policy();
    policy.fairness_cap = 100;
    policy.default_tenant_limit = 100;
    let policy = Arc::new(policy);

    let mut handles = Vec::new();
    for w in 0..8 {
        let db = db.clone();
        let policy = policy.clone();
        handles.push(tokio::spawn(async move {
            let caps = WorkerCapabilities::new(format!("w{w}"), 4096, false);
            let mut leased = Vec::new();
            while let Some(job) = db.jobs.lease_next(&caps, &policy, now).await.unwrap() {
                leased.push(job.id);
            }
            leased
        }));
    }

    let mut seen = HashSet::new();
    for handle in handles {
        for id in handle.await.unwrap() {
            assert!(seen.insert(id), "job {id} leased twice");
        }
    }
    assert_eq!(seen.len(), 40);
}

#[tokio::test]
async fn test_every_transition_is_audited_in_order() {
    let audit = Arc::new(MemoryAuditLog::new());
    let db = Database::from_memory(audit.clone());
    let now = Utc::now();
    let (job, _) = db.jobs.insert(new_job("acme", "doc-1"), now).await.unwrap();
    let caps = WorkerCapabilities::new("w1", 4096, false);

    db.jobs.lease_next(&caps, &lease_policy(), now).await.unwrap();
    db.jobs
        .report_progress(job.id, "w1", 50, Some("ocr"), now)
        .await
        .unwrap();
    db.jobs
        .fail(job.id, "w1", "timeout", true, &SchedulerPolicy::default(), now)
        .await
        .unwrap();

    let page = db
        .audit
        .query(&AuditQuery {
            entity_id: Some(job.id.to_string()),
            ..Default::default()
        })
        .await
        .unwrap();
    let transitions: Vec<&str> = page
        .events
        .iter()
        .filter_map(|e| e.metadata.as_ref()?.get("transition")?.as_str())
        .collect();
    assert_eq!(transitions, vec!["submit", "lease", "progress", "retry"]);
    let seqs: Vec<i64> = page.events.iter().map(|e| e.seq).collect();
    assert!(seqs.windows(2).all(|w| w[0] < w[1]));
}

#[tokio::test]
async fn test_failed_audit_write_aborts_every_mutation_kind() {
    let audit = Arc::new(MemoryAuditLog::new());
    let db = Database::from_memory(audit.clone());
    let now = Utc::now();
    let (job, _) = db.jobs.insert(new_job("acme", "doc-1"), now).await.unwrap();

    audit.set_write_failure(true);
    assert!(db.jobs.insert(new_job("acme", "doc-2"), now).await.is_err());
    assert!(db.jobs.cancel("acme", job.id, "alice", now).await.is_err());
    assert!(db
        .sessions
        .create("acme", "alice", None, None, now)
        .await
        .is_err());
    audit.set_write_failure(false);

    let stored = db.jobs.get(job.id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Queued);
    let stats = db.jobs.stats(Some("acme"), now).await.unwrap();
    assert_eq!(stats.total, 1);
    assert_eq!(audit.len(), 1);
}

#[tokio::test]
async fn test_reclaimed_job_is_leasable_by_another_worker() {
    let db = Database::in_memory();
    let now = Utc::now();
    let (job, _) = db.jobs.insert(new_job("acme", "doc-1"), now).await.unwrap();
    let policy = lease_policy();
    let w1 = WorkerCapabilities::new("w1", 4096, false);
    let w2 = WorkerCapabilities::new("w2", 4096, false);

    db.jobs.lease_next(&w1, &policy, now).await.unwrap().unwrap();
    let later = now + policy.lease_duration + Duration::seconds(1);
    db.jobs.reclaim_expired(later).await.unwrap();

    let leased = db.jobs.lease_next(&w2, &policy, later).await.unwrap().unwrap();
    assert_eq!(leased.id, job.id);
    assert_eq!(leased.worker_id.as_deref(), Some("w2"));

    let err = db.jobs.complete(job.id, "w1", None, later).await.unwrap_err();
    assert!(matches!(err, docket_core::Error::LeaseLost(_)));
}
