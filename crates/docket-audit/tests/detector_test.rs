//! Detector cycles against the in-process backend with a manual clock.

use std::sync::Arc;

use chrono::{Duration, Utc};
use docket_audit::{AlertService, AnomalyDetector, AuditRecorder};
use docket_core::{
    AlertFilter, AlertStatus, AlertType, Clock, ConfigHandle, EventBus, JobType, LeasePolicy,
    ManualClock, NewJob, ResourceRequirements, SchedulerPolicy, WorkerCapabilities,
};
use docket_db::memory::MemoryAuditLog;
use docket_db::Database;

struct Harness {
    clock: Arc<ManualClock>,
    log: Arc<MemoryAuditLog>,
    db: Database,
    recorder: AuditRecorder,
    alerts: AlertService,
    detector: AnomalyDetector,
    events: EventBus,
}

fn harness() -> Harness {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let log = Arc::new(MemoryAuditLog::new());
    let db = Database::from_memory(log.clone());
    let events = EventBus::new(32);
    let recorder = AuditRecorder::new(db.audit.clone(), clock.clone());
    let alerts = AlertService::new(db.alerts.clone(), events.clone(), clock.clone());
    let detector = AnomalyDetector::new(
        db.audit.clone(),
        alerts.clone(),
        ConfigHandle::default(),
        clock.clone(),
    );
    Harness {
        clock,
        log,
        db,
        recorder,
        alerts,
        detector,
        events,
    }
}

async fn fail_login(h: &Harness, actor: &str) {
    h.recorder
        .record_auth("acme", actor, false, Some("203.0.113.7".into()), None)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_brute_force_alert_is_raised_once_then_updated() {
    let h = harness();
    let mut feed = h.events.subscribe();

    for _ in 0..6 {
        fail_login(&h, "mallory").await;
        h.clock.advance(Duration::minutes(1));
    }
    let report = h.detector.run_cycle().await.unwrap();
    assert_eq!(report.created, 1);

    let (open, total) = h
        .alerts
        .list(AlertFilter {
            alert_type: Some(AlertType::BruteForce),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(total, 1);
    let first = open[0].clone();
    assert_eq!(first.status, AlertStatus::Open);
    assert_eq!(first.evidence_count, 6);
    assert_eq!(first.actor_id.as_deref(), Some("mallory"));
    assert_eq!(feed.recv().await.unwrap().event_type, "alert.raised");

    // A 7th failure inside the same 15 minute window.
    fail_login(&h, "mallory").await;
    let seventh_at = h.clock.now();
    let report = h.detector.run_cycle().await.unwrap();
    assert_eq!(report.created, 0);
    assert_eq!(report.updated, 1);

    let (alerts, total) = h.alerts.list(AlertFilter::default()).await.unwrap();
    assert_eq!(total, 1);
    assert_eq!(alerts[0].id, first.id);
    assert_eq!(alerts[0].evidence_count, 7);
    assert_eq!(alerts[0].last_occurrence, seventh_at);
    assert!(alerts[0].last_occurrence > first.last_occurrence);
    let update = feed.recv().await.unwrap();
    assert_eq!(update.event_type, "alert.updated");
    assert_eq!(update.payload.tenant_id(), Some(first.tenant_id.as_str()));

    // Nothing new: the next cycle leaves the alert alone.
    let report = h.detector.run_cycle().await.unwrap();
    assert_eq!(report.created + report.updated, 0);
}

#[tokio::test]
async fn test_failed_cycle_does_not_block_later_cycles() {
    let h = harness();
    for _ in 0..5 {
        fail_login(&h, "eve").await;
    }

    h.log.set_write_failure(true);
    let report = h.detector.run_cycle().await.unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(report.created, 0);

    h.log.set_write_failure(false);
    let report = h.detector.run_cycle().await.unwrap();
    assert_eq!(report.created, 1);
}

#[tokio::test]
async fn test_pipeline_failure_rate_raises_operational_alert() {
    let h = harness();
    let caps = WorkerCapabilities::new("w1", 4096, false);
    let policy = LeasePolicy::from_scheduler(&SchedulerPolicy::default(), Default::default());

    for i in 0..10 {
        let now = h.clock.now();
        h.db.jobs
            .insert(
                NewJob {
                    tenant_id: "acme".into(),
                    actor_id: "alice".into(),
                    job_type: JobType::TextExtraction,
                    document_ref: format!("doc-{i}"),
                    priority: 5,
                    resources: ResourceRequirements::default(),
                    parameters: None,
                    max_retries: 0,
                    dedupe: false,
                },
                now,
            )
            .await
            .unwrap();
        let job = h.db.jobs.lease_next(&caps, &policy, now).await.unwrap().unwrap();
        if i < 6 {
            h.db.jobs
                .fail(job.id, "w1", "extractor crashed", false, &SchedulerPolicy::default(), now)
                .await
                .unwrap();
        } else {
            h.db.jobs.complete(job.id, "w1", Some("r"), now).await.unwrap();
        }
    }

    let raised = h.detector.scan_window(Duration::hours(1)).await.unwrap();
    assert_eq!(raised.len(), 1);
    assert_eq!(raised[0].alert_type, AlertType::ProcessingFailureRate);
    assert!(raised[0].alert_type.is_operational());
    assert!(raised[0].actor_id.is_none());
    assert_eq!(raised[0].evidence["failures"], 6);
}
