//! Job state transitions.
//!
//! Each function validates ownership and the status lattice, mutates the job
//! in place and returns the audit event describing the change. Backends run
//! them inside the same critical section (lock or transaction) that persists
//! the job, so state and audit commit together.

use chrono::{DateTime, Duration, Utc};
use serde_json::json;

use crate::config::SchedulerPolicy;
use crate::error::{Error, Result};
use crate::models::{
    entity, AuditAction, AuditCategory, CancelOutcome, Job, JobStatus, NewAuditEvent, Severity,
    SYSTEM_ACTOR,
};
use crate::scheduling::backoff_delay;

/// Audit event for a job change.
fn job_event(
    before: Option<&Job>,
    after: &Job,
    actor: &str,
    action: AuditAction,
    transition: &str,
) -> NewAuditEvent {
    let severity = match after.status {
        JobStatus::Failed => Severity::Error,
        JobStatus::Retrying => Severity::Warning,
        _ => Severity::Info,
    };
    let mut event = NewAuditEvent::new(
        after.tenant_id.clone(),
        actor,
        entity::JOB,
        after.id.to_string(),
        action,
        AuditCategory::Job,
    )
    .with_after(after.snapshot())
    .with_severity(severity)
    .with_metadata(json!({ "transition": transition }));
    if let Some(before) = before {
        event = event.with_before(before.snapshot());
    }
    event
}

/// Event for a freshly submitted job.
pub fn created(job: &Job) -> NewAuditEvent {
    job_event(None, job, &job.actor_id, AuditAction::Create, "submit")
}

fn ensure_transition(job: &Job, next: JobStatus) -> Result<()> {
    if job.status.can_transition_to(next) {
        Ok(())
    } else {
        Err(Error::transition(job.status, next))
    }
}

fn ensure_owner(job: &Job, worker_id: &str) -> Result<()> {
    if job.is_leased_by(worker_id) {
        Ok(())
    } else {
        Err(Error::LeaseLost(job.id))
    }
}

/// QUEUED/RETRYING → RUNNING under `worker_id`.
pub fn lease(
    job: &mut Job,
    worker_id: &str,
    lease_duration: Duration,
    now: DateTime<Utc>,
) -> Result<NewAuditEvent> {
    ensure_transition(job, JobStatus::Running)?;
    let before = job.clone();
    job.status = JobStatus::Running;
    job.worker_id = Some(worker_id.to_string());
    job.lease_expires_at = Some(now + lease_duration);
    job.started_at = Some(now);
    Ok(job_event(
        Some(&before),
        job,
        worker_id,
        AuditAction::Update,
        "lease",
    ))
}

/// Extend the lease. Not audited: only the deadline moves.
pub fn heartbeat(
    job: &mut Job,
    worker_id: &str,
    lease_duration: Duration,
    now: DateTime<Utc>,
) -> Result<DateTime<Utc>> {
    ensure_owner(job, worker_id)?;
    let deadline = now + lease_duration;
    job.lease_expires_at = Some(deadline);
    Ok(deadline)
}

/// Record progress from the owning worker.
pub fn progress(
    job: &mut Job,
    worker_id: &str,
    percent: i32,
    step: Option<&str>,
) -> Result<NewAuditEvent> {
    ensure_owner(job, worker_id)?;
    if !(0..=100).contains(&percent) {
        return Err(Error::InvalidInput(format!(
            "progress must be 0-100, got {percent}"
        )));
    }
    let before = job.clone();
    job.progress_percent = percent;
    job.progress_step = step.map(str::to_string);
    Ok(job_event(
        Some(&before),
        job,
        worker_id,
        AuditAction::Update,
        "progress",
    ))
}

/// RUNNING → COMPLETED.
pub fn complete(
    job: &mut Job,
    worker_id: &str,
    result_ref: Option<&str>,
    now: DateTime<Utc>,
) -> Result<NewAuditEvent> {
    ensure_owner(job, worker_id)?;
    ensure_transition(job, JobStatus::Completed)?;
    let before = job.clone();
    job.status = JobStatus::Completed;
    job.result_ref = result_ref.map(str::to_string);
    job.progress_percent = 100;
    job.worker_id = None;
    job.lease_expires_at = None;
    job.completed_at = Some(now);
    Ok(job_event(
        Some(&before),
        job,
        worker_id,
        AuditAction::Update,
        "complete",
    ))
}

/// Move a job that lost its attempt to RETRYING (with `delay`) or FAILED.
fn retry_or_fail(job: &mut Job, error: &str, retryable: bool, delay: Duration, now: DateTime<Utc>) {
    job.last_error = Some(error.to_string());
    job.worker_id = None;
    job.lease_expires_at = None;
    if retryable && job.retry_count < job.max_retries {
        job.status = JobStatus::Retrying;
        job.retry_count += 1;
        job.available_at = now + delay;
    } else {
        job.status = JobStatus::Failed;
        job.completed_at = Some(now);
    }
}

/// RUNNING → RETRYING (backoff) or FAILED.
pub fn fail(
    job: &mut Job,
    worker_id: &str,
    error: &str,
    retryable: bool,
    policy: &SchedulerPolicy,
    now: DateTime<Utc>,
) -> Result<NewAuditEvent> {
    ensure_owner(job, worker_id)?;
    let before = job.clone();
    let delay = backoff_delay(job.retry_count, policy.backoff_base_ms, policy.backoff_max_ms);
    retry_or_fail(job, error, retryable, delay, now);
    let transition = if job.status == JobStatus::Retrying {
        "retry"
    } else {
        "fail"
    };
    Ok(job_event(
        Some(&before),
        job,
        worker_id,
        AuditAction::Update,
        transition,
    ))
}

/// Reclaim a RUNNING job whose lease deadline passed. Immediately leasable
/// again when retries remain.
pub fn reclaim(job: &mut Job, now: DateTime<Utc>) -> Result<NewAuditEvent> {
    if !job.lease_expired(now) {
        return Err(Error::transition(job.status, JobStatus::Retrying));
    }
    let before = job.clone();
    let worker = before.worker_id.clone().unwrap_or_default();
    let error = format!("lease expired (worker {worker} missed heartbeat)");
    retry_or_fail(job, &error, true, Duration::zero(), now);
    Ok(job_event(
        Some(&before),
        job,
        SYSTEM_ACTOR,
        AuditAction::Update,
        "reclaim",
    ))
}

/// Cancel on behalf of `actor`. QUEUED/RETRYING jobs fail at once; RUNNING
/// jobs get an advisory flag the worker polls.
pub fn cancel(job: &mut Job, actor: &str, now: DateTime<Utc>) -> Result<(CancelOutcome, NewAuditEvent)> {
    let before = job.clone();
    match job.status {
        JobStatus::Queued | JobStatus::Retrying => {
            job.status = JobStatus::Failed;
            job.last_error = Some(format!("cancelled by {actor}"));
            job.completed_at = Some(now);
            let event = job_event(Some(&before), job, actor, AuditAction::Update, "cancel");
            Ok((CancelOutcome::Cancelled, event))
        }
        JobStatus::Running => {
            job.cancel_requested = true;
            let event = job_event(
                Some(&before),
                job,
                actor,
                AuditAction::Update,
                "cancel_requested",
            );
            Ok((CancelOutcome::Requested, event))
        }
        status => Err(Error::transition(status, JobStatus::Failed)),
    }
}

/// Flag a terminal job as archived by the sweeper.
pub fn archive(job: &mut Job) -> Result<NewAuditEvent> {
    if !job.status.is_terminal() {
        return Err(Error::InvalidInput(format!(
            "job {} is not terminal",
            job.id
        )));
    }
    let before = job.clone();
    job.archived = true;
    Ok(job_event(
        Some(&before),
        job,
        SYSTEM_ACTOR,
        AuditAction::custom(crate::models::action::ARCHIVE),
        "archive",
    ))
}
