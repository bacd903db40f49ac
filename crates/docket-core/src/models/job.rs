//! Job ledger models.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::error::Error;

// =============================================================================
// JOB TYPE
// =============================================================================

/// Type of document processing job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    /// Extract text from a native document
    TextExtraction,
    /// Optical character recognition on scanned pages
    Ocr,
    /// Summarize document content
    Summarization,
    /// Classify the document type
    Classification,
    /// Extract named entities
    EntityExtraction,
    /// Generate embeddings for the content
    Embedding,
    /// Full AI analysis of the document
    Analysis,
}

impl JobType {
    /// Every job type, in declaration order.
    pub const ALL: [JobType; 7] = [
        JobType::TextExtraction,
        JobType::Ocr,
        JobType::Summarization,
        JobType::Classification,
        JobType::EntityExtraction,
        JobType::Embedding,
        JobType::Analysis,
    ];

    /// Database/wire representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::TextExtraction => "text_extraction",
            JobType::Ocr => "ocr",
            JobType::Summarization => "summarization",
            JobType::Classification => "classification",
            JobType::EntityExtraction => "entity_extraction",
            JobType::Embedding => "embedding",
            JobType::Analysis => "analysis",
        }
    }

    /// Priority used when the submitter does not override it (1-10, higher first).
    pub fn default_priority(&self) -> i32 {
        match self {
            JobType::TextExtraction => 7,
            JobType::Ocr => 6,
            JobType::Classification => 6,
            JobType::EntityExtraction => 5,
            JobType::Embedding => 5,
            JobType::Summarization => 4,
            JobType::Analysis => 3,
        }
    }

    /// Tenant feature flag required to submit this job type, if any.
    pub fn required_feature(&self) -> Option<&'static str> {
        match self {
            JobType::Ocr => Some("ocr"),
            JobType::Analysis | JobType::Summarization => Some("ai_analysis"),
            _ => None,
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| Error::InvalidInput(format!("Unsupported job type: {s}")))
    }
}

// =============================================================================
// JOB STATUS
// =============================================================================

/// Status of a job in the ledger.
///
/// ```text
/// QUEUED ──► RUNNING ──► COMPLETED
///   │           │
///   │           ├──► RETRYING ──► QUEUED / RUNNING
///   │           │        │
///   └───────────┴────────┴──► FAILED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Retrying,
    Completed,
    Failed,
}

impl JobStatus {
    /// Database/wire representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Retrying => "retrying",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    /// COMPLETED and FAILED never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Eligible for leasing (subject to backoff and capability checks).
    pub fn is_runnable(&self) -> bool {
        matches!(self, JobStatus::Queued | JobStatus::Retrying)
    }

    /// Whether the state machine permits `self → next`.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Queued, Running)
                | (Queued, Failed)
                | (Running, Completed)
                | (Running, Retrying)
                | (Running, Failed)
                | (Retrying, Queued)
                | (Retrying, Running)
                | (Retrying, Failed)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "running" => Ok(JobStatus::Running),
            "retrying" => Ok(JobStatus::Retrying),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(Error::InvalidInput(format!("Unknown job status: {other}"))),
        }
    }
}

// =============================================================================
// RESOURCES
// =============================================================================

/// Resources a job needs from the worker that runs it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequirements {
    /// Memory budget in MiB.
    pub memory_mb: u32,
    /// Requires exclusive use of an accelerator (GPU).
    pub exclusive_accelerator: bool,
}

impl Default for ResourceRequirements {
    fn default() -> Self {
        Self {
            memory_mb: 512,
            exclusive_accelerator: false,
        }
    }
}

/// What a worker declares it can run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerCapabilities {
    pub worker_id: String,
    pub memory_mb: u32,
    pub has_accelerator: bool,
    /// Job types the worker has handlers for. Empty = any.
    pub job_types: Vec<JobType>,
}

impl WorkerCapabilities {
    pub fn new(worker_id: impl Into<String>, memory_mb: u32, has_accelerator: bool) -> Self {
        Self {
            worker_id: worker_id.into(),
            memory_mb,
            has_accelerator,
            job_types: Vec::new(),
        }
    }

    pub fn with_job_types(mut self, job_types: Vec<JobType>) -> Self {
        self.job_types = job_types;
        self
    }

    /// Whether a job's resource requirement fits this worker.
    pub fn fits(&self, req: &ResourceRequirements) -> bool {
        req.memory_mb <= self.memory_mb && (!req.exclusive_accelerator || self.has_accelerator)
    }

    /// Whether the worker handles the given job type.
    pub fn accepts(&self, job_type: JobType) -> bool {
        self.job_types.is_empty() || self.job_types.contains(&job_type)
    }
}

// =============================================================================
// JOB
// =============================================================================

/// A job record in the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub tenant_id: String,
    pub actor_id: String,
    pub job_type: JobType,
    /// Reference to the target document held by the storage collaborator.
    pub document_ref: String,
    /// 1-10, higher runs first.
    pub priority: i32,
    pub resources: ResourceRequirements,
    pub status: JobStatus,
    pub parameters: Option<JsonValue>,
    /// Reference to the result payload, set on completion.
    pub result_ref: Option<String>,
    pub last_error: Option<String>,
    pub progress_percent: i32,
    pub progress_step: Option<String>,
    pub retry_count: i32,
    pub max_retries: i32,
    /// Worker holding the lease while RUNNING.
    pub worker_id: Option<String>,
    /// Heartbeat deadline of the current lease.
    pub lease_expires_at: Option<DateTime<Utc>>,
    /// Earliest time the job may be leased (retry backoff).
    pub available_at: DateTime<Utc>,
    /// Advisory cancellation flag for RUNNING jobs.
    pub cancel_requested: bool,
    pub archived: bool,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Build a fresh QUEUED job from a validated request.
    pub fn from_new(id: Uuid, new: NewJob, now: DateTime<Utc>) -> Self {
        Self {
            id,
            tenant_id: new.tenant_id,
            actor_id: new.actor_id,
            job_type: new.job_type,
            document_ref: new.document_ref,
            priority: new.priority,
            resources: new.resources,
            status: JobStatus::Queued,
            parameters: new.parameters,
            result_ref: None,
            last_error: None,
            progress_percent: 0,
            progress_step: None,
            retry_count: 0,
            max_retries: new.max_retries,
            worker_id: None,
            lease_expires_at: None,
            available_at: now,
            cancel_requested: false,
            archived: false,
            created_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    /// JSON snapshot used as the audit before/after image.
    pub fn snapshot(&self) -> JsonValue {
        serde_json::to_value(self).unwrap_or(JsonValue::Null)
    }

    /// Whether `worker_id` currently holds this job's lease.
    pub fn is_leased_by(&self, worker_id: &str) -> bool {
        self.status == JobStatus::Running && self.worker_id.as_deref() == Some(worker_id)
    }

    /// Whether the lease deadline has passed.
    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Running && self.lease_expires_at.is_some_and(|d| d <= now)
    }

    /// Whether the identity fields match a dedup lookup.
    pub fn is_duplicate_of(&self, new: &NewJob) -> bool {
        !self.status.is_terminal()
            && self.tenant_id == new.tenant_id
            && self.job_type == new.job_type
            && self.document_ref == new.document_ref
    }
}

/// Validated input for creating a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewJob {
    pub tenant_id: String,
    pub actor_id: String,
    pub job_type: JobType,
    pub document_ref: String,
    pub priority: i32,
    pub resources: ResourceRequirements,
    pub parameters: Option<JsonValue>,
    pub max_retries: i32,
    /// Return the existing non-terminal job for the same document and type.
    pub dedupe: bool,
}

/// Caller-facing submission (priority optional).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitJob {
    pub tenant_id: String,
    pub actor_id: String,
    /// Role of the submitting actor, used for rate-limit overrides.
    #[serde(default)]
    pub role: Option<String>,
    pub job_type: JobType,
    pub document_ref: String,
    #[serde(default)]
    pub priority: Option<i32>,
    #[serde(default)]
    pub resources: ResourceRequirements,
    #[serde(default)]
    pub parameters: Option<JsonValue>,
    #[serde(default)]
    pub dedupe: bool,
}

/// Result of an accepted submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Submission {
    pub job_id: Uuid,
    pub status: JobStatus,
    /// True when an existing job was returned instead of a new one.
    pub deduplicated: bool,
}

/// Acknowledgement of a heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatAck {
    pub lease_expires_at: DateTime<Utc>,
    /// The worker should stop at the next step boundary.
    pub cancel_requested: bool,
}

/// Outcome of a cancellation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    /// The job never ran and is now FAILED.
    Cancelled,
    /// The job is RUNNING; the worker was asked to stop.
    Requested,
}

/// Filter for listing jobs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub job_type: Option<JobType>,
    #[serde(default)]
    pub include_archived: bool,
}

impl JobFilter {
    pub fn matches(&self, job: &Job) -> bool {
        self.status.is_none_or(|s| s == job.status)
            && self.job_type.is_none_or(|t| t == job.job_type)
            && (self.include_archived || !job.archived)
    }
}

/// Queue statistics summary.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub queued: i64,
    pub running: i64,
    pub retrying: i64,
    pub completed_last_hour: i64,
    pub failed_last_hour: i64,
    pub total: i64,
}

/// Running-job counts keyed by tenant.
pub type TenantLoad = HashMap<String, u32>;

/// Caller-facing job status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatusView {
    pub id: Uuid,
    pub tenant_id: String,
    pub job_type: JobType,
    pub status: JobStatus,
    pub priority: i32,
    pub progress_percent: i32,
    pub progress_step: Option<String>,
    pub retry_count: i32,
    pub max_retries: i32,
    pub last_error: Option<String>,
    /// Only present once COMPLETED.
    pub result_ref: Option<String>,
    pub cancel_requested: bool,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<&Job> for JobStatusView {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id,
            tenant_id: job.tenant_id.clone(),
            job_type: job.job_type,
            status: job.status,
            priority: job.priority,
            progress_percent: job.progress_percent,
            progress_step: job.progress_step.clone(),
            retry_count: job.retry_count,
            max_retries: job.max_retries,
            last_error: job.last_error.clone(),
            result_ref: if job.status == JobStatus::Completed {
                job.result_ref.clone()
            } else {
                None
            },
            cancel_requested: job.cancel_requested,
            created_at: job.created_at,
            started_at: job.started_at,
            completed_at: job.completed_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_job() -> NewJob {
        NewJob {
            tenant_id: "acme".into(),
            actor_id: "alice".into(),
            job_type: JobType::Ocr,
            document_ref: "doc-1".into(),
            priority: 5,
            resources: ResourceRequirements::default(),
            parameters: None,
            max_retries: 3,
            dedupe: false,
        }
    }

    #[test]
    fn test_job_type_round_trip_through_str() {
        for t in JobType::ALL {
            assert_eq!(t.as_str().parse::<JobType>().unwrap(), t);
        }
        assert!("pdf_magic".parse::<JobType>().is_err());
    }

    #[test]
    fn test_job_type_default_priority_in_range() {
        for t in JobType::ALL {
            let p = t.default_priority();
            assert!((1..=10).contains(&p), "{t} priority {p}");
        }
    }

    #[test]
    fn test_status_lattice_terminal_states_are_sinks() {
        use JobStatus::*;
        for from in [Completed, Failed] {
            for to in [Queued, Running, Retrying, Completed, Failed] {
                assert!(!from.can_transition_to(to), "{from} -> {to}");
            }
        }
    }

    #[test]
    fn test_status_lattice_running_exits() {
        use JobStatus::*;
        assert!(Running.can_transition_to(Completed));
        assert!(Running.can_transition_to(Retrying));
        assert!(Running.can_transition_to(Failed));
        assert!(!Running.can_transition_to(Queued));
        assert!(!Queued.can_transition_to(Completed));
        assert!(!Queued.can_transition_to(Retrying));
    }

    #[test]
    fn test_capabilities_fit() {
        let cpu = WorkerCapabilities::new("w1", 2048, false);
        let gpu = WorkerCapabilities::new("w2", 8192, true);
        let needs_gpu = ResourceRequirements {
            memory_mb: 1024,
            exclusive_accelerator: true,
        };
        let big = ResourceRequirements {
            memory_mb: 4096,
            exclusive_accelerator: false,
        };
        assert!(!cpu.fits(&needs_gpu));
        assert!(gpu.fits(&needs_gpu));
        assert!(!cpu.fits(&big));
        assert!(gpu.fits(&big));
    }

    #[test]
    fn test_capabilities_accepts_any_when_empty() {
        let w = WorkerCapabilities::new("w1", 1024, false);
        assert!(w.accepts(JobType::Analysis));
        let w = w.with_job_types(vec![JobType::Ocr]);
        assert!(w.accepts(JobType::Ocr));
        assert!(!w.accepts(JobType::Analysis));
    }

    #[test]
    fn test_from_new_starts_queued() {
        let now = Utc::now();
        let job = Job::from_new(Uuid::nil(), new_job(), now);
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.retry_count, 0);
        assert_eq!(job.available_at, now);
        assert!(job.worker_id.is_none());
    }

    #[test]
    fn test_status_view_hides_result_until_completed() {
        let mut job = Job::from_new(Uuid::nil(), new_job(), Utc::now());
        job.result_ref = Some("results/1".into());
        assert!(JobStatusView::from(&job).result_ref.is_none());
        job.status = JobStatus::Completed;
        assert_eq!(
            JobStatusView::from(&job).result_ref.as_deref(),
            Some("results/1")
        );
    }

    #[test]
    fn test_duplicate_detection_ignores_terminal() {
        let lookup = new_job();
        let mut job = Job::from_new(Uuid::nil(), new_job(), Utc::now());
        assert!(job.is_duplicate_of(&lookup));
        job.status = JobStatus::Completed;
        assert!(!job.is_duplicate_of(&lookup));
    }

    #[test]
    fn test_filter_excludes_archived_by_default() {
        let mut job = Job::from_new(Uuid::nil(), new_job(), Utc::now());
        job.archived = true;
        assert!(!JobFilter::default().matches(&job));
        let filter = JobFilter {
            include_archived: true,
            ..Default::default()
        };
        assert!(filter.matches(&job));
    }
}
