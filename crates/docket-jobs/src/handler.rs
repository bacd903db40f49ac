//! Handler contract for leased jobs.
//!
//! A handler runs one job type. It reports progress through its
//! [`JobContext`] and checks for cancellation between steps; the worker
//! translates the returned [`JobResult`] into a ledger transition.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use docket_core::{Job, JobType};

/// Receives `(percent, step label)`; forwarded to the ledger in call order.
pub type ProgressCallback = Box<dyn Fn(i32, Option<&str>) + Send + Sync>;

/// What a handler sees of its lease.
pub struct JobContext {
    pub job: Job,
    progress_callback: Option<ProgressCallback>,
    cancelled: Arc<AtomicBool>,
}

impl JobContext {
    pub fn new(job: Job) -> Self {
        Self {
            job,
            progress_callback: None,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_progress_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(i32, Option<&str>) + Send + Sync + 'static,
    {
        self.progress_callback = Some(Box::new(callback));
        self
    }

    /// Share a cancellation flag set by the lease heartbeat.
    pub fn with_cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancelled = flag;
        self
    }

    pub fn report_progress(&self, percent: i32, step: Option<&str>) {
        if let Some(ref callback) = self.progress_callback {
            callback(percent, step);
        }
    }

    /// Whether cancellation was requested. Handlers check this at step
    /// boundaries and return [`JobResult::Cancelled`].
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub fn parameters(&self) -> Option<&JsonValue> {
        self.job.parameters.as_ref()
    }
}

/// How a handler finished.
#[derive(Debug, PartialEq)]
pub enum JobResult {
    /// Completed, with an optional reference to the stored result.
    Success(Option<String>),
    /// Permanent failure.
    Failed(String),
    /// Transient failure; retried with backoff while retries remain.
    Retry(String),
    /// Stopped at a step boundary after a cancellation request.
    Cancelled,
}

#[async_trait]
pub trait JobHandler: Send + Sync {
    fn job_type(&self) -> JobType;

    async fn execute(&self, ctx: JobContext) -> JobResult;

    fn can_handle(&self, job_type: JobType) -> bool {
        self.job_type() == job_type
    }
}

/// Two-step handler that produces no result; used to exercise the pool
/// without collaborators.
pub struct NoOpHandler {
    job_type: JobType,
}

impl NoOpHandler {
    pub fn new(job_type: JobType) -> Self {
        Self { job_type }
    }
}

#[async_trait]
impl JobHandler for NoOpHandler {
    fn job_type(&self) -> JobType {
        self.job_type
    }

    async fn execute(&self, ctx: JobContext) -> JobResult {
        ctx.report_progress(50, Some("processing"));
        if ctx.is_cancelled() {
            return JobResult::Cancelled;
        }
        ctx.report_progress(100, Some("done"));
        JobResult::Success(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use chrono::Utc;
    use docket_core::{NewJob, ResourceRequirements};
    use serde_json::json;
    use uuid::Uuid;

    fn job(job_type: JobType) -> Job {
        Job::from_new(
            Uuid::now_v7(),
            NewJob {
                tenant_id: "acme".into(),
                actor_id: "alice".into(),
                job_type,
                document_ref: "doc-1".into(),
                priority: 5,
                resources: ResourceRequirements::default(),
                parameters: Some(json!({"lang": "en"})),
                max_retries: 3,
                dedupe: false,
            },
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn test_noop_handler_reports_progress() {
        let handler = NoOpHandler::new(JobType::Embedding);
        assert!(handler.can_handle(JobType::Embedding));
        assert!(!handler.can_handle(JobType::Ocr));

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let ctx = JobContext::new(job(JobType::Embedding)).with_progress_callback(move |p, _| {
            sink.lock().unwrap().push(p);
        });
        assert_eq!(handler.execute(ctx).await, JobResult::Success(None));
        assert_eq!(*seen.lock().unwrap(), vec![50, 100]);
    }

    #[tokio::test]
    async fn test_noop_handler_honours_cancel_flag() {
        let flag = Arc::new(AtomicBool::new(true));
        let ctx = JobContext::new(job(JobType::Ocr)).with_cancel_flag(flag);
        let result = NoOpHandler::new(JobType::Ocr).execute(ctx).await;
        assert_eq!(result, JobResult::Cancelled);
    }

    #[test]
    fn test_context_exposes_parameters() {
        let ctx = JobContext::new(job(JobType::Ocr));
        assert_eq!(ctx.parameters(), Some(&json!({"lang": "en"})));
        assert!(!ctx.is_cancelled());
    }
}
