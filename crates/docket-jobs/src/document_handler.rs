//! Document processing pipeline.
//!
//! fetch → fingerprint → cache lookup → process on miss → store result.
//! Cancellation is checked between steps, never in the middle of one.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, warn};

use docket_core::{cache_policy, Error, JobType};

use crate::cache::AdaptiveCache;
use crate::collaborators::{DocumentStore, ProcessRequest, Processor};
use crate::handler::{JobContext, JobHandler, JobResult};

pub struct DocumentProcessingHandler {
    job_type: JobType,
    store: Arc<dyn DocumentStore>,
    processor: Arc<dyn Processor>,
    cache: Arc<AdaptiveCache>,
}

impl DocumentProcessingHandler {
    pub fn new(
        job_type: JobType,
        store: Arc<dyn DocumentStore>,
        processor: Arc<dyn Processor>,
        cache: Arc<AdaptiveCache>,
    ) -> Self {
        Self {
            job_type,
            store,
            processor,
            cache,
        }
    }

    /// One handler per job type, sharing collaborators and cache.
    pub fn for_all_types(
        store: Arc<dyn DocumentStore>,
        processor: Arc<dyn Processor>,
        cache: Arc<AdaptiveCache>,
    ) -> Vec<Self> {
        JobType::ALL
            .iter()
            .map(|t| Self::new(*t, store.clone(), processor.clone(), cache.clone()))
            .collect()
    }
}

fn failure(step: &str, e: Error) -> JobResult {
    let message = format!("{step}: {e}");
    if e.is_retryable() {
        JobResult::Retry(message)
    } else {
        JobResult::Failed(message)
    }
}

#[async_trait]
impl JobHandler for DocumentProcessingHandler {
    fn job_type(&self) -> JobType {
        self.job_type
    }

    async fn execute(&self, ctx: JobContext) -> JobResult {
        let job = &ctx.job;

        ctx.report_progress(5, Some("fetching document"));
        let bytes = match self.store.fetch(&job.tenant_id, &job.document_ref).await {
            Ok(b) => b,
            Err(e) => return failure("fetch", e),
        };
        if ctx.is_cancelled() {
            return JobResult::Cancelled;
        }

        let fingerprint = cache_policy::content_fingerprint(&bytes);
        let key = cache_policy::cache_key(&fingerprint, job.job_type, job.parameters.as_ref());
        ctx.report_progress(25, Some("checking cache"));

        let processor = self.processor.clone();
        let request = ProcessRequest {
            tenant_id: &job.tenant_id,
            job_type: job.job_type,
            document: &bytes,
            parameters: job.parameters.as_ref(),
        };
        let outcome = match self
            .cache
            .get_or_compute(&job.tenant_id, &job.actor_id, &key, || async move {
                let out = processor.process(request).await?;
                Ok((out.payload, out.confidence))
            })
            .await
        {
            Ok(o) => o,
            Err(e) => return failure("process", e),
        };
        debug!(
            subsystem = "jobs",
            component = "handler",
            job_id = %job.id,
            cache_hit = outcome.hit,
            confidence = outcome.confidence,
            "Document processed"
        );
        ctx.report_progress(
            75,
            Some(if outcome.hit { "served from cache" } else { "processed" }),
        );
        if ctx.is_cancelled() {
            return JobResult::Cancelled;
        }

        let result = json!({
            "job_type": job.job_type,
            "fingerprint": fingerprint,
            "confidence": outcome.confidence,
            "cached": outcome.hit,
            "payload": outcome.payload,
        });
        match self.store.put_result(&job.tenant_id, job.id, &result).await {
            Ok(result_ref) => {
                ctx.report_progress(100, Some("stored"));
                JobResult::Success(Some(result_ref))
            }
            Err(e) => {
                warn!(subsystem = "jobs", component = "handler", job_id = %job.id, error = %e, "Failed to store result");
                failure("store", e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use chrono::Utc;
    use docket_core::{ConfigHandle, Job, ManualClock, NewJob, ResourceRequirements, Result};
    use docket_db::Database;
    use serde_json::Value as JsonValue;
    use uuid::Uuid;

    use crate::collaborators::ProcessingOutput;

    #[derive(Default)]
    struct FakeStore {
        missing: bool,
        stored: Mutex<Vec<JsonValue>>,
    }

    #[async_trait]
    impl DocumentStore for FakeStore {
        async fn fetch(&self, _tenant_id: &str, document_ref: &str) -> Result<Vec<u8>> {
            if self.missing {
                return Err(Error::NotFound(document_ref.to_string()));
            }
            Ok(b"%PDF-1.7 fake".to_vec())
        }

        async fn put_result(&self, _: &str, job_id: Uuid, result: &JsonValue) -> Result<String> {
            self.stored.lock().unwrap().push(result.clone());
            Ok(format!("results/{job_id}"))
        }
    }

    struct FakeProcessor {
        calls: AtomicUsize,
        transient: bool,
    }

    #[async_trait]
    impl Processor for FakeProcessor {
        async fn process(&self, _: ProcessRequest<'_>) -> Result<ProcessingOutput> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.transient {
                return Err(Error::Processing("upstream 503".into()));
            }
            Ok(ProcessingOutput {
                payload: json!({"text": "hello"}),
                confidence: 0.92,
            })
        }
    }

    fn job() -> Job {
        Job::from_new(
            Uuid::now_v7(),
            NewJob {
                tenant_id: "acme".into(),
                actor_id: "alice".into(),
                job_type: JobType::TextExtraction,
                document_ref: "doc-1".into(),
                priority: 5,
                resources: ResourceRequirements::default(),
                parameters: None,
                max_retries: 3,
                dedupe: false,
            },
            Utc::now(),
        )
    }

    fn handler(store: Arc<FakeStore>, processor: Arc<FakeProcessor>) -> DocumentProcessingHandler {
        let db = Database::in_memory();
        let cache = Arc::new(AdaptiveCache::new(
            db.cache.clone(),
            db.audit.clone(),
            ConfigHandle::default(),
            Arc::new(ManualClock::starting_now()),
        ));
        DocumentProcessingHandler::new(JobType::TextExtraction, store, processor, cache)
    }

    #[tokio::test]
    async fn test_second_run_is_served_from_cache() {
        let store = Arc::new(FakeStore::default());
        let processor = Arc::new(FakeProcessor {
            calls: AtomicUsize::new(0),
            transient: false,
        });
        let h = handler(store.clone(), processor.clone());

        let first = h.execute(JobContext::new(job())).await;
        assert!(matches!(first, JobResult::Success(Some(_))));
        let second = h.execute(JobContext::new(job())).await;
        assert!(matches!(second, JobResult::Success(Some(_))));

        assert_eq!(processor.calls.load(Ordering::SeqCst), 1);
        let stored = store.stored.lock().unwrap();
        assert_eq!(stored[0]["cached"], false);
        assert_eq!(stored[1]["cached"], true);
        assert_eq!(stored[1]["payload"], json!({"text": "hello"}));
    }

    #[tokio::test]
    async fn test_missing_document_fails_permanently() {
        let store = Arc::new(FakeStore {
            missing: true,
            ..Default::default()
        });
        let processor = Arc::new(FakeProcessor {
            calls: AtomicUsize::new(0),
            transient: false,
        });
        let result = handler(store, processor).execute(JobContext::new(job())).await;
        assert!(matches!(result, JobResult::Failed(_)));
    }

    #[tokio::test]
    async fn test_transient_processor_error_retries() {
        let processor = Arc::new(FakeProcessor {
            calls: AtomicUsize::new(0),
            transient: true,
        });
        let result = handler(Arc::new(FakeStore::default()), processor)
            .execute(JobContext::new(job()))
            .await;
        assert!(matches!(result, JobResult::Retry(_)));
    }

    #[tokio::test]
    async fn test_cancel_between_steps() {
        let processor = Arc::new(FakeProcessor {
            calls: AtomicUsize::new(0),
            transient: false,
        });
        let flag = Arc::new(std::sync::atomic::AtomicBool::new(true));
        let ctx = JobContext::new(job()).with_cancel_flag(flag);
        let result = handler(Arc::new(FakeStore::default()), processor.clone())
            .execute(ctx)
            .await;
        assert_eq!(result, JobResult::Cancelled);
        assert_eq!(processor.calls.load(Ordering::SeqCst), 0);
    }
}
