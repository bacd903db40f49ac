//! Worker pool that leases jobs from the scheduler and runs them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use docket_core::{defaults, Error, Job, JobStatus, JobType, WorkerCapabilities};

use crate::handler::{JobContext, JobHandler, JobResult};
use crate::scheduler::Scheduler;

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Prefix for slot worker ids (`<name>-<slot>`).
    pub name: String,
    /// Number of concurrent worker slots.
    pub worker_count: usize,
    /// Memory each slot advertises.
    pub memory_mb: u32,
    /// How many slots (the first ones) own an accelerator.
    pub accelerators: usize,
    /// How long an idle slot waits for work before re-checking shutdown.
    pub poll_interval_ms: u64,
    /// Wall-clock limit for one handler run.
    pub job_timeout_secs: u64,
    pub enabled: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: "worker".to_string(),
            worker_count: defaults::WORKER_COUNT,
            memory_mb: defaults::WORKER_MEMORY_MB,
            accelerators: defaults::WORKER_ACCELERATORS,
            poll_interval_ms: defaults::JOB_POLL_INTERVAL_MS,
            job_timeout_secs: defaults::JOB_TIMEOUT_SECS,
            enabled: true,
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl WorkerConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `JOB_WORKER_ENABLED` | `true` | Enable/disable job processing |
    /// | `WORKER_NAME` | `worker` | Worker id prefix |
    /// | `WORKER_COUNT` | `4` | Concurrent worker slots |
    /// | `WORKER_MEMORY_MB` | `4096` | Memory advertised per slot |
    /// | `WORKER_ACCELERATORS` | `0` | Slots with an accelerator |
    /// | `JOB_POLL_INTERVAL_MS` | `500` | Idle wait between lease attempts |
    /// | `JOB_TIMEOUT_SECS` | `300` | Per-job execution limit |
    pub fn from_env() -> Self {
        let enabled = std::env::var("JOB_WORKER_ENABLED")
            .map(|v| v != "false" && v != "0")
            .unwrap_or(true);

        Self {
            name: std::env::var("WORKER_NAME").unwrap_or_else(|_| "worker".to_string()),
            worker_count: env_parse("WORKER_COUNT", defaults::WORKER_COUNT).max(1),
            memory_mb: env_parse("WORKER_MEMORY_MB", defaults::WORKER_MEMORY_MB),
            accelerators: env_parse("WORKER_ACCELERATORS", defaults::WORKER_ACCELERATORS),
            poll_interval_ms: env_parse("JOB_POLL_INTERVAL_MS", defaults::JOB_POLL_INTERVAL_MS),
            job_timeout_secs: env_parse("JOB_TIMEOUT_SECS", defaults::JOB_TIMEOUT_SECS),
            enabled,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_worker_count(mut self, count: usize) -> Self {
        self.worker_count = count.max(1);
        self
    }

    pub fn with_memory_mb(mut self, memory_mb: u32) -> Self {
        self.memory_mb = memory_mb;
        self
    }

    pub fn with_accelerators(mut self, accelerators: usize) -> Self {
        self.accelerators = accelerators;
        self
    }

    pub fn with_poll_interval(mut self, ms: u64) -> Self {
        self.poll_interval_ms = ms;
        self
    }

    pub fn with_job_timeout(mut self, secs: u64) -> Self {
        self.job_timeout_secs = secs;
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Capabilities advertised by slot `slot`.
    fn capabilities(&self, slot: usize, job_types: &[JobType]) -> WorkerCapabilities {
        WorkerCapabilities::new(
            format!("{}-{slot}", self.name),
            self.memory_mb,
            slot < self.accelerators,
        )
        .with_job_types(job_types.to_vec())
    }
}

/// Event emitted by the worker pool.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    JobStarted {
        job_id: Uuid,
        job_type: JobType,
        worker_id: String,
    },
    JobProgress {
        job_id: Uuid,
        percent: i32,
        message: Option<String>,
    },
    JobCompleted {
        job_id: Uuid,
        job_type: JobType,
    },
    JobFailed {
        job_id: Uuid,
        job_type: JobType,
        error: String,
        will_retry: bool,
    },
    /// Stopped at a step boundary after a cancellation request.
    JobCancelled {
        job_id: Uuid,
        job_type: JobType,
    },
    WorkerStarted,
    WorkerStopped,
}

/// Handle for controlling a running worker pool.
pub struct WorkerHandle {
    shutdown_tx: watch::Sender<bool>,
    event_rx: broadcast::Receiver<WorkerEvent>,
    join: JoinHandle<()>,
}

impl WorkerHandle {
    /// Ask every slot to stop after its current job.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Signal shutdown and wait for in-flight jobs to finish.
    pub async fn stop(self) {
        self.shutdown();
        if let Err(e) = self.join.await {
            error!(subsystem = "jobs", component = "worker", error = ?e, "Worker pool task panicked");
        }
    }

    /// Get a receiver for worker events.
    pub fn events(&self) -> broadcast::Receiver<WorkerEvent> {
        self.event_rx.resubscribe()
    }
}

/// Pool of worker slots. Each slot leases one job at a time.
pub struct JobWorker {
    scheduler: Arc<Scheduler>,
    config: WorkerConfig,
    handlers: HashMap<JobType, Arc<dyn JobHandler>>,
    event_tx: broadcast::Sender<WorkerEvent>,
}

impl JobWorker {
    pub fn new(scheduler: Arc<Scheduler>, config: WorkerConfig) -> Self {
        let (event_tx, _) = broadcast::channel(defaults::EVENT_BUS_CAPACITY);
        Self {
            scheduler,
            config,
            handlers: HashMap::new(),
            event_tx,
        }
    }

    /// Register a handler for a job type, replacing any previous one.
    pub fn register_handler(&mut self, handler: Arc<dyn JobHandler>) {
        let job_type = handler.job_type();
        self.handlers.insert(job_type, handler);
        debug!(subsystem = "jobs", component = "worker", %job_type, "Registered job handler");
    }

    pub fn events(&self) -> broadcast::Receiver<WorkerEvent> {
        self.event_tx.subscribe()
    }

    /// Start every slot and return a handle for control.
    pub fn start(self) -> WorkerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let event_rx = self.event_tx.subscribe();
        let worker = Arc::new(self);
        let join = tokio::spawn(async move { worker.run(shutdown_rx).await });
        WorkerHandle {
            shutdown_tx,
            event_rx,
            join,
        }
    }

    #[instrument(skip_all, fields(subsystem = "jobs", component = "worker"))]
    async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        if !self.config.enabled {
            info!("Job worker is disabled, not starting");
            return;
        }

        let mut job_types: Vec<JobType> = self.handlers.keys().copied().collect();
        job_types.sort_by_key(|t| t.as_str());
        info!(
            slots = self.config.worker_count,
            accelerators = self.config.accelerators,
            memory_mb = self.config.memory_mb,
            ?job_types,
            "Job worker started"
        );
        let _ = self.event_tx.send(WorkerEvent::WorkerStarted);

        let mut slots = JoinSet::new();
        for slot in 0..self.config.worker_count {
            let caps = self.config.capabilities(slot, &job_types);
            let worker = self.clone();
            let shutdown = shutdown.clone();
            slots.spawn(async move { worker.slot_loop(caps, shutdown).await });
        }
        while let Some(result) = slots.join_next().await {
            if let Err(e) = result {
                error!(error = ?e, "Worker slot panicked");
            }
        }

        let _ = self.event_tx.send(WorkerEvent::WorkerStopped);
        info!("Job worker stopped");
    }

    async fn slot_loop(&self, caps: WorkerCapabilities, mut shutdown: watch::Receiver<bool>) {
        let poll = Duration::from_millis(self.config.poll_interval_ms.max(1));
        loop {
            if *shutdown.borrow() {
                break;
            }
            let leased = tokio::select! {
                _ = shutdown.changed() => break,
                leased = self.scheduler.lease_next_wait(&caps, poll) => leased,
            };
            match leased {
                Ok(Some(job)) => self.execute_job(&caps.worker_id, job).await,
                Ok(None) => {}
                Err(e) => {
                    error!(subsystem = "jobs", component = "worker", worker_id = %caps.worker_id, error = %e, "Failed to lease job");
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = tokio::time::sleep(poll) => {}
                    }
                }
            }
        }
        debug!(subsystem = "jobs", component = "worker", worker_id = %caps.worker_id, "Slot stopped");
    }

    /// Heartbeat until `done` fires. Cancellation requests and lost leases
    /// both raise the cancel flag; a lost lease also raises `lost`.
    fn spawn_heartbeat(
        &self,
        job_id: Uuid,
        worker_id: String,
        cancel: Arc<AtomicBool>,
        lost: Arc<AtomicBool>,
        mut done: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let scheduler = self.scheduler.clone();
        let lease_secs = scheduler.config().current().scheduler.lease_secs;
        let period = Duration::from_millis((lease_secs * 1000 / 3).max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = done.changed() => return,
                    _ = ticker.tick() => {}
                }
                match scheduler.heartbeat(job_id, &worker_id).await {
                    Ok(ack) => {
                        if ack.cancel_requested && !cancel.swap(true, Ordering::AcqRel) {
                            info!(subsystem = "jobs", component = "worker", %job_id, "Cancellation requested");
                        }
                    }
                    Err(Error::LeaseLost(_)) => {
                        warn!(subsystem = "jobs", component = "worker", %job_id, %worker_id, "Lease lost, abandoning job");
                        lost.store(true, Ordering::Release);
                        cancel.store(true, Ordering::Release);
                        return;
                    }
                    Err(e) => {
                        warn!(subsystem = "jobs", component = "worker", %job_id, error = %e, "Heartbeat failed");
                    }
                }
            }
        })
    }

    /// Run one leased job to a terminal report.
    async fn execute_job(&self, worker_id: &str, job: Job) {
        let start = Instant::now();
        let job_id = job.id;
        let job_type = job.job_type;

        info!(subsystem = "jobs", component = "worker", %job_id, %job_type, %worker_id, "Processing job");
        let _ = self.event_tx.send(WorkerEvent::JobStarted {
            job_id,
            job_type,
            worker_id: worker_id.to_string(),
        });

        let cancel = Arc::new(AtomicBool::new(job.cancel_requested));
        let lost = Arc::new(AtomicBool::new(false));
        let (done_tx, done_rx) = watch::channel(false);
        let heartbeat = self.spawn_heartbeat(
            job_id,
            worker_id.to_string(),
            cancel.clone(),
            lost.clone(),
            done_rx,
        );

        // Progress is forwarded in order by a single task and drained
        // before the terminal report.
        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel::<(i32, Option<String>)>();
        let forwarder = {
            let scheduler = self.scheduler.clone();
            let event_tx = self.event_tx.clone();
            let worker_id = worker_id.to_string();
            tokio::spawn(async move {
                while let Some((percent, message)) = progress_rx.recv().await {
                    if let Err(e) = scheduler
                        .report_progress(job_id, &worker_id, percent, message.as_deref())
                        .await
                    {
                        debug!(subsystem = "jobs", component = "worker", %job_id, error = %e, "Progress not recorded");
                    }
                    let _ = event_tx.send(WorkerEvent::JobProgress {
                        job_id,
                        percent,
                        message,
                    });
                }
            })
        };

        let result = match self.handlers.get(&job_type).cloned() {
            Some(handler) => {
                let ctx = JobContext::new(job)
                    .with_cancel_flag(cancel.clone())
                    .with_progress_callback(move |percent, message| {
                        let _ = progress_tx.send((percent, message.map(String::from)));
                    });
                let limit = Duration::from_secs(self.config.job_timeout_secs);
                match tokio::time::timeout(limit, handler.execute(ctx)).await {
                    Ok(result) => result,
                    Err(_) => {
                        warn!(subsystem = "jobs", component = "worker", %job_id, %job_type, "Job exceeded timeout of {}s", self.config.job_timeout_secs);
                        JobResult::Retry(format!(
                            "Job exceeded timeout of {}s",
                            self.config.job_timeout_secs
                        ))
                    }
                }
            }
            None => {
                drop(progress_tx);
                warn!(subsystem = "jobs", component = "worker", %job_type, "No handler registered for job type");
                JobResult::Failed(format!("No handler for job type: {job_type}"))
            }
        };

        let _ = done_tx.send(true);
        let _ = heartbeat.await;
        let _ = forwarder.await;

        if lost.load(Ordering::Acquire) {
            warn!(subsystem = "jobs", component = "worker", %job_id, "Result discarded, lease no longer held");
            return;
        }

        let elapsed_ms = start.elapsed().as_millis() as u64;
        match result {
            JobResult::Success(result_ref) => {
                match self
                    .scheduler
                    .complete(job_id, worker_id, result_ref.as_deref())
                    .await
                {
                    Ok(_) => {
                        info!(subsystem = "jobs", component = "worker", %job_id, %job_type, duration_ms = elapsed_ms, "Job completed successfully");
                        let _ = self
                            .event_tx
                            .send(WorkerEvent::JobCompleted { job_id, job_type });
                    }
                    Err(Error::LeaseLost(_)) => {
                        warn!(subsystem = "jobs", component = "worker", %job_id, "Result discarded, lease reclaimed before completion");
                    }
                    Err(e) => {
                        error!(subsystem = "jobs", component = "worker", %job_id, error = %e, "Failed to mark job as completed")
                    }
                }
            }
            JobResult::Cancelled => {
                match self
                    .scheduler
                    .fail(job_id, worker_id, "cancelled", false)
                    .await
                {
                    Ok(_) => {
                        info!(subsystem = "jobs", component = "worker", %job_id, %job_type, "Job cancelled");
                        let _ = self
                            .event_tx
                            .send(WorkerEvent::JobCancelled { job_id, job_type });
                    }
                    Err(e) => {
                        error!(subsystem = "jobs", component = "worker", %job_id, error = %e, "Failed to record cancellation")
                    }
                }
            }
            JobResult::Failed(message) => {
                self.report_failure(worker_id, job_id, job_type, message, false, elapsed_ms)
                    .await
            }
            JobResult::Retry(message) => {
                self.report_failure(worker_id, job_id, job_type, message, true, elapsed_ms)
                    .await
            }
        }
    }

    async fn report_failure(
        &self,
        worker_id: &str,
        job_id: Uuid,
        job_type: JobType,
        message: String,
        retryable: bool,
        elapsed_ms: u64,
    ) {
        match self
            .scheduler
            .fail(job_id, worker_id, &message, retryable)
            .await
        {
            Ok(job) => {
                let will_retry = job.status == JobStatus::Retrying;
                warn!(
                    subsystem = "jobs",
                    component = "worker",
                    %job_id,
                    %job_type,
                    error = %message,
                    will_retry,
                    retry_count = job.retry_count,
                    duration_ms = elapsed_ms,
                    "Job failed"
                );
                let _ = self.event_tx.send(WorkerEvent::JobFailed {
                    job_id,
                    job_type,
                    error: message,
                    will_retry,
                });
            }
            Err(e) => {
                error!(subsystem = "jobs", component = "worker", %job_id, error = %e, "Failed to mark job as failed")
            }
        }
    }
}

/// Builder for creating a worker pool with handlers.
pub struct WorkerBuilder {
    scheduler: Arc<Scheduler>,
    config: WorkerConfig,
    handlers: Vec<Arc<dyn JobHandler>>,
}

impl WorkerBuilder {
    pub fn new(scheduler: Arc<Scheduler>) -> Self {
        Self {
            scheduler,
            config: WorkerConfig::default(),
            handlers: Vec::new(),
        }
    }

    pub fn with_config(mut self, config: WorkerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_handler<H: JobHandler + 'static>(mut self, handler: H) -> Self {
        self.handlers.push(Arc::new(handler));
        self
    }

    pub fn with_handlers<H: JobHandler + 'static>(
        mut self,
        handlers: impl IntoIterator<Item = H>,
    ) -> Self {
        self.handlers
            .extend(handlers.into_iter().map(|h| Arc::new(h) as Arc<dyn JobHandler>));
        self
    }

    pub fn build(self) -> JobWorker {
        let mut worker = JobWorker::new(self.scheduler, self.config);
        for handler in self.handlers {
            worker.register_handler(handler);
        }
        worker
    }
}
