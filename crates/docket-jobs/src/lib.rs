//! # docket-jobs
//!
//! Runtime services of the docket job queue.
//!
//! This crate provides:
//! - [`Scheduler`]: validated submission, leasing with fairness, heartbeats,
//!   retries and the expired-lease reaper
//! - [`RateLimiter`]: per-actor sliding windows plus tenant quotas
//! - [`AdaptiveCache`]: confidence-driven result cache with single-flight
//!   computation
//! - [`JobWorker`]: slot-based worker pool with progress and cancellation
//! - HTTP clients for the document storage and processing collaborators
//!
//! ## Example
//!
//! ```ignore
//! use docket_jobs::{WorkerBuilder, WorkerConfig, NoOpHandler};
//! use docket_core::JobType;
//!
//! let worker = WorkerBuilder::new(scheduler.clone())
//!     .with_config(WorkerConfig::default().with_worker_count(2))
//!     .with_handler(NoOpHandler::new(JobType::Embedding))
//!     .build();
//!
//! let handle = worker.start();
//! let mut events = handle.events();
//! while let Ok(event) = events.recv().await {
//!     println!("Event: {:?}", event);
//! }
//! handle.stop().await;
//! ```

pub mod cache;
pub mod collaborators;
pub mod document_handler;
pub mod handler;
pub mod rate_limiter;
pub mod scheduler;
pub mod tenants;
pub mod worker;

pub use cache::{AdaptiveCache, CacheOutcome};
pub use collaborators::{
    CollaboratorConfig, DocumentStore, HttpDocumentStore, HttpProcessor, ProcessRequest,
    ProcessingOutput, Processor,
};
pub use document_handler::DocumentProcessingHandler;
pub use handler::{JobContext, JobHandler, JobResult, NoOpHandler};
pub use rate_limiter::{RateLimiter, ENDPOINT_SUBMIT};
pub use scheduler::Scheduler;
pub use tenants::TenantRegistry;
pub use worker::{JobWorker, WorkerBuilder, WorkerConfig, WorkerEvent, WorkerHandle};
