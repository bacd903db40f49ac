//! Centralized default constants for docket.
//!
//! **This module is the single source of truth** for shared default values.
//! Crates reference these constants instead of defining their own magic
//! numbers. Organized by component.

// =============================================================================
// JOB LEDGER & SCHEDULER
// =============================================================================

/// Lowest accepted job priority.
pub const JOB_PRIORITY_MIN: i32 = 1;

/// Highest accepted job priority.
pub const JOB_PRIORITY_MAX: i32 = 10;

/// Default maximum retry count for failed jobs.
pub const JOB_MAX_RETRIES: i32 = 3;

/// Lease duration granted on claim and on every heartbeat (seconds).
pub const JOB_LEASE_SECS: u64 = 30;

/// Base delay for retry backoff (milliseconds). Delay = base × 2^retry_count.
pub const JOB_BACKOFF_BASE_MS: u64 = 1_000;

/// Upper bound for retry backoff (milliseconds).
pub const JOB_BACKOFF_MAX_MS: u64 = 5 * 60 * 1_000;

/// Maximum time `lease_next` blocks waiting for a runnable job (milliseconds).
pub const JOB_LEASE_WAIT_MS: u64 = 2_000;

/// Worker poll interval when the queue is empty (milliseconds).
pub const JOB_POLL_INTERVAL_MS: u64 = 500;

/// Default job execution timeout in seconds (5 minutes).
pub const JOB_TIMEOUT_SECS: u64 = 300;

/// Interval between expired-lease reclaim passes (seconds).
pub const JOB_REAPER_INTERVAL_SECS: u64 = 5;

/// Candidates fetched per tenant for one lease decision. Every fetched row
/// already passes the storage-side filters, so each tenant's first row is
/// its best runnable job.
pub const LEASE_CANDIDATES_PER_TENANT: i64 = 8;

// =============================================================================
// WORKER POOL
// =============================================================================

/// Default number of workers in the pool.
pub const WORKER_COUNT: usize = 4;

/// Default memory budget declared by each worker (MiB).
pub const WORKER_MEMORY_MB: u32 = 4_096;

/// Default number of workers that hold an exclusive accelerator.
pub const WORKER_ACCELERATORS: usize = 0;

// =============================================================================
// TENANTS
// =============================================================================

/// Default per-tenant concurrent job ceiling.
pub const TENANT_MAX_CONCURRENT_JOBS: u32 = 4;

/// Default per-tenant requests per minute.
pub const TENANT_MAX_REQUESTS_PER_MINUTE: u32 = 120;

/// Default per-tenant requests per hour.
pub const TENANT_MAX_REQUESTS_PER_HOUR: u32 = 3_000;

/// Default per-tenant storage ceiling (bytes, 10 GiB).
pub const TENANT_MAX_STORAGE_BYTES: u64 = 10 * 1024 * 1024 * 1024;

/// How long a worker-local tenant snapshot stays fresh (seconds).
pub const TENANT_REFRESH_SECS: u64 = 30;

// =============================================================================
// RATE LIMITING
// =============================================================================

/// Default rate limit: max requests per window.
pub const RATE_LIMIT_REQUESTS: u32 = 100;

/// Default rate limit: window length in seconds.
pub const RATE_LIMIT_WINDOW_SECS: u64 = 60;

/// Default block applied once a window is exceeded (seconds).
pub const RATE_LIMIT_BLOCK_SECS: u64 = 60;

/// Progressive penalty multiplier for repeated violations.
pub const RATE_LIMIT_PENALTY_MULTIPLIER: u32 = 2;

/// Rolling period in which violations count as repeated (seconds).
pub const RATE_LIMIT_PENALTY_PERIOD_SECS: u64 = 3_600;

/// Cap on a progressively increased block (seconds).
pub const RATE_LIMIT_MAX_BLOCK_SECS: u64 = 24 * 3_600;

/// Coarse process-wide limiter: requests per period.
pub const GLOBAL_RATE_LIMIT_REQUESTS: u64 = 1_000;

/// Coarse process-wide limiter: period in seconds.
pub const GLOBAL_RATE_LIMIT_PERIOD_SECS: u64 = 1;

// =============================================================================
// ADAPTIVE CACHE
// =============================================================================

/// Retention for results with confidence >= 0.9 (7 days).
pub const CACHE_TTL_HIGH_SECS: u64 = 7 * 24 * 3_600;

/// Retention for results with confidence >= 0.8 (1 day).
pub const CACHE_TTL_MEDIUM_SECS: u64 = 24 * 3_600;

/// Retention for results with confidence >= 0.7 (1 hour).
pub const CACHE_TTL_LOW_SECS: u64 = 3_600;

/// Retention for results below 0.7 confidence: a dedup window only.
pub const CACHE_TTL_DEDUP_SECS: u64 = 60;

/// How long a second caller waits for an in-flight computation (milliseconds).
pub const CACHE_INFLIGHT_WAIT_MS: u64 = 5_000;

/// Capacity of the cache audit channel.
pub const CACHE_AUDIT_BUFFER: usize = 1_024;

// =============================================================================
// ANOMALY DETECTION
// =============================================================================

/// Failed authentications per actor that constitute brute force.
pub const DETECT_BRUTE_FORCE_THRESHOLD: usize = 5;

/// Brute-force trailing window (seconds).
pub const DETECT_BRUTE_FORCE_WINDOW_SECS: i64 = 15 * 60;

/// Distinct network origins (or devices) per actor that constitute churn.
pub const DETECT_ORIGIN_THRESHOLD: usize = 3;

/// Origin churn trailing window (seconds).
pub const DETECT_ORIGIN_WINDOW_SECS: i64 = 3_600;

/// Pipeline failure ratio that raises an operational alert.
pub const DETECT_FAILURE_RATE_THRESHOLD: f64 = 0.5;

/// Minimum terminal job outcomes before the failure rate is evaluated.
pub const DETECT_FAILURE_RATE_MIN_SAMPLES: usize = 10;

/// Failure-rate trailing window (seconds).
pub const DETECT_FAILURE_RATE_WINDOW_SECS: i64 = 3_600;

/// Detector scan cadence (seconds).
pub const DETECT_INTERVAL_SECS: u64 = 180;

// =============================================================================
// RETENTION
// =============================================================================

/// Audit events older than this are purged (7 years).
pub const RETENTION_AUDIT_DAYS: i64 = 7 * 365;

/// Rate-limit windows idle longer than this are purged (seconds).
pub const RETENTION_RATE_WINDOW_TTL_SECS: i64 = 24 * 3_600;

/// Sessions idle longer than this are purged (seconds).
pub const RETENTION_SESSION_IDLE_SECS: i64 = 30 * 60;

/// Sessions older than this are purged regardless of activity (seconds).
pub const RETENTION_SESSION_ABSOLUTE_SECS: i64 = 12 * 3_600;

/// Terminal jobs idle longer than this are archived (days).
pub const RETENTION_ARCHIVE_DAYS: i64 = 90;

/// Sweeper cadence (seconds).
pub const SWEEP_INTERVAL_SECS: u64 = 3_600;

/// Leader lease held by the active sweeper (seconds).
pub const SWEEP_LOCK_TTL_SECS: i64 = 600;

// =============================================================================
// SERVER & EVENTS
// =============================================================================

/// Default HTTP server port.
pub const SERVER_PORT: u16 = 3000;

/// Default event bus broadcast channel capacity.
pub const EVENT_BUS_CAPACITY: usize = 256;

/// Default page size for list endpoints.
pub const PAGE_LIMIT: i64 = 50;

/// Largest page a caller may request.
pub const PAGE_LIMIT_MAX: i64 = 500;

/// Internal "fetch everything" limit for scans.
pub const INTERNAL_FETCH_LIMIT: i64 = 10_000;

/// Timeout for collaborator HTTP requests (seconds).
pub const COLLABORATOR_TIMEOUT_SECS: u64 = 60;
