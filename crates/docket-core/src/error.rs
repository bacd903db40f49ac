//! Error types for docket.

use thiserror::Error;
use uuid::Uuid;

/// Result type alias using docket's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification of an error, used for propagation decisions.
///
/// | Kind | Handling |
/// |------|----------|
/// | `Admission` | Rejected synchronously, surfaced to the caller with a reason code |
/// | `Transient` | Retried internally with backoff, surfaced only after exhaustion |
/// | `Permanent` | Fails immediately without retry |
/// | `Durability` | Aborts the triggering operation (audit write failed) |
/// | `Internal` | Unexpected condition, logged and surfaced as a server error |
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Admission,
    Transient,
    Permanent,
    Durability,
    Internal,
}

/// Core error type for docket operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation failed (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Job not found (or not visible to the calling tenant)
    #[error("Job not found: {0}")]
    JobNotFound(Uuid),

    /// Tenant is not registered
    #[error("Tenant not found: {0}")]
    TenantNotFound(String),

    /// Malformed submission or argument
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Rate limiter denied the request
    #[error("Rate limited: {reason} (retry after {retry_after_secs}s)")]
    RateLimited {
        retry_after_secs: u64,
        reason: String,
    },

    /// Tenant quota exceeded
    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),

    /// Tenant does not have the feature required by the operation
    #[error("Feature disabled: {0}")]
    FeatureDisabled(String),

    /// Illegal state machine transition
    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    /// The worker no longer owns the job lease
    #[error("Lease lost for job {0}")]
    LeaseLost(Uuid),

    /// Audit event could not be durably written
    #[error("Audit write failed: {0}")]
    AuditWrite(String),

    /// External processing collaborator failed
    #[error("Processing error: {0}")]
    Processing(String),

    /// HTTP/network request failed
    #[error("Request error: {0}")]
    Request(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// File I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Classify this error for propagation.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidInput(_)
            | Error::RateLimited { .. }
            | Error::QuotaExceeded(_)
            | Error::FeatureDisabled(_)
            | Error::TenantNotFound(_) => ErrorKind::Admission,
            Error::Database(_) | Error::Request(_) | Error::Io(_) | Error::Processing(_) => {
                ErrorKind::Transient
            }
            Error::NotFound(_)
            | Error::JobNotFound(_)
            | Error::InvalidTransition { .. }
            | Error::LeaseLost(_)
            | Error::Serialization(_) => ErrorKind::Permanent,
            Error::AuditWrite(_) => ErrorKind::Durability,
            Error::Config(_) | Error::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether a job failing with this error should be retried.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    /// Stable snake_case reason code surfaced to API callers.
    pub fn reason_code(&self) -> &'static str {
        match self {
            Error::Database(_) => "database_error",
            Error::NotFound(_) => "not_found",
            Error::JobNotFound(_) => "job_not_found",
            Error::TenantNotFound(_) => "unknown_tenant",
            Error::InvalidInput(_) => "invalid_input",
            Error::RateLimited { .. } => "rate_limit_exceeded",
            Error::QuotaExceeded(_) => "quota_exceeded",
            Error::FeatureDisabled(_) => "feature_disabled",
            Error::InvalidTransition { .. } => "invalid_transition",
            Error::LeaseLost(_) => "lease_lost",
            Error::AuditWrite(_) => "audit_write_failed",
            Error::Processing(_) => "processing_error",
            Error::Request(_) => "request_error",
            Error::Serialization(_) => "serialization_error",
            Error::Config(_) => "config_error",
            Error::Internal(_) => "internal_error",
            Error::Io(_) => "io_error",
        }
    }

    /// Build an `InvalidTransition` from any displayable states.
    pub fn transition(from: impl std::fmt::Display, to: impl std::fmt::Display) -> Self {
        Error::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Request(e.to_string())
    }
}
