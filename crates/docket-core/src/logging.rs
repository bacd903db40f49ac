//! Structured logging field names used across docket.
//!
//! `tracing` macros take field names as identifiers, so these constants are
//! the reference list that log queries and dashboards are written against.
//! New fields go here first.
//!
//! Levels:
//!
//! | Level | Meaning in docket |
//! |-------|-------------------|
//! | ERROR | Operator needed: audit append failed, worker pool degraded |
//! | WARN  | Fallback taken: cache write dropped, detector cycle skipped |
//! | INFO  | Job, alert and config state changes; task start and stop |
//! | DEBUG | Lease decisions, policy selection, cache hit or miss |
//! | TRACE | Per-row work inside sweeps and scans |

/// `api`, `db`, `jobs`, `audit`, `cache` or `ratelimit`.
pub const SUBSYSTEM: &str = "subsystem";

/// Long-lived part of a subsystem: `scheduler`, `worker`, `reaper`,
/// `detector`, `sweeper`, `pool`.
pub const COMPONENT: &str = "component";

/// Operation in progress: `submit`, `lease_next`, `reclaim`, `scan`, `sweep`.
pub const OPERATION: &str = "op";

pub const JOB_ID: &str = "job_id";
pub const JOB_TYPE: &str = "job_type";
pub const TENANT_ID: &str = "tenant_id";
pub const ACTOR_ID: &str = "actor_id";
pub const WORKER_ID: &str = "worker_id";
pub const ALERT_ID: &str = "alert_id";

/// Elapsed wall time of the operation.
pub const DURATION_MS: &str = "duration_ms";

/// Rows purged or archived by one sweep batch.
pub const ROWS_AFFECTED: &str = "rows_affected";

pub const SUCCESS: &str = "success";
pub const ERROR_MSG: &str = "error";

/// Every field name above.
pub const FIELDS: &[&str] = &[
    SUBSYSTEM,
    COMPONENT,
    OPERATION,
    JOB_ID,
    JOB_TYPE,
    TENANT_ID,
    ACTOR_ID,
    WORKER_ID,
    ALERT_ID,
    DURATION_MS,
    ROWS_AFFECTED,
    SUCCESS,
    ERROR_MSG,
];

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_field_names_are_unique_snake_case() {
        let unique: HashSet<_> = FIELDS.iter().collect();
        assert_eq!(unique.len(), FIELDS.len());
        for field in FIELDS {
            assert!(
                field
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c == '_'),
                "{field} is not snake_case"
            );
        }
    }
}
