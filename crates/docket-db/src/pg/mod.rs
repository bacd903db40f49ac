//! PostgreSQL storage backend.
//!
//! Every mutation runs in one transaction: the entity row is locked
//! (`FOR UPDATE` or a transaction-scoped advisory lock), the shared policy
//! function from `docket-core` decides the new state, the row is written and
//! the audit event is inserted before `COMMIT`. A failed audit insert drops
//! the transaction, so the mutation never becomes visible.

mod alerts;
mod audit;
mod cache;
mod jobs;
mod locks;
mod rate_limits;
mod sessions;
mod tenants;

use std::str::FromStr;

use chrono::{DateTime, Utc};
use sqlx::PgConnection;

use docket_core::{new_v7, AuditEvent, Error, NewAuditEvent, Result};

pub use alerts::PgAlertRepository;
pub use audit::PgAuditRepository;
pub use cache::PgCacheRepository;
pub use jobs::PgJobRepository;
pub use locks::PgLeaderLock;
pub use rate_limits::PgRateLimitRepository;
pub use sessions::PgSessionRepository;
pub use tenants::PgTenantRepository;

/// Insert one audit event on `conn` (normally an open transaction).
pub(crate) async fn insert_audit(
    conn: &mut PgConnection,
    event: NewAuditEvent,
    now: DateTime<Utc>,
) -> Result<AuditEvent> {
    let mut event = event.into_event(new_v7(), 0, now);
    let seq: i64 = sqlx::query_scalar(
        "INSERT INTO audit_events
             (id, tenant_id, actor_id, entity_type, entity_id, action, before, after,
              changed_fields, severity, category, origin, device, metadata, occurred_at)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
         RETURNING seq",
    )
    .bind(event.id)
    .bind(&event.tenant_id)
    .bind(&event.actor_id)
    .bind(&event.entity_type)
    .bind(&event.entity_id)
    .bind(event.action.as_str())
    .bind(&event.before)
    .bind(&event.after)
    .bind(&event.changed_fields)
    .bind(event.severity.as_str())
    .bind(event.category.as_str())
    .bind(&event.origin)
    .bind(&event.device)
    .bind(&event.metadata)
    .bind(event.occurred_at)
    .fetch_one(conn)
    .await
    .map_err(|e| Error::AuditWrite(e.to_string()))?;
    event.seq = seq;
    Ok(event)
}

/// Parse a text column into a domain enum.
pub(crate) fn parse_col<T: FromStr<Err = Error>>(value: String) -> Result<T> {
    value.parse()
}
