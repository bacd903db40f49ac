use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};

use docket_core::{
    defaults, AuditAction, AuditCategory, AuditEvent, AuditPage, AuditQuery, AuditRepository,
    Error, NewAuditEvent, Result, Severity,
};

use super::insert_audit;

const SEVERITIES: [Severity; 4] = [
    Severity::Info,
    Severity::Warning,
    Severity::Error,
    Severity::Critical,
];

/// PostgreSQL implementation of AuditRepository.
pub struct PgAuditRepository {
    pool: PgPool,
}

impl PgAuditRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn parse_row(row: PgRow) -> Result<AuditEvent> {
        let severity: String = row.get("severity");
        let category: String = row.get("category");
        let action: String = row.get("action");
        Ok(AuditEvent {
            id: row.get("id"),
            seq: row.get("seq"),
            tenant_id: row.get("tenant_id"),
            actor_id: row.get("actor_id"),
            entity_type: row.get("entity_type"),
            entity_id: row.get("entity_id"),
            action: AuditAction::from(action),
            before: row.get("before"),
            after: row.get("after"),
            changed_fields: row.get("changed_fields"),
            severity: Severity::parse(&severity)
                .ok_or_else(|| Error::Internal(format!("bad severity {severity}")))?,
            category: AuditCategory::parse(&category)
                .ok_or_else(|| Error::Internal(format!("bad category {category}")))?,
            origin: row.get("origin"),
            device: row.get("device"),
            metadata: row.get("metadata"),
            occurred_at: row.get("occurred_at"),
        })
    }

    fn push_filters(qb: &mut QueryBuilder<'_, Postgres>, query: &AuditQuery) {
        qb.push(" WHERE TRUE");
        if let Some(t) = &query.tenant_id {
            qb.push(" AND tenant_id = ").push_bind(t.clone());
        }
        if let Some(t) = &query.entity_type {
            qb.push(" AND entity_type = ").push_bind(t.clone());
        }
        if let Some(i) = &query.entity_id {
            qb.push(" AND entity_id = ").push_bind(i.clone());
        }
        if let Some(a) = &query.actor_id {
            qb.push(" AND actor_id = ").push_bind(a.clone());
        }
        if let Some(c) = query.category {
            qb.push(" AND category = ").push_bind(c.as_str());
        }
        if let Some(a) = &query.action {
            qb.push(" AND action = ").push_bind(a.clone());
        }
        if let Some(min) = query.min_severity {
            let allowed: Vec<String> = SEVERITIES
                .iter()
                .filter(|s| **s >= min)
                .map(|s| s.as_str().to_string())
                .collect();
            qb.push(" AND severity = ANY(").push_bind(allowed).push(")");
        }
        if let Some(since) = query.since {
            qb.push(" AND occurred_at >= ").push_bind(since);
        }
        if let Some(until) = query.until {
            qb.push(" AND occurred_at < ").push_bind(until);
        }
    }
}

#[async_trait]
impl AuditRepository for PgAuditRepository {
    async fn append(&self, event: NewAuditEvent, now: DateTime<Utc>) -> Result<AuditEvent> {
        let mut conn = self.pool.acquire().await.map_err(Error::Database)?;
        insert_audit(&mut *conn, event, now).await
    }

    async fn query(&self, query: &AuditQuery) -> Result<AuditPage> {
        let limit = query
            .limit
            .unwrap_or(defaults::PAGE_LIMIT)
            .clamp(1, defaults::PAGE_LIMIT_MAX);
        let offset = query.offset.unwrap_or(0).max(0);

        let mut count = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM audit_events");
        Self::push_filters(&mut count, query);
        let total: i64 = count
            .build_query_scalar()
            .fetch_one(&self.pool)
            .await
            .map_err(Error::Database)?;

        let mut select = QueryBuilder::<Postgres>::new("SELECT * FROM audit_events");
        Self::push_filters(&mut select, query);
        select
            .push(" ORDER BY seq LIMIT ")
            .push_bind(limit)
            .push(" OFFSET ")
            .push_bind(offset);
        let rows = select
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(Error::Database)?;

        let events = rows
            .into_iter()
            .map(Self::parse_row)
            .collect::<Result<Vec<_>>>()?;
        Ok(AuditPage { events, total })
    }

    async fn scan(
        &self,
        since: DateTime<Utc>,
        after_seq: i64,
        limit: i64,
    ) -> Result<Vec<AuditEvent>> {
        let rows = sqlx::query(
            "SELECT * FROM audit_events
             WHERE seq > $1 AND occurred_at >= $2
             ORDER BY seq
             LIMIT $3",
        )
        .bind(after_seq)
        .bind(since)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;
        rows.into_iter().map(Self::parse_row).collect()
    }

    async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM audit_events WHERE occurred_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(Error::Database)?;
        Ok(result.rows_affected())
    }
}
