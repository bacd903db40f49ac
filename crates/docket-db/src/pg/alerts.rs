use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, PgPool, Row};
use uuid::Uuid;

use docket_core::{
    changes, defaults, new_v7, AlertCandidate, AlertFilter, AlertRepository, AlertStatusUpdate,
    Error, Result, SecurityAlert, UpsertOutcome,
};

use super::{insert_audit, parse_col};

const ALERT_COLUMNS: &str = "id, alert_type, severity, tenant_id, actor_id, evidence, \
     evidence_count, dedup_key, status, first_occurrence, last_occurrence, created_at, \
     updated_at, resolution_note";

/// PostgreSQL implementation of AlertRepository.
pub struct PgAlertRepository {
    pool: PgPool,
}

impl PgAlertRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn parse_row(row: PgRow) -> Result<SecurityAlert> {
        Ok(SecurityAlert {
            id: row.get("id"),
            alert_type: parse_col(row.get("alert_type"))?,
            severity: parse_col(row.get("severity"))?,
            tenant_id: row.get("tenant_id"),
            actor_id: row.get("actor_id"),
            evidence: row.get("evidence"),
            evidence_count: row.get("evidence_count"),
            dedup_key: row.get("dedup_key"),
            status: parse_col(row.get("status"))?,
            first_occurrence: row.get("first_occurrence"),
            last_occurrence: row.get("last_occurrence"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
            resolution_note: row.get("resolution_note"),
        })
    }

    async fn insert_row(conn: &mut PgConnection, a: &SecurityAlert) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO security_alerts ({ALERT_COLUMNS})
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)"
        ))
        .bind(a.id)
        .bind(a.alert_type.as_str())
        .bind(a.severity.as_str())
        .bind(&a.tenant_id)
        .bind(&a.actor_id)
        .bind(&a.evidence)
        .bind(a.evidence_count)
        .bind(&a.dedup_key)
        .bind(a.status.as_str())
        .bind(a.first_occurrence)
        .bind(a.last_occurrence)
        .bind(a.created_at)
        .bind(a.updated_at)
        .bind(&a.resolution_note)
        .execute(conn)
        .await
        .map_err(Error::Database)?;
        Ok(())
    }

    async fn write_row(conn: &mut PgConnection, a: &SecurityAlert) -> Result<()> {
        sqlx::query(
            "UPDATE security_alerts
             SET severity = $2, evidence = $3, evidence_count = $4, status = $5,
                 last_occurrence = $6, updated_at = $7, resolution_note = $8
             WHERE id = $1",
        )
        .bind(a.id)
        .bind(a.severity.as_str())
        .bind(&a.evidence)
        .bind(a.evidence_count)
        .bind(a.status.as_str())
        .bind(a.last_occurrence)
        .bind(a.updated_at)
        .bind(&a.resolution_note)
        .execute(conn)
        .await
        .map_err(Error::Database)?;
        Ok(())
    }
}

#[async_trait]
impl AlertRepository for PgAlertRepository {
    async fn upsert_candidate(
        &self,
        candidate: &AlertCandidate,
        actor_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(SecurityAlert, UpsertOutcome)> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        let scope = format!(
            "{}|{}|{}",
            candidate.alert_type,
            candidate.tenant_id,
            candidate.actor_id.as_deref().unwrap_or("-")
        );
        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 2))")
            .bind(&scope)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;

        let rows = sqlx::query(&format!(
            "SELECT {ALERT_COLUMNS} FROM security_alerts
             WHERE alert_type = $1 AND tenant_id = $2 AND actor_id IS NOT DISTINCT FROM $3
               AND status IN ('OPEN', 'INVESTIGATING')
             ORDER BY last_occurrence DESC
             FOR UPDATE"
        ))
        .bind(candidate.alert_type.as_str())
        .bind(&candidate.tenant_id)
        .bind(&candidate.actor_id)
        .fetch_all(&mut *tx)
        .await
        .map_err(Error::Database)?;

        let mut absorbing = None;
        for row in rows {
            let alert = Self::parse_row(row)?;
            if alert.absorbs(candidate) {
                absorbing = Some(alert);
                break;
            }
        }

        if let Some(before) = absorbing {
            let mut after = before.clone();
            if !after.absorb(candidate, now) {
                return Ok((before, UpsertOutcome::Unchanged));
            }
            Self::write_row(&mut tx, &after).await?;
            insert_audit(
                &mut tx,
                changes::alert_changed(&before, &after, actor_id, "evidence"),
                now,
            )
            .await?;
            tx.commit().await.map_err(Error::Database)?;
            return Ok((after, UpsertOutcome::Updated));
        }

        let alert = SecurityAlert::from_candidate(new_v7(), candidate, now);
        Self::insert_row(&mut tx, &alert).await?;
        insert_audit(&mut tx, changes::alert_created(&alert, actor_id), now).await?;
        tx.commit().await.map_err(Error::Database)?;
        Ok((alert, UpsertOutcome::Created))
    }

    async fn transition(
        &self,
        alert_id: Uuid,
        update: &AlertStatusUpdate,
        actor_id: &str,
        now: DateTime<Utc>,
    ) -> Result<SecurityAlert> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;
        let row = sqlx::query(&format!(
            "SELECT {ALERT_COLUMNS} FROM security_alerts WHERE id = $1 FOR UPDATE"
        ))
        .bind(alert_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(Error::Database)?
        .ok_or_else(|| Error::NotFound(format!("alert {alert_id}")))?;

        let before = Self::parse_row(row)?;
        let mut after = before.clone();
        after.review(update, now)?;
        Self::write_row(&mut tx, &after).await?;
        insert_audit(
            &mut tx,
            changes::alert_changed(&before, &after, actor_id, update.status.as_str()),
            now,
        )
        .await?;
        tx.commit().await.map_err(Error::Database)?;
        Ok(after)
    }

    async fn get(&self, alert_id: Uuid) -> Result<Option<SecurityAlert>> {
        let row = sqlx::query(&format!(
            "SELECT {ALERT_COLUMNS} FROM security_alerts WHERE id = $1"
        ))
        .bind(alert_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;
        row.map(Self::parse_row).transpose()
    }

    async fn list(&self, filter: &AlertFilter) -> Result<(Vec<SecurityAlert>, i64)> {
        let limit = filter
            .limit
            .unwrap_or(defaults::PAGE_LIMIT)
            .clamp(1, defaults::PAGE_LIMIT_MAX);
        let offset = filter.offset.unwrap_or(0).max(0);
        let where_clause = "WHERE ($1::text IS NULL OR tenant_id = $1)
               AND ($2::text IS NULL OR alert_type = $2)
               AND ($3::text IS NULL OR status = $3)
               AND ($4::text IS NULL OR actor_id = $4)";

        let total: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM security_alerts {where_clause}"
        ))
        .bind(&filter.tenant_id)
        .bind(filter.alert_type.map(|t| t.as_str()))
        .bind(filter.status.map(|s| s.as_str()))
        .bind(&filter.actor_id)
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)?;

        let rows = sqlx::query(&format!(
            "SELECT {ALERT_COLUMNS} FROM security_alerts {where_clause}
             ORDER BY created_at DESC, id DESC
             LIMIT $5 OFFSET $6"
        ))
        .bind(&filter.tenant_id)
        .bind(filter.alert_type.map(|t| t.as_str()))
        .bind(filter.status.map(|s| s.as_str()))
        .bind(&filter.actor_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        let alerts = rows
            .into_iter()
            .map(Self::parse_row)
            .collect::<Result<Vec<_>>>()?;
        Ok((alerts, total))
    }
}
