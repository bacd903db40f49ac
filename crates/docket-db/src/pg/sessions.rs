use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use docket_core::{changes, new_v7, Error, Result, Session, SessionRepository};

use super::insert_audit;

/// PostgreSQL implementation of SessionRepository.
pub struct PgSessionRepository {
    pool: PgPool,
}

impl PgSessionRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn parse_row(row: PgRow) -> Session {
        Session {
            id: row.get("id"),
            tenant_id: row.get("tenant_id"),
            actor_id: row.get("actor_id"),
            origin: row.get("origin"),
            device: row.get("device"),
            created_at: row.get("created_at"),
            last_seen_at: row.get("last_seen_at"),
        }
    }
}

#[async_trait]
impl SessionRepository for PgSessionRepository {
    async fn create(
        &self,
        tenant_id: &str,
        actor_id: &str,
        origin: Option<&str>,
        device: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Session> {
        let session = Session {
            id: new_v7(),
            tenant_id: tenant_id.to_string(),
            actor_id: actor_id.to_string(),
            origin: origin.map(str::to_string),
            device: device.map(str::to_string),
            created_at: now,
            last_seen_at: now,
        };
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;
        sqlx::query(
            "INSERT INTO sessions (id, tenant_id, actor_id, origin, device, created_at, last_seen_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(session.id)
        .bind(&session.tenant_id)
        .bind(&session.actor_id)
        .bind(&session.origin)
        .bind(&session.device)
        .bind(session.created_at)
        .bind(session.last_seen_at)
        .execute(&mut *tx)
        .await
        .map_err(Error::Database)?;
        insert_audit(&mut tx, changes::session_opened(&session), now).await?;
        tx.commit().await.map_err(Error::Database)?;
        Ok(session)
    }

    async fn touch(&self, tenant_id: &str, session_id: Uuid, now: DateTime<Utc>) -> Result<Session> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;
        let before = sqlx::query(
            "SELECT id, tenant_id, actor_id, origin, device, created_at, last_seen_at
             FROM sessions WHERE id = $1 AND tenant_id = $2 FOR UPDATE",
        )
        .bind(session_id)
        .bind(tenant_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(Error::Database)?
        .map(Self::parse_row)
        .ok_or_else(|| Error::NotFound(format!("session {session_id}")))?;

        let mut after = before.clone();
        after.last_seen_at = now;
        sqlx::query("UPDATE sessions SET last_seen_at = $2 WHERE id = $1")
            .bind(session_id)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;
        insert_audit(&mut tx, changes::session_touched(&before, &after), now).await?;
        tx.commit().await.map_err(Error::Database)?;
        Ok(after)
    }

    async fn get(&self, session_id: Uuid) -> Result<Option<Session>> {
        let row = sqlx::query(
            "SELECT id, tenant_id, actor_id, origin, device, created_at, last_seen_at
             FROM sessions WHERE id = $1",
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(row.map(Self::parse_row))
    }

    async fn purge_stale(
        &self,
        idle_before: DateTime<Utc>,
        created_before: DateTime<Utc>,
    ) -> Result<u64> {
        let result =
            sqlx::query("DELETE FROM sessions WHERE last_seen_at < $1 OR created_at < $2")
                .bind(idle_before)
                .bind(created_before)
                .execute(&self.pool)
                .await
                .map_err(Error::Database)?;
        Ok(result.rows_affected())
    }
}
