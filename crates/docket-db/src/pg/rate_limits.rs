use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

use docket_core::{
    changes, rate_window, Error, RateDecision, RateLimit, RateLimitRepository, RateLimitWindow,
    Result, WindowKey,
};

use super::insert_audit;

/// PostgreSQL implementation of RateLimitRepository.
///
/// Each check takes a transaction-scoped advisory lock on the window key, so
/// increments for one key are linearized even when the row does not exist yet.
pub struct PgRateLimitRepository {
    pool: PgPool,
}

impl PgRateLimitRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn parse_row(key: &WindowKey, row: PgRow) -> RateLimitWindow {
        RateLimitWindow {
            key: key.clone(),
            window_start: row.get("window_start"),
            request_count: row.get("request_count"),
            blocked_until: row.get("blocked_until"),
            violation_count: row.get("violation_count"),
            last_violation_at: row.get("last_violation_at"),
            updated_at: row.get("updated_at"),
        }
    }
}

#[async_trait]
impl RateLimitRepository for PgRateLimitRepository {
    async fn check_and_increment(
        &self,
        key: &WindowKey,
        limit: &RateLimit,
        tenant_id: &str,
        actor_id: &str,
        now: DateTime<Utc>,
    ) -> Result<RateDecision> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 1))")
            .bind(key.display())
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;

        let existing = sqlx::query(
            "SELECT window_start, request_count, blocked_until, violation_count,
                    last_violation_at, updated_at
             FROM rate_limit_windows
             WHERE actor_key = $1 AND endpoint = $2 AND window_secs = $3",
        )
        .bind(&key.actor_key)
        .bind(&key.endpoint)
        .bind(key.window_secs)
        .fetch_optional(&mut *tx)
        .await
        .map_err(Error::Database)?
        .map(|row| Self::parse_row(key, row));

        let outcome = rate_window::evaluate(existing.as_ref(), key, limit, now);
        let w = &outcome.window;

        sqlx::query(
            "INSERT INTO rate_limit_windows
                 (actor_key, endpoint, window_secs, window_start, request_count, blocked_until,
                  violation_count, last_violation_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
             ON CONFLICT (actor_key, endpoint, window_secs) DO UPDATE
             SET window_start = EXCLUDED.window_start,
                 request_count = EXCLUDED.request_count,
                 blocked_until = EXCLUDED.blocked_until,
                 violation_count = EXCLUDED.violation_count,
                 last_violation_at = EXCLUDED.last_violation_at,
                 updated_at = EXCLUDED.updated_at",
        )
        .bind(&key.actor_key)
        .bind(&key.endpoint)
        .bind(key.window_secs)
        .bind(w.window_start)
        .bind(w.request_count)
        .bind(w.blocked_until)
        .bind(w.violation_count)
        .bind(w.last_violation_at)
        .bind(w.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(Error::Database)?;

        if outcome.newly_blocked {
            let event = changes::rate_limit_blocked(existing.as_ref(), w, tenant_id, actor_id);
            insert_audit(&mut tx, event, now).await?;
        }

        tx.commit().await.map_err(Error::Database)?;
        Ok(outcome.decision)
    }

    async fn get(&self, key: &WindowKey) -> Result<Option<RateLimitWindow>> {
        let row = sqlx::query(
            "SELECT window_start, request_count, blocked_until, violation_count,
                    last_violation_at, updated_at
             FROM rate_limit_windows
             WHERE actor_key = $1 AND endpoint = $2 AND window_secs = $3",
        )
        .bind(&key.actor_key)
        .bind(&key.endpoint)
        .bind(key.window_secs)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(row.map(|row| Self::parse_row(key, row)))
    }

    async fn purge_idle(&self, idle_before: DateTime<Utc>, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM rate_limit_windows
             WHERE updated_at < $1 AND (blocked_until IS NULL OR blocked_until <= $2)",
        )
        .bind(idle_before)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(result.rows_affected())
    }
}
