use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::PgPool;

use docket_core::{Error, LeaderLock, Result};

/// Leader leases stored in `leader_leases`. A lease is taken over only when
/// its holder matches or its deadline has passed.
pub struct PgLeaderLock {
    pool: PgPool,
}

impl PgLeaderLock {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LeaderLock for PgLeaderLock {
    async fn try_acquire(
        &self,
        name: &str,
        holder: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let acquired: Option<String> = sqlx::query_scalar(
            "INSERT INTO leader_leases (name, holder, expires_at)
             VALUES ($1, $2, $3)
             ON CONFLICT (name) DO UPDATE
             SET holder = EXCLUDED.holder, expires_at = EXCLUDED.expires_at
             WHERE leader_leases.holder = EXCLUDED.holder OR leader_leases.expires_at <= $4
             RETURNING name",
        )
        .bind(name)
        .bind(holder)
        .bind(now + ttl)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(acquired.is_some())
    }

    async fn release(&self, name: &str, holder: &str) -> Result<()> {
        sqlx::query("DELETE FROM leader_leases WHERE name = $1 AND holder = $2")
            .bind(name)
            .bind(holder)
            .execute(&self.pool)
            .await
            .map_err(Error::Database)?;
        Ok(())
    }
}
