use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

use docket_core::{CacheEntry, CacheRepository, Error, NewCacheEntry, Result};

/// PostgreSQL implementation of CacheRepository.
pub struct PgCacheRepository {
    pool: PgPool,
}

impl PgCacheRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn parse_row(row: PgRow) -> CacheEntry {
        CacheEntry {
            tenant_id: row.get("tenant_id"),
            key: row.get("key"),
            payload: row.get("payload"),
            confidence: row.get("confidence"),
            hit_count: row.get("hit_count"),
            created_at: row.get("created_at"),
            expires_at: row.get("expires_at"),
            last_hit_at: row.get("last_hit_at"),
        }
    }
}

#[async_trait]
impl CacheRepository for PgCacheRepository {
    async fn get(
        &self,
        tenant_id: &str,
        key: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<CacheEntry>> {
        // Hit accounting only; expires_at is never touched on read.
        let row = sqlx::query(
            "UPDATE cache_entries
             SET hit_count = hit_count + 1,
                 last_hit_at = GREATEST(COALESCE(last_hit_at, $3), $3)
             WHERE tenant_id = $1 AND key = $2 AND expires_at > $3
             RETURNING tenant_id, key, payload, confidence, hit_count, created_at, expires_at,
                       last_hit_at",
        )
        .bind(tenant_id)
        .bind(key)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(row.map(Self::parse_row))
    }

    async fn put(&self, entry: NewCacheEntry) -> Result<CacheEntry> {
        let row = sqlx::query(
            "INSERT INTO cache_entries
                 (tenant_id, key, payload, confidence, hit_count, created_at, expires_at)
             VALUES ($1, $2, $3, $4, 0, $5, $6)
             ON CONFLICT (tenant_id, key) DO UPDATE
             SET payload = EXCLUDED.payload,
                 confidence = EXCLUDED.confidence,
                 hit_count = 0,
                 created_at = EXCLUDED.created_at,
                 expires_at = EXCLUDED.expires_at,
                 last_hit_at = NULL
             RETURNING tenant_id, key, payload, confidence, hit_count, created_at, expires_at,
                       last_hit_at",
        )
        .bind(&entry.tenant_id)
        .bind(&entry.key)
        .bind(&entry.payload)
        .bind(entry.confidence)
        .bind(entry.created_at)
        .bind(entry.expires_at)
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(Self::parse_row(row))
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM cache_entries WHERE expires_at <= $1")
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(Error::Database)?;
        Ok(result.rows_affected())
    }
}
