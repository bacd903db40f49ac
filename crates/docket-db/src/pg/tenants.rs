use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

use docket_core::{
    changes, Error, Result, Tenant, TenantQuota, TenantRepository, UpsertTenantRequest,
};

use super::insert_audit;

const TENANT_COLUMNS: &str = "id, name, max_concurrent_jobs, max_requests_per_minute, \
     max_requests_per_hour, max_storage_bytes, features, version, created_at, updated_at";

/// PostgreSQL implementation of TenantRepository.
pub struct PgTenantRepository {
    pool: PgPool,
}

impl PgTenantRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn parse_row(row: PgRow) -> Tenant {
        let features: Vec<String> = row.get("features");
        let concurrent: i32 = row.get("max_concurrent_jobs");
        let per_minute: i32 = row.get("max_requests_per_minute");
        let per_hour: i32 = row.get("max_requests_per_hour");
        let storage: i64 = row.get("max_storage_bytes");
        Tenant {
            id: row.get("id"),
            name: row.get("name"),
            quota: TenantQuota {
                max_concurrent_jobs: concurrent.max(0) as u32,
                max_requests_per_minute: per_minute.max(0) as u32,
                max_requests_per_hour: per_hour.max(0) as u32,
                max_storage_bytes: storage.max(0) as u64,
            },
            features: features.into_iter().collect::<BTreeSet<_>>(),
            version: row.get("version"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        }
    }
}

#[async_trait]
impl TenantRepository for PgTenantRepository {
    async fn get(&self, tenant_id: &str) -> Result<Option<Tenant>> {
        let row = sqlx::query(&format!("SELECT {TENANT_COLUMNS} FROM tenants WHERE id = $1"))
            .bind(tenant_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?;
        Ok(row.map(Self::parse_row))
    }

    async fn list(&self) -> Result<Vec<Tenant>> {
        let rows = sqlx::query(&format!("SELECT {TENANT_COLUMNS} FROM tenants ORDER BY id"))
            .fetch_all(&self.pool)
            .await
            .map_err(Error::Database)?;
        Ok(rows.into_iter().map(Self::parse_row).collect())
    }

    async fn upsert(
        &self,
        tenant_id: &str,
        request: &UpsertTenantRequest,
        actor_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Tenant> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 3))")
            .bind(tenant_id)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;

        let before = sqlx::query(&format!(
            "SELECT {TENANT_COLUMNS} FROM tenants WHERE id = $1 FOR UPDATE"
        ))
        .bind(tenant_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(Error::Database)?
        .map(Self::parse_row);

        let after = Tenant {
            id: tenant_id.to_string(),
            name: request.name.clone(),
            quota: request.quota.clone(),
            features: request.features.clone(),
            version: before.as_ref().map_or(1, |t| t.version + 1),
            created_at: before.as_ref().map_or(now, |t| t.created_at),
            updated_at: now,
        };
        let features: Vec<String> = after.features.iter().cloned().collect();

        sqlx::query(&format!(
            "INSERT INTO tenants ({TENANT_COLUMNS})
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
             ON CONFLICT (id) DO UPDATE
             SET name = EXCLUDED.name,
                 max_concurrent_jobs = EXCLUDED.max_concurrent_jobs,
                 max_requests_per_minute = EXCLUDED.max_requests_per_minute,
                 max_requests_per_hour = EXCLUDED.max_requests_per_hour,
                 max_storage_bytes = EXCLUDED.max_storage_bytes,
                 features = EXCLUDED.features,
                 version = EXCLUDED.version,
                 updated_at = EXCLUDED.updated_at"
        ))
        .bind(&after.id)
        .bind(&after.name)
        .bind(after.quota.max_concurrent_jobs as i32)
        .bind(after.quota.max_requests_per_minute as i32)
        .bind(after.quota.max_requests_per_hour as i32)
        .bind(after.quota.max_storage_bytes.min(i64::MAX as u64) as i64)
        .bind(&features)
        .bind(after.version)
        .bind(after.created_at)
        .bind(after.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(Error::Database)?;

        insert_audit(
            &mut tx,
            changes::tenant_upserted(before.as_ref(), &after, actor_id),
            now,
        )
        .await?;
        tx.commit().await.map_err(Error::Database)?;
        Ok(after)
    }
}
