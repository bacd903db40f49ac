//! Tenant registry.
//!
//! Read-mostly local copy of the tenant table, refreshed on the clock every
//! `refresh` interval. A miss falls through to the store once, so a tenant
//! created on another node is visible before the next refresh.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::RwLock;
use tracing::debug;

use docket_core::{
    defaults, Error, Result, SharedClock, Tenant, TenantRepository, UpsertTenantRequest,
};

#[derive(Default)]
struct Snapshot {
    tenants: HashMap<String, Tenant>,
    loaded_at: Option<DateTime<Utc>>,
}

pub struct TenantRegistry {
    repo: Arc<dyn TenantRepository>,
    clock: SharedClock,
    refresh: Duration,
    snapshot: RwLock<Snapshot>,
}

impl TenantRegistry {
    pub fn new(repo: Arc<dyn TenantRepository>, clock: SharedClock) -> Self {
        Self::with_refresh(
            repo,
            clock,
            Duration::seconds(defaults::TENANT_REFRESH_SECS as i64),
        )
    }

    pub fn with_refresh(
        repo: Arc<dyn TenantRepository>,
        clock: SharedClock,
        refresh: Duration,
    ) -> Self {
        Self {
            repo,
            clock,
            refresh,
            snapshot: RwLock::new(Snapshot::default()),
        }
    }

    async fn ensure_fresh(&self) -> Result<()> {
        let now = self.clock.now();
        {
            let snap = self.snapshot.read().await;
            if snap.loaded_at.is_some_and(|t| now - t < self.refresh) {
                return Ok(());
            }
        }
        let tenants = self.repo.list().await?;
        let mut snap = self.snapshot.write().await;
        snap.tenants = tenants.into_iter().map(|t| (t.id.clone(), t)).collect();
        snap.loaded_at = Some(now);
        debug!(
            subsystem = "jobs",
            component = "tenants",
            count = snap.tenants.len(),
            "Tenant registry refreshed"
        );
        Ok(())
    }

    /// The tenant, if registered.
    pub async fn find(&self, tenant_id: &str) -> Result<Option<Tenant>> {
        self.ensure_fresh().await?;
        if let Some(t) = self.snapshot.read().await.tenants.get(tenant_id) {
            return Ok(Some(t.clone()));
        }
        let found = self.repo.get(tenant_id).await?;
        if let Some(t) = &found {
            self.snapshot
                .write()
                .await
                .tenants
                .insert(t.id.clone(), t.clone());
        }
        Ok(found)
    }

    /// The tenant, or `TenantNotFound`.
    pub async fn get(&self, tenant_id: &str) -> Result<Tenant> {
        self.find(tenant_id)
            .await?
            .ok_or_else(|| Error::TenantNotFound(tenant_id.to_string()))
    }

    pub async fn list(&self) -> Result<Vec<Tenant>> {
        self.ensure_fresh().await?;
        let mut all: Vec<Tenant> = self
            .snapshot
            .read()
            .await
            .tenants
            .values()
            .cloned()
            .collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(all)
    }

    /// `max_concurrent_jobs` per known tenant, for lease decisions.
    pub async fn concurrency_limits(&self) -> Result<HashMap<String, u32>> {
        self.ensure_fresh().await?;
        Ok(self
            .snapshot
            .read()
            .await
            .tenants
            .values()
            .map(|t| (t.id.clone(), t.quota.max_concurrent_jobs))
            .collect())
    }

    /// Administrative create/update. The local copy is updated at once.
    pub async fn upsert(
        &self,
        tenant_id: &str,
        request: &UpsertTenantRequest,
        actor_id: &str,
    ) -> Result<Tenant> {
        if tenant_id.trim().is_empty() || request.name.trim().is_empty() {
            return Err(Error::InvalidInput(
                "tenant id and name are required".to_string(),
            ));
        }
        let now = self.clock.now();
        let tenant = self.repo.upsert(tenant_id, request, actor_id, now).await?;
        self.snapshot
            .write()
            .await
            .tenants
            .insert(tenant.id.clone(), tenant.clone());
        Ok(tenant)
    }
}
