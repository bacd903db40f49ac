use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use docket_core::{changes, Result, Tenant, TenantRepository, UpsertTenantRequest};

use super::{lock, MemoryAuditLog};

pub struct MemoryTenantRepository {
    tenants: Mutex<HashMap<String, Tenant>>,
    audit: Arc<MemoryAuditLog>,
}

impl MemoryTenantRepository {
    pub fn new(audit: Arc<MemoryAuditLog>) -> Self {
        Self {
            tenants: Mutex::new(HashMap::new()),
            audit,
        }
    }
}

#[async_trait]
impl TenantRepository for MemoryTenantRepository {
    async fn get(&self, tenant_id: &str) -> Result<Option<Tenant>> {
        Ok(lock(&self.tenants).get(tenant_id).cloned())
    }

    async fn list(&self) -> Result<Vec<Tenant>> {
        let mut all: Vec<Tenant> = lock(&self.tenants).values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(all)
    }

    async fn upsert(
        &self,
        tenant_id: &str,
        request: &UpsertTenantRequest,
        actor_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Tenant> {
        let mut tenants = lock(&self.tenants);
        let before = tenants.get(tenant_id).cloned();
        let after = Tenant {
            id: tenant_id.to_string(),
            name: request.name.clone(),
            quota: request.quota.clone(),
            features: request.features.clone(),
            version: before.as_ref().map_or(1, |t| t.version + 1),
            created_at: before.as_ref().map_or(now, |t| t.created_at),
            updated_at: now,
        };
        self.audit
            .record(changes::tenant_upserted(before.as_ref(), &after, actor_id), now)?;
        tenants.insert(after.id.clone(), after.clone());
        Ok(after)
    }
}
