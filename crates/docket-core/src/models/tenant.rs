//! Tenant registry models.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::defaults;

/// Resource quotas for a tenant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantQuota {
    /// Jobs the tenant may hold RUNNING at once.
    pub max_concurrent_jobs: u32,
    /// API requests per minute across all of the tenant's actors.
    pub max_requests_per_minute: u32,
    /// API requests per hour across all of the tenant's actors.
    pub max_requests_per_hour: u32,
    /// Storage ceiling enforced by the storage collaborator.
    pub max_storage_bytes: u64,
}

impl Default for TenantQuota {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: defaults::TENANT_MAX_CONCURRENT_JOBS,
            max_requests_per_minute: defaults::TENANT_MAX_REQUESTS_PER_MINUTE,
            max_requests_per_hour: defaults::TENANT_MAX_REQUESTS_PER_HOUR,
            max_storage_bytes: defaults::TENANT_MAX_STORAGE_BYTES,
        }
    }
}

/// An isolated customer/organization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tenant {
    pub id: String,
    pub name: String,
    pub quota: TenantQuota,
    /// Enabled feature flags (e.g. `ocr`, `ai_analysis`).
    pub features: BTreeSet<String>,
    /// Incremented on every administrative change.
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Tenant {
    /// Whether the tenant has the given feature enabled.
    pub fn has_feature(&self, feature: &str) -> bool {
        self.features.contains(feature)
    }
}

/// Administrative create-or-update request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpsertTenantRequest {
    pub name: String,
    #[serde(default)]
    pub quota: TenantQuota,
    #[serde(default)]
    pub features: BTreeSet<String>,
}
