//! Administrative configuration: tenants, rate-limit policies, retention.
//!
//! Every route requires the `admin` role. Configuration replacements are
//! versioned, audited and announced on the event bus by [`ConfigAdmin`].
//!
//! [`ConfigAdmin`]: docket_audit::ConfigAdmin

use axum::{
    extract::{
        rejection::{JsonRejection, PathRejection},
        Path, State,
    },
    Json,
};

use docket_core::{ConfigSnapshot, RateLimitPolicy, RetentionPolicy, Tenant, UpsertTenantRequest};

use crate::error::ApiResult;
use crate::identity::Caller;
use crate::state::AppState;

pub async fn upsert_tenant(
    State(state): State<AppState>,
    caller: Caller,
    id: Result<Path<String>, PathRejection>,
    body: Result<Json<UpsertTenantRequest>, JsonRejection>,
) -> ApiResult<Json<Tenant>> {
    caller.require_admin()?;
    let Path(tenant_id) = id?;
    let Json(request) = body?;
    state.admit(&caller, "admin.tenants").await?;
    let tenant = state
        .tenants
        .upsert(&tenant_id, &request, &caller.actor_id)
        .await?;
    tracing::info!(
        subsystem = "api",
        op = "upsert_tenant",
        tenant_id = %tenant.id,
        version = tenant.version,
        actor_id = %caller.actor_id,
        "Tenant updated"
    );
    Ok(Json(tenant))
}

pub async fn replace_rate_limits(
    State(state): State<AppState>,
    caller: Caller,
    body: Result<Json<Vec<RateLimitPolicy>>, JsonRejection>,
) -> ApiResult<Json<ConfigSnapshot>> {
    caller.require_admin()?;
    let Json(policies) = body?;
    state.admit(&caller, "admin.rate_limits").await?;
    let snapshot = state
        .admin
        .replace_rate_limits(&caller.tenant_id, &caller.actor_id, policies)
        .await?;
    Ok(Json(snapshot.as_ref().clone()))
}

pub async fn replace_retention(
    State(state): State<AppState>,
    caller: Caller,
    body: Result<Json<RetentionPolicy>, JsonRejection>,
) -> ApiResult<Json<ConfigSnapshot>> {
    caller.require_admin()?;
    let Json(retention) = body?;
    state.admit(&caller, "admin.retention").await?;
    let snapshot = state
        .admin
        .replace_retention(&caller.tenant_id, &caller.actor_id, retention)
        .await?;
    Ok(Json(snapshot.as_ref().clone()))
}

pub async fn current_config(
    State(state): State<AppState>,
    caller: Caller,
) -> ApiResult<Json<ConfigSnapshot>> {
    caller.require_admin()?;
    state.admit(&caller, "admin.config").await?;
    Ok(Json(state.admin.current().as_ref().clone()))
}
