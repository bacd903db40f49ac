//! Audit trail queries and externally reported events.
//!
//! Both directions are confined to the caller's tenant: query filters are
//! rewritten to the caller's tenant and reported events are attributed to it.
//! Reports are limited to AUTHENTICATION and EXTERNAL events, and only an
//! administrator may report on behalf of another actor.

use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Query, State,
    },
    http::StatusCode,
    Json,
};

use docket_audit::ExternalAuditEvent;
use docket_core::{AuditEvent, AuditPage, AuditQuery};

use crate::error::ApiResult;
use crate::identity::Caller;
use crate::state::AppState;

pub async fn query_events(
    State(state): State<AppState>,
    caller: Caller,
    query: Result<Query<AuditQuery>, QueryRejection>,
) -> ApiResult<Json<AuditPage>> {
    let Query(mut query) = query?;
    state.admit(&caller, "audit.query").await?;
    query.tenant_id = Some(caller.tenant_id);
    Ok(Json(state.recorder.query(query).await?))
}

pub async fn record_event(
    State(state): State<AppState>,
    caller: Caller,
    body: Result<Json<ExternalAuditEvent>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<AuditEvent>)> {
    let Json(event) = body?;
    state.admit(&caller, "audit.record").await?;
    let is_admin = caller.is_admin();
    let new = event.into_new(&caller.tenant_id, &caller.actor_id, caller.origin, is_admin)?;
    let stored = state.recorder.record(new).await?;
    Ok((StatusCode::CREATED, Json(stored)))
}
