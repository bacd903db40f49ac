//! Security alert feed: listing, manual alerts, review transitions and the
//! live SSE stream.

use std::convert::Infallible;
use std::time::Duration;

use axum::{
    extract::{
        rejection::{JsonRejection, PathRejection, QueryRejection},
        Path, Query, State,
    },
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use futures::Stream;
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use tokio_stream::{wrappers::BroadcastStream, StreamExt as _};
use uuid::Uuid;

use docket_audit::ManualAlertRequest;
use docket_core::{
    AlertFilter, AlertStatus, AlertStatusUpdate, AlertType, Error, EventEnvelope, SecurityAlert,
};

use crate::error::ApiResult;
use crate::identity::Caller;
use crate::state::AppState;

const KEEPALIVE_SECS: u64 = 15;

#[derive(Debug, Default, Deserialize)]
pub struct ListAlertsParams {
    /// Honoured for administrators only.
    pub tenant_id: Option<String>,
    pub alert_type: Option<AlertType>,
    pub status: Option<AlertStatus>,
    pub actor_id: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

pub async fn list_alerts(
    State(state): State<AppState>,
    caller: Caller,
    params: Result<Query<ListAlertsParams>, QueryRejection>,
) -> ApiResult<Json<JsonValue>> {
    let Query(params) = params?;
    state.admit(&caller, "alerts.list").await?;
    let tenant_id = if caller.is_admin() {
        params.tenant_id
    } else {
        Some(caller.tenant_id)
    };
    let (alerts, total) = state
        .alerts
        .list(AlertFilter {
            tenant_id,
            alert_type: params.alert_type,
            status: params.status,
            actor_id: params.actor_id,
            limit: params.limit,
            offset: params.offset,
        })
        .await?;
    Ok(Json(json!({ "alerts": alerts, "total": total })))
}

pub async fn raise_alert(
    State(state): State<AppState>,
    caller: Caller,
    body: Result<Json<ManualAlertRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<SecurityAlert>)> {
    let Json(request) = body?;
    caller.require_admin()?;
    state.admit(&caller, "alerts.raise").await?;
    let alert = state
        .alerts
        .raise_manual(&caller.tenant_id, &caller.actor_id, request)
        .await?;
    Ok((StatusCode::CREATED, Json(alert)))
}

/// Alerts of other tenants are reported as missing unless the caller is an
/// administrator.
pub async fn update_alert(
    State(state): State<AppState>,
    caller: Caller,
    id: Result<Path<Uuid>, PathRejection>,
    body: Result<Json<AlertStatusUpdate>, JsonRejection>,
) -> ApiResult<Json<SecurityAlert>> {
    let Path(alert_id) = id?;
    let Json(update) = body?;
    state.admit(&caller, "alerts.update").await?;
    match state.alerts.get(alert_id).await? {
        Some(alert) if caller.is_admin() || alert.tenant_id == caller.tenant_id => {}
        _ => return Err(Error::NotFound(format!("alert {alert_id}")).into()),
    }
    let alert = state
        .alerts
        .transition(alert_id, &update, &caller.actor_id)
        .await?;
    Ok(Json(alert))
}

fn visible_to(caller: &Caller, envelope: &EventEnvelope) -> bool {
    envelope.payload.is_alert()
        && (caller.is_admin() || envelope.payload.tenant_id() == Some(caller.tenant_id.as_str()))
}

/// Live alert feed. Each SSE event is named after the envelope's event type
/// and carries the envelope as JSON.
pub async fn alert_stream(
    State(state): State<AppState>,
    caller: Caller,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    state.admit(&caller, "alerts.stream").await?;
    let rx = state.events.subscribe();
    tracing::debug!(
        subsystem = "api",
        tenant_id = %caller.tenant_id,
        actor_id = %caller.actor_id,
        "Alert stream opened"
    );

    let stream = BroadcastStream::new(rx).filter_map(move |result| match result {
        Ok(envelope) if visible_to(&caller, &envelope) => serde_json::to_string(&envelope)
            .ok()
            .map(|json| Ok(Event::default().event(envelope.event_type).data(json))),
        // Lagged receivers skip ahead.
        _ => None,
    });

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(KEEPALIVE_SECS))
            .text("keepalive"),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use docket_core::ServerEvent;

    fn caller(tenant: &str, role: Option<&str>) -> Caller {
        Caller {
            tenant_id: tenant.into(),
            actor_id: "alice".into(),
            role: role.map(String::from),
            origin: None,
        }
    }

    #[test]
    fn test_stream_filters_non_alert_and_foreign_events() {
        let job = EventEnvelope::new(ServerEvent::JobStatusChanged {
            job_id: Uuid::nil(),
            tenant_id: "acme".into(),
            status: docket_core::JobStatus::Running,
            retry_count: 0,
        });
        let config = EventEnvelope::new(ServerEvent::ConfigChanged { version: 3 });
        assert!(!visible_to(&caller("acme", None), &job));
        assert!(!visible_to(&caller("acme", Some("admin")), &config));
    }

    #[test]
    fn test_stream_scopes_alerts_by_tenant() {
        let now = chrono::Utc::now();
        let candidate = docket_core::AlertCandidate {
            alert_type: AlertType::Manual,
            severity: docket_core::AlertSeverity::High,
            tenant_id: "globex".into(),
            actor_id: None,
            evidence: json!({"note": "credential leak"}),
            evidence_count: 1,
            first_occurrence: now,
            last_occurrence: now,
            window_secs: 0,
        };
        let raised = EventEnvelope::new(ServerEvent::AlertRaised {
            alert: SecurityAlert::from_candidate(Uuid::now_v7(), &candidate, now),
        });
        assert!(visible_to(&caller("globex", None), &raised));
        assert!(!visible_to(&caller("acme", None), &raised));
        assert!(visible_to(&caller("acme", Some("admin")), &raised));
    }
}
