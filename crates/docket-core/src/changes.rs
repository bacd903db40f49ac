//! Audit events for tenant, alert, session and rate-limit mutations.
//!
//! Job events are built by [`crate::ledger`]. Backends append these inside the
//! critical section of the mutation they describe.

use serde_json::{json, Value as JsonValue};

use crate::models::{
    action, entity, AlertSeverity, AuditAction, AuditCategory, NewAuditEvent, RateLimitWindow,
    SecurityAlert, Session, Severity, Tenant,
};

fn to_json<T: serde::Serialize>(value: &T) -> JsonValue {
    serde_json::to_value(value).unwrap_or(JsonValue::Null)
}

pub fn tenant_upserted(before: Option<&Tenant>, after: &Tenant, actor_id: &str) -> NewAuditEvent {
    let action = if before.is_some() {
        AuditAction::Update
    } else {
        AuditAction::Create
    };
    let mut event = NewAuditEvent::new(
        after.id.clone(),
        actor_id,
        entity::TENANT,
        after.id.clone(),
        action,
        AuditCategory::Configuration,
    )
    .with_after(to_json(after));
    if let Some(before) = before {
        event = event.with_before(to_json(before));
    }
    event
}

fn alert_severity(s: AlertSeverity) -> Severity {
    match s {
        AlertSeverity::Low | AlertSeverity::Medium => Severity::Warning,
        AlertSeverity::High => Severity::Error,
        AlertSeverity::Critical => Severity::Critical,
    }
}

pub fn alert_created(alert: &SecurityAlert, actor_id: &str) -> NewAuditEvent {
    NewAuditEvent::new(
        alert.tenant_id.clone(),
        actor_id,
        entity::ALERT,
        alert.id.to_string(),
        AuditAction::Create,
        AuditCategory::Security,
    )
    .with_after(alert.snapshot())
    .with_severity(alert_severity(alert.severity))
}

pub fn alert_changed(
    before: &SecurityAlert,
    after: &SecurityAlert,
    actor_id: &str,
    change: &str,
) -> NewAuditEvent {
    NewAuditEvent::new(
        after.tenant_id.clone(),
        actor_id,
        entity::ALERT,
        after.id.to_string(),
        AuditAction::Update,
        AuditCategory::Security,
    )
    .with_before(before.snapshot())
    .with_after(after.snapshot())
    .with_metadata(json!({ "change": change }))
}

pub fn session_opened(session: &Session) -> NewAuditEvent {
    NewAuditEvent::new(
        session.tenant_id.clone(),
        session.actor_id.clone(),
        entity::SESSION,
        session.id.to_string(),
        AuditAction::Create,
        AuditCategory::Session,
    )
    .with_after(to_json(session))
    .with_origin(session.origin.clone())
    .with_device(session.device.clone())
}

pub fn session_touched(before: &Session, after: &Session) -> NewAuditEvent {
    NewAuditEvent::new(
        after.tenant_id.clone(),
        after.actor_id.clone(),
        entity::SESSION,
        after.id.to_string(),
        AuditAction::Update,
        AuditCategory::Session,
    )
    .with_before(to_json(before))
    .with_after(to_json(after))
    .with_origin(after.origin.clone())
    .with_device(after.device.clone())
}

/// A window entered a block.
pub fn rate_limit_blocked(
    before: Option<&RateLimitWindow>,
    after: &RateLimitWindow,
    tenant_id: &str,
    actor_id: &str,
) -> NewAuditEvent {
    let mut event = NewAuditEvent::new(
        tenant_id,
        actor_id,
        entity::RATE_LIMIT_WINDOW,
        after.key.display(),
        AuditAction::custom(action::BLOCKED),
        AuditCategory::RateLimit,
    )
    .with_after(to_json(after))
    .with_severity(Severity::Warning)
    .with_metadata(json!({
        "endpoint": after.key.endpoint,
        "request_count": after.request_count,
        "violation_count": after.violation_count,
        "blocked_until": after.blocked_until,
    }));
    if let Some(before) = before {
        event = event.with_before(to_json(before));
    }
    event
}
