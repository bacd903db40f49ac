//! Audit recorder.
//!
//! Entity mutations inside the storage backends append their own events in
//! the same critical section. The recorder is the entry point for everything
//! else: authentication outcomes reported by the front door, configuration
//! changes, sweeper summaries and audit queries.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{debug, warn};

use docket_core::{
    action, defaults, entity, AuditAction, AuditCategory, AuditEvent, AuditPage, AuditQuery,
    AuditRepository, Error, NewAuditEvent, Result, Severity, SharedClock,
};

/// An event reported by an external collaborator (usually the front door).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalAuditEvent {
    pub entity_type: String,
    pub entity_id: String,
    pub action: String,
    pub category: AuditCategory,
    /// Actor the event is about. Defaults to the reporting caller; only an
    /// administrative reporter may name someone else.
    #[serde(default)]
    pub actor_id: Option<String>,
    #[serde(default)]
    pub severity: Option<Severity>,
    #[serde(default)]
    pub before: Option<JsonValue>,
    #[serde(default)]
    pub after: Option<JsonValue>,
    #[serde(default)]
    pub device: Option<String>,
    #[serde(default)]
    pub metadata: Option<JsonValue>,
}

impl ExternalAuditEvent {
    /// Attribute the event to `tenant_id`, validating its shape.
    ///
    /// Only AUTHENTICATION and EXTERNAL events are accepted, so reports can
    /// never imitate job, cache, rate-limit, security, configuration,
    /// session or sweeper events.
    pub fn into_new(
        self,
        tenant_id: &str,
        caller_id: &str,
        origin: Option<String>,
        caller_is_admin: bool,
    ) -> Result<NewAuditEvent> {
        if !self.category.is_externally_reportable() {
            return Err(Error::InvalidInput(format!(
                "category {} cannot be reported externally",
                self.category.as_str()
            )));
        }
        if self.entity_type.trim().is_empty() || self.entity_id.trim().is_empty() {
            return Err(Error::InvalidInput(
                "entity_type and entity_id are required".to_string(),
            ));
        }
        if self.action.trim().is_empty() {
            return Err(Error::InvalidInput("action is required".to_string()));
        }
        let actor = match self.actor_id {
            Some(subject) if subject != caller_id && !caller_is_admin => {
                return Err(Error::InvalidInput(
                    "actor_id may only name another actor for administrative reporters"
                        .to_string(),
                ));
            }
            Some(subject) => subject,
            None => caller_id.to_string(),
        };
        let mut event = NewAuditEvent::new(
            tenant_id,
            actor,
            self.entity_type,
            self.entity_id,
            AuditAction::from(self.action),
            self.category,
        )
        .with_severity(self.severity.unwrap_or(Severity::Info))
        .with_origin(origin)
        .with_device(self.device);
        if let Some(before) = self.before {
            event = event.with_before(before);
        }
        if let Some(after) = self.after {
            event = event.with_after(after);
        }
        if let Some(metadata) = self.metadata {
            event = event.with_metadata(metadata);
        }
        Ok(event)
    }
}

/// Durable append path plus read-only queries.
#[derive(Clone)]
pub struct AuditRecorder {
    repo: Arc<dyn AuditRepository>,
    clock: SharedClock,
}

impl AuditRecorder {
    pub fn new(repo: Arc<dyn AuditRepository>, clock: SharedClock) -> Self {
        Self { repo, clock }
    }

    /// Append `event`. Returns only after the event is durable; a failure is
    /// reported as `Error::AuditWrite`.
    pub async fn record(&self, event: NewAuditEvent) -> Result<AuditEvent> {
        let now = self.clock.now();
        match self.repo.append(event, now).await {
            Ok(stored) => {
                debug!(
                    subsystem = "audit",
                    component = "recorder",
                    seq = stored.seq,
                    entity_type = %stored.entity_type,
                    action = %stored.action,
                    "Audit event recorded"
                );
                Ok(stored)
            }
            Err(Error::AuditWrite(msg)) => {
                warn!(subsystem = "audit", component = "recorder", error = %msg, "Audit append failed");
                Err(Error::AuditWrite(msg))
            }
            Err(e) => {
                warn!(subsystem = "audit", component = "recorder", error = %e, "Audit append failed");
                Err(Error::AuditWrite(e.to_string()))
            }
        }
    }

    /// Before/after change record for an arbitrary entity.
    #[allow(clippy::too_many_arguments)]
    pub async fn record_change(
        &self,
        tenant_id: &str,
        actor_id: &str,
        entity_type: &str,
        entity_id: &str,
        action: AuditAction,
        category: AuditCategory,
        before: Option<JsonValue>,
        after: Option<JsonValue>,
    ) -> Result<AuditEvent> {
        let mut event =
            NewAuditEvent::new(tenant_id, actor_id, entity_type, entity_id, action, category);
        event.before = before;
        event.after = after;
        self.record(event).await
    }

    /// Authentication outcome reported by the front door. Failures feed the
    /// brute-force rule.
    pub async fn record_auth(
        &self,
        tenant_id: &str,
        actor_id: &str,
        succeeded: bool,
        origin: Option<String>,
        device: Option<String>,
    ) -> Result<AuditEvent> {
        let (name, severity) = if succeeded {
            (action::LOGIN_SUCCEEDED, Severity::Info)
        } else {
            (action::LOGIN_FAILED, Severity::Warning)
        };
        let event = NewAuditEvent::new(
            tenant_id,
            actor_id,
            entity::AUTH,
            actor_id,
            AuditAction::custom(name),
            AuditCategory::Authentication,
        )
        .with_severity(severity)
        .with_origin(origin)
        .with_device(device);
        self.record(event).await
    }

    /// Paginated, filtered read. The page size is clamped to the allowed
    /// range.
    pub async fn query(&self, mut query: AuditQuery) -> Result<AuditPage> {
        query.limit = Some(
            query
                .limit
                .unwrap_or(defaults::PAGE_LIMIT)
                .clamp(1, defaults::PAGE_LIMIT_MAX),
        );
        query.offset = Some(query.offset.unwrap_or(0).max(0));
        self.repo.query(&query).await
    }

    pub fn repository(&self) -> &Arc<dyn AuditRepository> {
        &self.repo
    }
}
