//! Alert feed.
//!
//! Every alert that is raised, absorbs new evidence, or changes review status
//! is published on the [`EventBus`]. The notification collaborator and the
//! SSE stream both consume from there.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::info;
use uuid::Uuid;

use docket_core::{
    defaults, AlertCandidate, AlertFilter, AlertRepository, AlertSeverity, AlertStatusUpdate,
    AlertType, Error, EventBus, Result, SecurityAlert, ServerEvent, SharedClock, UpsertOutcome,
};

/// Administrator-raised alert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManualAlertRequest {
    pub severity: AlertSeverity,
    /// Tenant the alert concerns. Defaults to the administrator's tenant.
    #[serde(default)]
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub actor_id: Option<String>,
    pub evidence: JsonValue,
}

#[derive(Clone)]
pub struct AlertService {
    repo: Arc<dyn AlertRepository>,
    events: EventBus,
    clock: SharedClock,
}

impl AlertService {
    pub fn new(repo: Arc<dyn AlertRepository>, events: EventBus, clock: SharedClock) -> Self {
        Self {
            repo,
            events,
            clock,
        }
    }

    /// Store a candidate and publish the result. Unchanged merges are not
    /// published.
    pub async fn raise(
        &self,
        candidate: &AlertCandidate,
        actor_id: &str,
    ) -> Result<(SecurityAlert, UpsertOutcome)> {
        let now = self.clock.now();
        let (alert, outcome) = self.repo.upsert_candidate(candidate, actor_id, now).await?;
        match outcome {
            UpsertOutcome::Created => {
                info!(
                    subsystem = "audit",
                    component = "alerts",
                    alert_id = %alert.id,
                    alert_type = %alert.alert_type,
                    severity = alert.severity.as_str(),
                    tenant_id = %alert.tenant_id,
                    actor_id = alert.actor_id.as_deref().unwrap_or("-"),
                    "Alert raised"
                );
                self.events.emit(ServerEvent::AlertRaised {
                    alert: alert.clone(),
                });
            }
            UpsertOutcome::Updated => {
                info!(
                    subsystem = "audit",
                    component = "alerts",
                    alert_id = %alert.id,
                    evidence_count = alert.evidence_count,
                    "Alert absorbed new evidence"
                );
                self.events.emit(ServerEvent::AlertUpdated {
                    alert: alert.clone(),
                });
            }
            UpsertOutcome::Unchanged => {}
        }
        Ok((alert, outcome))
    }

    /// Raise a MANUAL alert on behalf of an administrator.
    pub async fn raise_manual(
        &self,
        caller_tenant: &str,
        admin_id: &str,
        request: ManualAlertRequest,
    ) -> Result<SecurityAlert> {
        if !request.evidence.is_object() {
            return Err(Error::InvalidInput(
                "evidence must be a JSON object".to_string(),
            ));
        }
        let now = self.clock.now();
        let candidate = AlertCandidate {
            alert_type: AlertType::Manual,
            severity: request.severity,
            tenant_id: request
                .tenant_id
                .unwrap_or_else(|| caller_tenant.to_string()),
            actor_id: request.actor_id,
            evidence: request.evidence,
            evidence_count: 1,
            first_occurrence: now,
            last_occurrence: now,
            window_secs: 0,
        };
        let (alert, _) = self.raise(&candidate, admin_id).await?;
        Ok(alert)
    }

    /// Review transition (OPEN → INVESTIGATING → RESOLVED/FALSE_POSITIVE).
    pub async fn transition(
        &self,
        alert_id: Uuid,
        update: &AlertStatusUpdate,
        actor_id: &str,
    ) -> Result<SecurityAlert> {
        let now = self.clock.now();
        let alert = self.repo.transition(alert_id, update, actor_id, now).await?;
        info!(
            subsystem = "audit",
            component = "alerts",
            alert_id = %alert.id,
            status = %alert.status,
            actor_id,
            "Alert status changed"
        );
        self.events.emit(ServerEvent::AlertUpdated {
            alert: alert.clone(),
        });
        Ok(alert)
    }

    pub async fn get(&self, alert_id: Uuid) -> Result<Option<SecurityAlert>> {
        self.repo.get(alert_id).await
    }

    pub async fn list(&self, mut filter: AlertFilter) -> Result<(Vec<SecurityAlert>, i64)> {
        filter.limit = Some(
            filter
                .limit
                .unwrap_or(defaults::PAGE_LIMIT)
                .clamp(1, defaults::PAGE_LIMIT_MAX),
        );
        filter.offset = Some(filter.offset.unwrap_or(0).max(0));
        self.repo.list(&filter).await
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }
}
