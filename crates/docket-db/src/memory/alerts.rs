use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use docket_core::{
    changes, defaults, new_v7, AlertCandidate, AlertFilter, AlertRepository, AlertStatusUpdate,
    Error, Result, SecurityAlert, UpsertOutcome,
};

use super::{lock, MemoryAuditLog};

pub struct MemoryAlertRepository {
    alerts: Mutex<HashMap<Uuid, SecurityAlert>>,
    audit: Arc<MemoryAuditLog>,
}

impl MemoryAlertRepository {
    pub fn new(audit: Arc<MemoryAuditLog>) -> Self {
        Self {
            alerts: Mutex::new(HashMap::new()),
            audit,
        }
    }
}

#[async_trait]
impl AlertRepository for MemoryAlertRepository {
    async fn upsert_candidate(
        &self,
        candidate: &AlertCandidate,
        actor_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(SecurityAlert, UpsertOutcome)> {
        let mut alerts = lock(&self.alerts);

        let absorbing = alerts
            .values()
            .filter(|a| a.absorbs(candidate))
            .max_by_key(|a| a.last_occurrence)
            .cloned();

        if let Some(before) = absorbing {
            let mut after = before.clone();
            if !after.absorb(candidate, now) {
                return Ok((before, UpsertOutcome::Unchanged));
            }
            self.audit
                .record(changes::alert_changed(&before, &after, actor_id, "evidence"), now)?;
            alerts.insert(after.id, after.clone());
            return Ok((after, UpsertOutcome::Updated));
        }

        let alert = SecurityAlert::from_candidate(new_v7(), candidate, now);
        self.audit.record(changes::alert_created(&alert, actor_id), now)?;
        alerts.insert(alert.id, alert.clone());
        Ok((alert, UpsertOutcome::Created))
    }

    async fn transition(
        &self,
        alert_id: Uuid,
        update: &AlertStatusUpdate,
        actor_id: &str,
        now: DateTime<Utc>,
    ) -> Result<SecurityAlert> {
        let mut alerts = lock(&self.alerts);
        let before = alerts
            .get(&alert_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("alert {alert_id}")))?;
        let mut after = before.clone();
        after.review(update, now)?;
        self.audit.record(
            changes::alert_changed(&before, &after, actor_id, update.status.as_str()),
            now,
        )?;
        alerts.insert(alert_id, after.clone());
        Ok(after)
    }

    async fn get(&self, alert_id: Uuid) -> Result<Option<SecurityAlert>> {
        Ok(lock(&self.alerts).get(&alert_id).cloned())
    }

    async fn list(&self, filter: &AlertFilter) -> Result<(Vec<SecurityAlert>, i64)> {
        let limit = filter
            .limit
            .unwrap_or(defaults::PAGE_LIMIT)
            .clamp(1, defaults::PAGE_LIMIT_MAX) as usize;
        let offset = filter.offset.unwrap_or(0).max(0) as usize;

        let alerts = lock(&self.alerts);
        let mut matching: Vec<&SecurityAlert> =
            alerts.values().filter(|a| filter.matches(a)).collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        let total = matching.len() as i64;
        Ok((
            matching.into_iter().skip(offset).take(limit).cloned().collect(),
            total,
        ))
    }
}
