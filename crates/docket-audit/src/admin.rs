//! Audited configuration changes.
//!
//! Installs a new [`ConfigSnapshot`](docket_core::ConfigSnapshot) version and
//! records the change. If the audit append fails, the previous snapshot is
//! reinstalled and the change is rejected.

use serde_json::json;
use tokio::sync::Mutex;
use tracing::info;

use docket_core::{
    entity, AuditAction, AuditCategory, ConfigHandle, ConfigSnapshot, Error, EventBus,
    NewAuditEvent, RateLimitPolicy, Result, RetentionPolicy, ServerEvent,
};

use crate::recorder::AuditRecorder;

pub struct ConfigAdmin {
    config: ConfigHandle,
    recorder: AuditRecorder,
    events: EventBus,
    // Serializes update + audit so a rollback never clobbers a newer change.
    write: Mutex<()>,
}

fn validate_rate_limits(policies: &[RateLimitPolicy]) -> Result<()> {
    for p in policies {
        if p.name.trim().is_empty() || p.endpoint_pattern.trim().is_empty() {
            return Err(Error::InvalidInput(
                "rate-limit policies need a name and an endpoint pattern".to_string(),
            ));
        }
        if p.limit.max_requests == 0 || p.limit.window_secs == 0 {
            return Err(Error::InvalidInput(format!(
                "policy {}: max_requests and window_secs must be positive",
                p.name
            )));
        }
        if let Some(penalty) = p.limit.penalty {
            if penalty.multiplier == 0 {
                return Err(Error::InvalidInput(format!(
                    "policy {}: penalty multiplier must be positive",
                    p.name
                )));
            }
        }
    }
    Ok(())
}

impl ConfigAdmin {
    pub fn new(config: ConfigHandle, recorder: AuditRecorder, events: EventBus) -> Self {
        Self {
            config,
            recorder,
            events,
            write: Mutex::new(()),
        }
    }

    pub fn current(&self) -> std::sync::Arc<ConfigSnapshot> {
        self.config.current()
    }

    pub async fn replace_rate_limits(
        &self,
        tenant_id: &str,
        actor_id: &str,
        policies: Vec<RateLimitPolicy>,
    ) -> Result<std::sync::Arc<ConfigSnapshot>> {
        validate_rate_limits(&policies)?;
        self.apply(tenant_id, actor_id, "rate_limits", move |s| {
            s.rate_limits = policies;
            Ok(())
        })
        .await
    }

    pub async fn replace_retention(
        &self,
        tenant_id: &str,
        actor_id: &str,
        retention: RetentionPolicy,
    ) -> Result<std::sync::Arc<ConfigSnapshot>> {
        retention.validate()?;
        self.apply(tenant_id, actor_id, "retention", move |s| {
            s.retention = retention;
            Ok(())
        })
        .await
    }

    async fn apply<F>(
        &self,
        tenant_id: &str,
        actor_id: &str,
        section: &str,
        f: F,
    ) -> Result<std::sync::Arc<ConfigSnapshot>>
    where
        F: FnOnce(&mut ConfigSnapshot) -> Result<()>,
    {
        let _guard = self.write.lock().await;
        let (previous, installed) = self.config.update(f)?;

        let event = NewAuditEvent::new(
            tenant_id,
            actor_id,
            entity::CONFIG,
            section,
            AuditAction::Update,
            AuditCategory::Configuration,
        )
        .with_before(serde_json::to_value(previous.as_ref())?)
        .with_after(serde_json::to_value(installed.as_ref())?)
        .with_metadata(json!({ "section": section, "version": installed.version }));

        if let Err(e) = self.recorder.record(event).await {
            self.config.restore(previous);
            return Err(e);
        }

        info!(
            subsystem = "audit",
            component = "config",
            section,
            version = installed.version,
            actor_id,
            "Configuration updated"
        );
        self.events.emit(ServerEvent::ConfigChanged {
            version: installed.version,
        });
        Ok(installed)
    }
}
