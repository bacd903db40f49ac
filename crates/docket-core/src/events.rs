//! Server events and the in-process event bus.
//!
//! The bus fans out job lifecycle changes and alert feed updates to any
//! number of independent subscribers (SSE stream, notification collaborator,
//! tests). Emission never blocks; with no subscribers the event is dropped.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::models::{JobStatus, JobType, SecurityAlert};

/// Domain event payloads.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    JobQueued {
        job_id: Uuid,
        tenant_id: String,
        job_type: JobType,
        priority: i32,
    },
    JobStatusChanged {
        job_id: Uuid,
        tenant_id: String,
        status: JobStatus,
        retry_count: i32,
    },
    /// An alert was raised or absorbed new evidence.
    AlertRaised { alert: SecurityAlert },
    /// An existing alert absorbed new evidence or changed review status.
    AlertUpdated { alert: SecurityAlert },
    ConfigChanged { version: i64 },
}

impl ServerEvent {
    /// Namespaced event type, used as the SSE event name.
    pub fn event_type(&self) -> &'static str {
        match self {
            ServerEvent::JobQueued { .. } => "job.queued",
            ServerEvent::JobStatusChanged { .. } => "job.status",
            ServerEvent::AlertRaised { .. } => "alert.raised",
            ServerEvent::AlertUpdated { .. } => "alert.updated",
            ServerEvent::ConfigChanged { .. } => "config.changed",
        }
    }

    pub fn is_alert(&self) -> bool {
        matches!(
            self,
            ServerEvent::AlertRaised { .. } | ServerEvent::AlertUpdated { .. }
        )
    }

    /// Tenant the event belongs to, if scoped.
    pub fn tenant_id(&self) -> Option<&str> {
        match self {
            ServerEvent::JobQueued { tenant_id, .. }
            | ServerEvent::JobStatusChanged { tenant_id, .. } => Some(tenant_id),
            ServerEvent::AlertRaised { alert } | ServerEvent::AlertUpdated { alert } => {
                Some(&alert.tenant_id)
            }
            ServerEvent::ConfigChanged { .. } => None,
        }
    }
}

/// Envelope carried on the bus.
#[derive(Debug, Clone, Serialize)]
pub struct EventEnvelope {
    /// UUIDv7, so ids sort by emission time.
    pub event_id: Uuid,
    pub event_type: &'static str,
    pub occurred_at: DateTime<Utc>,
    pub payload: ServerEvent,
}

impl EventEnvelope {
    pub fn new(payload: ServerEvent) -> Self {
        Self {
            event_id: Uuid::now_v7(),
            event_type: payload.event_type(),
            occurred_at: Utc::now(),
            payload,
        }
    }
}

/// Broadcast bus.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EventEnvelope>,
}

impl EventBus {
    /// Recommended: 256 for production, 32 for tests.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn emit(&self, event: ServerEvent) {
        let envelope = EventEnvelope::new(event);
        tracing::debug!(
            event_type = envelope.event_type,
            event_id = %envelope.event_id,
            subscriber_count = self.tx.receiver_count(),
            "EventBus emit"
        );
        let _ = self.tx.send(envelope);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(crate::defaults::EVENT_BUS_CAPACITY)
    }
}
