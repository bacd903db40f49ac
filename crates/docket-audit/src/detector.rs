//! Anomaly detector.
//!
//! A periodic consumer of the audit stream. Each cycle reads the trailing
//! window, runs the detection rules and merges candidates into the alert
//! store. A failed cycle is logged and the next one runs as usual.

use std::sync::Arc;
use std::time::{Duration as StdDuration, Instant};

use chrono::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use docket_core::{
    defaults, detection, AuditEvent, AuditRepository, ConfigHandle, Result, SecurityAlert,
    SharedClock, UpsertOutcome, SYSTEM_ACTOR,
};

use crate::alerts::AlertService;

/// Outcome of one detection cycle.
#[derive(Debug, Clone, Default)]
pub struct ScanReport {
    pub events_scanned: usize,
    pub candidates: usize,
    pub created: usize,
    pub updated: usize,
    /// Candidates whose upsert failed; the rest of the cycle still ran.
    pub failed: usize,
    /// Alerts created or updated by this cycle.
    pub alerts: Vec<SecurityAlert>,
}

pub struct AnomalyDetector {
    audit: Arc<dyn AuditRepository>,
    alerts: AlertService,
    config: ConfigHandle,
    clock: SharedClock,
}

impl AnomalyDetector {
    pub fn new(
        audit: Arc<dyn AuditRepository>,
        alerts: AlertService,
        config: ConfigHandle,
        clock: SharedClock,
    ) -> Self {
        Self {
            audit,
            alerts,
            config,
            clock,
        }
    }

    /// Every event in `[now - window, now]`, in sequence order.
    async fn read_window(&self, window: Duration) -> Result<Vec<AuditEvent>> {
        let since = self.clock.now() - window;
        let mut events = Vec::new();
        let mut after_seq = 0;
        loop {
            let batch = self
                .audit
                .scan(since, after_seq, defaults::INTERNAL_FETCH_LIMIT)
                .await?;
            let Some(last) = batch.last() else { break };
            after_seq = last.seq;
            let full = batch.len() as i64 >= defaults::INTERNAL_FETCH_LIMIT;
            events.extend(batch);
            if !full {
                break;
            }
        }
        Ok(events)
    }

    /// Evaluate the rules over a trailing `window` and return the alerts that
    /// were raised or updated.
    pub async fn scan_window(&self, window: Duration) -> Result<Vec<SecurityAlert>> {
        Ok(self.scan(window).await?.alerts)
    }

    /// One detection cycle over the longest window any rule needs.
    pub async fn run_cycle(&self) -> Result<ScanReport> {
        let snapshot = self.config.current();
        self.scan(Duration::seconds(snapshot.detector.max_window_secs()))
            .await
    }

    async fn scan(&self, window: Duration) -> Result<ScanReport> {
        let start = Instant::now();
        let snapshot = self.config.current();
        let events = self.read_window(window).await?;
        let now = self.clock.now();
        let candidates = detection::evaluate_all(&events, &snapshot.detector, now);

        let mut report = ScanReport {
            events_scanned: events.len(),
            candidates: candidates.len(),
            ..Default::default()
        };

        for candidate in &candidates {
            match self.alerts.raise(candidate, SYSTEM_ACTOR).await {
                Ok((alert, UpsertOutcome::Created)) => {
                    report.created += 1;
                    report.alerts.push(alert);
                }
                Ok((alert, UpsertOutcome::Updated)) => {
                    report.updated += 1;
                    report.alerts.push(alert);
                }
                Ok((_, UpsertOutcome::Unchanged)) => {}
                Err(e) => {
                    report.failed += 1;
                    warn!(
                        subsystem = "audit",
                        component = "detector",
                        alert_type = %candidate.alert_type,
                        tenant_id = %candidate.tenant_id,
                        error = %e,
                        "Failed to store alert candidate"
                    );
                }
            }
        }

        debug!(
            subsystem = "audit",
            component = "detector",
            op = "scan",
            events = report.events_scanned,
            candidates = report.candidates,
            created = report.created,
            updated = report.updated,
            duration_ms = start.elapsed().as_millis() as u64,
            "Detection cycle finished"
        );
        Ok(report)
    }

    /// Run a cycle every `interval` until `shutdown` flips to true.
    pub fn spawn(
        self: Arc<Self>,
        interval: StdDuration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                subsystem = "audit",
                component = "detector",
                interval_secs = interval.as_secs(),
                "Anomaly detector started"
            );
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = self.run_cycle().await {
                            warn!(
                                subsystem = "audit",
                                component = "detector",
                                error = %e,
                                "Detection cycle failed"
                            );
                        }
                    }
                }
            }
            info!(subsystem = "audit", component = "detector", "Anomaly detector stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use docket_core::{AlertType, EventBus, ManualClock};
    use docket_db::memory::MemoryAuditLog;
    use docket_db::Database;

    use crate::recorder::AuditRecorder;

    #[tokio::test]
    async fn test_empty_log_raises_nothing() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let db = Database::in_memory();
        let alerts = AlertService::new(db.alerts.clone(), EventBus::new(8), clock.clone());
        let detector =
            AnomalyDetector::new(db.audit.clone(), alerts, ConfigHandle::default(), clock);
        let report = detector.run_cycle().await.unwrap();
        assert_eq!(report.events_scanned, 0);
        assert!(report.alerts.is_empty());
    }

    #[tokio::test]
    async fn test_origin_churn_raises_anomaly() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let log = Arc::new(MemoryAuditLog::new());
        let db = Database::from_memory(log.clone());
        let recorder = AuditRecorder::new(log, clock.clone());
        for origin in ["1.1.1.1", "2.2.2.2", "3.3.3.3"] {
            recorder
                .record_auth("acme", "alice", true, Some(origin.into()), None)
                .await
                .unwrap();
            clock.advance(Duration::minutes(5));
        }
        let alerts = AlertService::new(db.alerts.clone(), EventBus::new(8), clock.clone());
        let detector =
            AnomalyDetector::new(db.audit.clone(), alerts, ConfigHandle::default(), clock);
        let raised = detector.scan_window(Duration::hours(1)).await.unwrap();
        assert_eq!(raised.len(), 1);
        assert_eq!(raised[0].alert_type, AlertType::Anomaly);
        assert_eq!(raised[0].actor_id.as_deref(), Some("alice"));
    }
}
