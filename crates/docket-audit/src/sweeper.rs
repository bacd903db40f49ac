//! Retention sweeper.
//!
//! Purges old audit events, idle rate-limit windows, expired cache entries and
//! stale sessions, and archives idle terminal jobs. Only the holder of the
//! `retention` leader lease sweeps; other instances skip the cycle. Each
//! non-empty batch is summarized by one SYSTEM audit event.

use std::sync::Arc;
use std::time::{Duration as StdDuration, Instant};

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use docket_core::{
    action, defaults, entity, new_v7, AuditAction, AuditCategory, ConfigHandle, NewAuditEvent,
    Result, SharedClock, SYSTEM_ACTOR,
};
use docket_db::Database;

/// Name of the leader lease guarding the sweeper.
pub const SWEEPER_LOCK: &str = "retention";

/// Rows archived per `archive_idle` call.
const ARCHIVE_BATCH: i64 = 500;

/// What one sweep did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Another instance held the leader lease.
    pub skipped: bool,
    pub audit_events_purged: u64,
    pub rate_windows_purged: u64,
    pub cache_entries_purged: u64,
    pub sessions_purged: u64,
    pub jobs_archived: u64,
}

impl SweepReport {
    pub fn total(&self) -> u64 {
        self.audit_events_purged
            + self.rate_windows_purged
            + self.cache_entries_purged
            + self.sessions_purged
            + self.jobs_archived
    }
}

pub struct RetentionSweeper {
    db: Database,
    config: ConfigHandle,
    clock: SharedClock,
    holder: String,
}

impl RetentionSweeper {
    pub fn new(db: Database, config: ConfigHandle, clock: SharedClock) -> Self {
        Self {
            db,
            config,
            clock,
            holder: format!("sweeper-{}", new_v7()),
        }
    }

    /// Lease holder id of this instance.
    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// Sweep once if this instance can take the leader lease.
    pub async fn run(&self) -> Result<SweepReport> {
        let now = self.clock.now();
        let ttl = Duration::seconds(defaults::SWEEP_LOCK_TTL_SECS);
        if !self
            .db
            .locks
            .try_acquire(SWEEPER_LOCK, &self.holder, ttl, now)
            .await?
        {
            debug!(
                subsystem = "audit",
                component = "sweeper",
                holder = %self.holder,
                "Retention lease held elsewhere, skipping sweep"
            );
            return Ok(SweepReport {
                skipped: true,
                ..Default::default()
            });
        }

        let result = self.sweep(now).await;
        if let Err(e) = self.db.locks.release(SWEEPER_LOCK, &self.holder).await {
            warn!(
                subsystem = "audit",
                component = "sweeper",
                error = %e,
                "Failed to release retention lease"
            );
        }
        result
    }

    async fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let start = Instant::now();
        let policy = self.config.current().retention.clone();
        let mut report = SweepReport::default();

        let cutoff = now - Duration::days(policy.audit_days);
        report.audit_events_purged = self.db.audit.purge_before(cutoff).await?;
        self.summarize("audit_events", action::PURGE, report.audit_events_purged, cutoff, now)
            .await?;

        let cutoff = now - Duration::seconds(policy.rate_window_ttl_secs);
        report.rate_windows_purged = self.db.rate_limits.purge_idle(cutoff, now).await?;
        self.summarize("rate_limit_windows", action::PURGE, report.rate_windows_purged, cutoff, now)
            .await?;

        report.cache_entries_purged = self.db.cache.purge_expired(now).await?;
        self.summarize("cache_entries", action::PURGE, report.cache_entries_purged, now, now)
            .await?;

        let idle_before = now - Duration::seconds(policy.session_idle_secs);
        let created_before = now - Duration::seconds(policy.session_absolute_secs);
        report.sessions_purged = self
            .db
            .sessions
            .purge_stale(idle_before, created_before)
            .await?;
        self.summarize("sessions", action::PURGE, report.sessions_purged, idle_before, now)
            .await?;

        let cutoff = now - Duration::days(policy.archive_days);
        loop {
            let batch = self.db.jobs.archive_idle(cutoff, ARCHIVE_BATCH, now).await?;
            report.jobs_archived += batch.len() as u64;
            if (batch.len() as i64) < ARCHIVE_BATCH {
                break;
            }
        }
        self.summarize("jobs", action::ARCHIVE, report.jobs_archived, cutoff, now)
            .await?;

        info!(
            subsystem = "audit",
            component = "sweeper",
            op = "sweep",
            audit_events = report.audit_events_purged,
            rate_windows = report.rate_windows_purged,
            cache_entries = report.cache_entries_purged,
            sessions = report.sessions_purged,
            jobs_archived = report.jobs_archived,
            duration_ms = start.elapsed().as_millis() as u64,
            "Retention sweep finished"
        );
        Ok(report)
    }

    async fn summarize(
        &self,
        target: &str,
        name: &str,
        rows: u64,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if rows == 0 {
            return Ok(());
        }
        let event = NewAuditEvent::new(
            SYSTEM_ACTOR,
            SYSTEM_ACTOR,
            entity::RETENTION,
            target,
            AuditAction::custom(name),
            AuditCategory::System,
        )
        .with_metadata(json!({
            "target": target,
            "rows_affected": rows,
            "cutoff": cutoff,
        }));
        self.db.audit.append(event, now).await?;
        Ok(())
    }

    /// Sweep every `interval` until `shutdown` flips to true.
    pub fn spawn(
        self: Arc<Self>,
        interval: StdDuration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                subsystem = "audit",
                component = "sweeper",
                interval_secs = interval.as_secs(),
                "Retention sweeper started"
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
                        if let Err(e) = self.run().await {
                            warn!(
                                subsystem = "audit",
                                component = "sweeper",
                                error = %e,
                                "Retention sweep failed"
                            );
                        }
                    }
                }
            }
            info!(subsystem = "audit", component = "sweeper", "Retention sweeper stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docket_core::{Clock, ManualClock};

    #[tokio::test]
    async fn test_second_sweeper_skips_while_lease_held() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let db = Database::in_memory();
        let config = ConfigHandle::default();
        let a = RetentionSweeper::new(db.clone(), config.clone(), clock.clone());
        let b = RetentionSweeper::new(db.clone(), config, clock.clone());

        let ttl = Duration::seconds(defaults::SWEEP_LOCK_TTL_SECS);
        assert!(db
            .locks
            .try_acquire(SWEEPER_LOCK, a.holder(), ttl, clock.now())
            .await
            .unwrap());
        let report = b.run().await.unwrap();
        assert!(report.skipped);

        // The holder itself can renew and sweep.
        let report = a.run().await.unwrap();
        assert!(!report.skipped);
    }

    #[tokio::test]
    async fn test_empty_sweep_records_nothing() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let log = Arc::new(docket_db::memory::MemoryAuditLog::new());
        let db = Database::from_memory(log.clone());
        let sweeper = RetentionSweeper::new(db, ConfigHandle::default(), clock);
        let report = sweeper.run().await.unwrap();
        assert_eq!(report.total(), 0);
        assert!(log.is_empty());
    }
}
