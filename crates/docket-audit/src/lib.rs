//! # docket-audit
//!
//! The audit side of docket:
//!
//! - [`AuditRecorder`]: durable append path for events that do not originate
//!   inside a storage mutation (authentication outcomes, external reports),
//!   plus paginated queries.
//! - [`AnomalyDetector`]: periodic scanner that turns the audit stream into
//!   deduplicated security and operational alerts.
//! - [`AlertService`]: alert store access that publishes to the alert feed.
//! - [`RetentionSweeper`]: leader-locked purge and archive pass.
//! - [`ConfigAdmin`]: versioned, audited configuration changes.
//!
//! ```rust,ignore
//! let alerts = AlertService::new(db.alerts.clone(), events.clone(), clock.clone());
//! let detector = Arc::new(AnomalyDetector::new(db.audit.clone(), alerts, config, clock));
//! let handle = detector.spawn(Duration::from_secs(180), shutdown_rx);
//! ```

pub mod admin;
pub mod alerts;
pub mod detector;
pub mod recorder;
pub mod sweeper;

pub use admin::ConfigAdmin;
pub use alerts::{AlertService, ManualAlertRequest};
pub use detector::{AnomalyDetector, ScanReport};
pub use recorder::{AuditRecorder, ExternalAuditEvent};
pub use sweeper::{RetentionSweeper, SweepReport, SWEEPER_LOCK};
