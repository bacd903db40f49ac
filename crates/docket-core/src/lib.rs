//! # docket-core
//!
//! Domain types, storage traits and pure policy functions for the docket
//! document-processing job queue.
//!
//! Everything here is deterministic given its inputs (including `now`), which
//! is what lets the storage backends and services share one set of rules.

pub mod cache_policy;
pub mod changes;
pub mod clock;
pub mod config;
pub mod defaults;
pub mod detection;
pub mod error;
pub mod events;
pub mod ledger;
pub mod logging;
pub mod models;
pub mod rate_window;
pub mod scheduling;
pub mod traits;
pub mod uuid_utils;

// Re-export commonly used types at crate root
pub use clock::{system_clock, Clock, ManualClock, SharedClock, SystemClock};
pub use config::{
    CachePolicy, ConfigHandle, ConfigSnapshot, DetectorPolicy, RetentionPolicy, SchedulerPolicy,
};
pub use error::{Error, ErrorKind, Result};
pub use events::{EventBus, EventEnvelope, ServerEvent};
pub use models::*;
pub use scheduling::{fairness_cap, LeasePolicy};
pub use traits::*;
pub use uuid_utils::{extract_timestamp, is_v7, new_v7};
