//! Domain models.

pub mod alert;
pub mod audit;
pub mod cache;
pub mod job;
pub mod rate_limit;
pub mod session;
pub mod tenant;

pub use alert::*;
pub use audit::{
    action, diff_fields, entity, AuditAction, AuditCategory, AuditEvent, AuditPage, AuditQuery,
    NewAuditEvent, Severity, SYSTEM_ACTOR,
};
pub use cache::*;
pub use job::*;
pub use rate_limit::*;
pub use session::*;
pub use tenant::*;
