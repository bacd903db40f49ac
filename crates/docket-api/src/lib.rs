//! # docket-api
//!
//! HTTP front door for the docket job queue. Identity arrives in headers set
//! by the upstream authenticator; see [`identity`].

pub mod error;
pub mod handlers;
pub mod identity;
pub mod router;
pub mod state;

pub use error::{ApiError, ApiResult};
pub use identity::Caller;
pub use router::build_router;
pub use state::{global_limiter, AppState, GlobalRateLimiter};
