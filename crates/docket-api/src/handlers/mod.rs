//! HTTP handlers, one module per resource.
//!
//! Every handler except `health` takes a [`Caller`](crate::identity::Caller)
//! and counts the request against the per-actor rate limiter under a dotted
//! endpoint name (`jobs.list`, `alerts.update`, ...). Job submission is
//! admitted inside the scheduler instead.

pub mod admin;
pub mod alerts;
pub mod audit;
pub mod health;
pub mod jobs;
pub mod sessions;
