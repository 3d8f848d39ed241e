//! HTTP API: operator surface over the job queue services.

pub mod app;
pub mod context;
pub mod middleware;
