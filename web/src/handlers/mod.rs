//! HTTP request handlers.

pub mod health;
pub mod worker;

pub use health::{health_check, readiness, Readiness};
pub use worker::{serve_request, RECYCLE_HEADER};
