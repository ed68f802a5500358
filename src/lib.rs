//! Gatekeeper - HTTP Request Admission Gate
//!
//! This crate decides, per incoming HTTP request, whether to forward it to a
//! downstream handler or reject it because the caller exceeded its permitted
//! rate. Callers are identified by an API token header or, without one, by
//! their network origin. Request history lives in a shared event store so
//! several instances enforce one logical limit.

pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
