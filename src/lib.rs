//! Turnstile - Per-Client Admission Control
//!
//! This crate gates inbound HTTP requests before they reach application
//! logic. Each client is resolved to an identity, checked against static
//! allow/deny lists and charged against its own in-memory token bucket.
//! Idle buckets are evicted by a background sweeper so memory stays bounded.

pub mod clock;
pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
