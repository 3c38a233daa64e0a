//! Turnstile - Adaptive Admission Control
//!
//! This crate gates inbound HTTP and gRPC requests before they reach
//! application handlers. Requests pass an ordered pipeline of a concurrency
//! gate, per-key token buckets and a BBR-style adaptive limiter, plus an
//! optional per-route quota stage refreshed from an external authority that
//! fails open when the authority is unavailable.

pub mod admission;
pub mod config;
pub mod engine;
pub mod error;
pub mod quota;
pub mod transport;
