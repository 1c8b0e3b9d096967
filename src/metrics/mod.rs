//! Prometheus metrics for the OADP Operator
//!
//! This module exposes metrics for monitoring operator health and performance,
//! plus the health and readiness probe endpoints.

mod prometheus;

pub use prometheus::*;
