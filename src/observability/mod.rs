//! # Observability
//!
//! Prometheus metrics for the daemon. Tracing setup lives in `main.rs`;
//! the metrics HTTP endpoint is served by [`crate::server`].

pub mod metrics;
