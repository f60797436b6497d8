//! Process-wide observability: tracing initialization, a panic hook that
//! routes panics through tracing, and the global metrics registry with its
//! HTTP endpoint.

pub mod metrics;
pub mod panic_hook;
pub mod tracing;
