//! Resilience primitives: circuit breaking and retry with backoff.

pub mod circuit_breaker;
pub mod retry;
