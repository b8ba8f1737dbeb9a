//! # turbot-health
//!
//! Upstream API health tracking for the Turbot worker.
//!
//! This crate provides:
//! - `HealthBreaker`: a per-backend closed/open/half-open circuit breaker
//!   with exponential backoff
//! - `classify`: the rule deciding which failures count toward tripping it
//!
//! The worker owns one breaker per upstream backend. Only failures that
//! `classify` reports as transient are fed to `record_failure`.

mod breaker;
mod classify;

pub use breaker::{
    derive_state, BreakerConfig, BreakerState, BreakerTransition, HealthBreaker,
    FAILURE_THRESHOLD, INITIAL_BACKOFF, MAX_BACKOFF,
};
pub use classify::{classify, is_transient_status, UpstreamError};
