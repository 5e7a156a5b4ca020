//! Parapet Controller - adaptive traffic protection for the edge
//! filtering layer
//!
//! One invocation runs one protection cycle: read abuse metrics over the
//! observation window, move the rate limit by bounded multiplicative
//! feedback, and grow the blocklist from sampled offenders when abuse
//! exceeds the trigger. All external resources are mutated under optimistic
//! concurrency (lock-token compare-and-swap); a conflict aborts the cycle
//! and the next scheduled invocation recomputes from fresh state.

pub mod config;
pub mod control;
pub mod cycle;
pub mod error;
pub mod stores;
pub mod telemetry;
