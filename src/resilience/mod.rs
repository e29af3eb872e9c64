// Resilience layer: retry, circuit breakers, checkpoints, fallback

//! # Resilience Layer
//!
//! The failure-handling toolkit the orchestrator wraps around every remote
//! call:
//!
//! - [`RetryRunner`]: configurable backoff and retryability decisions
//! - [`CircuitBreaker`]: per-server guard against repeatedly failing peers
//! - [`CheckpointManager`]: bounded progress snapshots and resume
//! - [`FallbackHandler`]: prioritized alternate sourcing for one operation
//!
//! Remote step execution composes these as retry around breaker around the
//! call, with a checkpoint written after every completed step and fallback
//! sourcing engaged once retries are exhausted.

pub mod breaker;
pub mod checkpoint;
pub mod fallback;
pub mod retry;

pub use breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry};
pub use checkpoint::{CheckpointManager, ReplayedStep, ResumeReport};
pub use fallback::{FallbackHandler, FallbackOutcome, FallbackSource};
pub use retry::{BackoffStrategy, RetryConfig, RetryOutcome, RetryRunner};
