// Circuit breaker states and observable status snapshots

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Circuit breaker state machine positions.
///
/// Legal transitions: closed to open, open to half-open, half-open to closed
/// or back to open. A circuit never goes from closed straight to half-open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    /// Calls pass through; consecutive failures are counted
    Closed,
    /// Calls are rejected immediately until the cooldown elapses
    Open,
    /// Probing: limited calls pass through to test recovery
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half-open",
        };
        write!(f, "{s}")
    }
}

/// Point-in-time view of one breaker, safe to hand to observers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerStatus {
    pub state: CircuitState,
    /// Consecutive failures while closed or half-open
    pub failures: u32,
    /// Consecutive successes while half-open
    pub successes: u32,
    pub last_failure_time: Option<DateTime<Utc>>,
    pub last_success_time: Option<DateTime<Utc>>,
    /// When an open circuit will admit its next probe call
    pub next_retry_time: Option<DateTime<Utc>>,
}

impl Default for CircuitBreakerStatus {
    fn default() -> Self {
        CircuitBreakerStatus {
            state: CircuitState::Closed,
            failures: 0,
            successes: 0,
            last_failure_time: None,
            last_success_time: None,
            next_retry_time: None,
        }
    }
}
