// Retry execution with configurable backoff strategies

//! # Retry Mechanism
//!
//! Runs an operation up to `max_retries + 1` times with a configurable
//! backoff strategy. Stateless per call: every invocation computes its own
//! delays and keeps its own attempt counter.
//!
//! Whether an error is worth retrying is decided in three layers, most
//! specific first: an explicit non-retryable substring list always wins;
//! an explicit retryable allow-list, when present, is authoritative; and
//! otherwise a default heuristic looks for transient markers (timeout,
//! connection, network, and friends) in the error's message and kind.

use std::future::Future;
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::time::sleep;
use tracing::debug;

use crate::engine::events::EventBus;
use crate::{MeshError, Result};

/// Transient markers the default heuristic looks for, matched
/// case-insensitively against the error's message and kind
const DEFAULT_TRANSIENT_MARKERS: &[&str] = &[
    "timeout",
    "connection",
    "network",
    "econnreset",
    "econnrefused",
    "unavailable",
    "temporary",
];

/// How the delay grows between attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// base * 2^(n-1)
    Exponential,
    /// base * n
    Linear,
    /// base
    Fixed,
    /// base * fib(n)
    Fibonacci,
}

/// Retry policy for one class of operations
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct RetryConfig {
    /// Retries after the first attempt; total attempts = max_retries + 1
    pub max_retries: u32,
    pub base_delay_ms: u64,
    /// Upper clamp on any computed delay
    pub max_delay_ms: u64,
    pub strategy: BackoffStrategy,
    /// Symmetric jitter fraction in [0, 1]; zero disables jitter
    pub jitter: f64,
    /// When present, only errors matching one of these substrings retry
    pub retryable_errors: Option<Vec<String>>,
    /// Errors matching one of these substrings never retry
    pub non_retryable_errors: Vec<String>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            max_retries: 3,
            base_delay_ms: 1000,
            max_delay_ms: 30000,
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
            retryable_errors: None,
            non_retryable_errors: Vec::new(),
        }
    }
}

impl RetryConfig {
    pub fn fixed(max_retries: u32, delay_ms: u64) -> Self {
        RetryConfig {
            max_retries,
            base_delay_ms: delay_ms,
            strategy: BackoffStrategy::Fixed,
            jitter: 0.0,
            ..RetryConfig::default()
        }
    }

    /// Undithered delay before the attempt following `attempt` (1-based),
    /// clamped to `[0, max_delay_ms]`
    pub fn base_delay(&self, attempt: u32) -> u64 {
        let attempt = attempt.max(1);
        let raw = match self.strategy {
            BackoffStrategy::Fixed => self.base_delay_ms,
            BackoffStrategy::Linear => self.base_delay_ms.saturating_mul(attempt as u64),
            BackoffStrategy::Exponential => {
                let factor = 1u64.checked_shl(attempt - 1).unwrap_or(u64::MAX);
                self.base_delay_ms.saturating_mul(factor)
            }
            BackoffStrategy::Fibonacci => self.base_delay_ms.saturating_mul(fibonacci(attempt)),
        };
        raw.min(self.max_delay_ms)
    }

    /// Jittered delay: the base delay perturbed by a symmetric random
    /// factor, re-clamped to `[0, max_delay_ms]`
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if self.jitter <= 0.0 || base == 0 {
            return Duration::from_millis(base);
        }
        let spread = self.jitter.clamp(0.0, 1.0);
        let factor = rand::thread_rng().gen_range(1.0 - spread..=1.0 + spread);
        let jittered = ((base as f64) * factor).round().max(0.0) as u64;
        Duration::from_millis(jittered.min(self.max_delay_ms))
    }

    /// Decide whether `err` is worth another attempt
    pub fn is_retryable(&self, err: &MeshError) -> bool {
        if err.is_fatal() {
            return false;
        }

        let haystack = format!("{} {}", err.kind(), err).to_lowercase();

        if self
            .non_retryable_errors
            .iter()
            .any(|marker| haystack.contains(&marker.to_lowercase()))
        {
            return false;
        }

        if let Some(allow) = &self.retryable_errors {
            return allow
                .iter()
                .any(|marker| haystack.contains(&marker.to_lowercase()));
        }

        DEFAULT_TRANSIENT_MARKERS
            .iter()
            .any(|marker| haystack.contains(marker))
    }
}

/// fib(1) = fib(2) = 1
fn fibonacci(n: u32) -> u64 {
    let (mut a, mut b) = (1u64, 1u64);
    for _ in 2..n {
        let next = a.saturating_add(b);
        a = b;
        b = next;
    }
    if n <= 2 {
        1
    } else {
        b
    }
}

/// Outcome of a retried operation, reported whether or not it succeeded
#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub result: Result<T>,
    /// Attempts actually made, including the first
    pub attempts: u32,
    pub total_elapsed: Duration,
    pub last_attempt_duration: Duration,
}

/// Executes operations under a retry policy, publishing a retry event
/// before each re-attempt
#[derive(Clone)]
pub struct RetryRunner {
    config: RetryConfig,
    events: Option<EventBus>,
}

impl RetryRunner {
    pub fn new(config: RetryConfig) -> Self {
        RetryRunner {
            config,
            events: None,
        }
    }

    pub fn with_events(config: RetryConfig, events: EventBus) -> Self {
        RetryRunner {
            config,
            events: Some(events),
        }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Run `op` until it succeeds, exhausts its attempts, or fails with a
    /// non-retryable error
    pub async fn execute<T, F, Fut>(&self, operation: &str, mut op: F) -> RetryOutcome<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.config.max_retries + 1;
        let started = Instant::now();
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let attempt_started = Instant::now();
            let result = op().await;
            let last_attempt_duration = attempt_started.elapsed();

            match result {
                Ok(value) => {
                    return RetryOutcome {
                        result: Ok(value),
                        attempts: attempt,
                        total_elapsed: started.elapsed(),
                        last_attempt_duration,
                    };
                }
                Err(err) => {
                    if attempt >= max_attempts || !self.config.is_retryable(&err) {
                        return RetryOutcome {
                            result: Err(err),
                            attempts: attempt,
                            total_elapsed: started.elapsed(),
                            last_attempt_duration,
                        };
                    }

                    let delay = self.config.delay_for_attempt(attempt);
                    debug!(
                        operation,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying after transient failure"
                    );
                    if let Some(events) = &self.events {
                        events.emit_retry_attempted(operation, attempt + 1, delay.as_millis() as u64);
                    }
                    sleep(delay).await;
                }
            }
        }
    }
}
