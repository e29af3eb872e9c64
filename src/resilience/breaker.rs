// Per-server circuit breakers guarding calls against failing peers

//! # Circuit Breaker
//!
//! One breaker guards all traffic to one server id. In `closed` state calls
//! pass through and consecutive failures are counted; hitting the failure
//! threshold opens the circuit for a cooldown. While `open`, calls are
//! rejected immediately with [`MeshError::CircuitOpen`] so callers can tell
//! "the peer is failing" apart from "this call failed". Once the cooldown
//! elapses the next call moves the breaker to `half-open`: a single failure
//! reopens it, while a run of successes closes it again.
//!
//! State transitions are linearizable per server id: a single mutex guards
//! each breaker's counters and state, and every transition is decided while
//! holding it.

use chrono::{Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{info, warn};

use crate::engine::events::EventBus;
use crate::models::{CircuitBreakerStatus, CircuitState};
use crate::{MeshError, Result};

/// Breaker thresholds and timeouts
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures in `closed` that open the circuit
    pub failure_threshold: u32,
    /// Consecutive successes in `half-open` that close it
    pub success_threshold: u32,
    /// Cooldown before an open circuit admits a probe call
    pub reset_timeout_ms: u64,
    /// Per-call operation timeout, independent of retry/backoff timing
    pub call_timeout_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        CircuitBreakerConfig {
            failure_threshold: 5,
            success_threshold: 2,
            reset_timeout_ms: 60000,
            call_timeout_ms: 30000,
        }
    }
}

type StateListener = Box<dyn Fn(&str, CircuitState, CircuitState) + Send + Sync>;

/// Circuit breaker for a single server id
pub struct CircuitBreaker {
    server_id: String,
    config: CircuitBreakerConfig,
    state: Mutex<CircuitBreakerStatus>,
    listeners: Mutex<Vec<StateListener>>,
    events: Option<EventBus>,
}

impl CircuitBreaker {
    pub fn new<S: Into<String>>(server_id: S, config: CircuitBreakerConfig) -> Self {
        CircuitBreaker {
            server_id: server_id.into(),
            config,
            state: Mutex::new(CircuitBreakerStatus::default()),
            listeners: Mutex::new(Vec::new()),
            events: None,
        }
    }

    pub fn with_events<S: Into<String>>(
        server_id: S,
        config: CircuitBreakerConfig,
        events: EventBus,
    ) -> Self {
        CircuitBreaker {
            server_id: server_id.into(),
            config,
            state: Mutex::new(CircuitBreakerStatus::default()),
            listeners: Mutex::new(Vec::new()),
            events: Some(events),
        }
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    /// Register an observer for state transitions
    pub fn on_state_change<F>(&self, listener: F)
    where
        F: Fn(&str, CircuitState, CircuitState) + Send + Sync + 'static,
    {
        self.listeners
            .lock()
            .expect("listener lock poisoned")
            .push(Box::new(listener));
    }

    /// Current status snapshot
    pub fn status(&self) -> CircuitBreakerStatus {
        self.state.lock().expect("breaker lock poisoned").clone()
    }

    /// Reset the breaker to pristine closed state
    pub fn reset(&self) {
        let from = {
            let mut state = self.state.lock().expect("breaker lock poisoned");
            let from = state.state;
            *state = CircuitBreakerStatus::default();
            from
        };
        if from != CircuitState::Closed {
            self.notify(from, CircuitState::Closed);
        }
    }

    /// Run `op` through the breaker under the configured call timeout
    pub async fn call<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        self.admit()?;

        let timeout = Duration::from_millis(self.config.call_timeout_ms);
        let result = match tokio::time::timeout(timeout, op()).await {
            Ok(inner) => inner,
            Err(_) => Err(MeshError::Timeout {
                timeout_ms: self.config.call_timeout_ms,
            }),
        };

        match &result {
            Ok(_) => self.record_success(),
            Err(_) => self.record_failure(),
        }

        result
    }

    /// Gate a call: reject while open, move to half-open once the cooldown
    /// has elapsed. A rejection is not recorded as a failure.
    fn admit(&self) -> Result<()> {
        let transition = {
            let mut state = self.state.lock().expect("breaker lock poisoned");
            match state.state {
                CircuitState::Closed | CircuitState::HalfOpen => None,
                CircuitState::Open => {
                    let due = state
                        .next_retry_time
                        .map(|t| Utc::now() >= t)
                        .unwrap_or(true);
                    if due {
                        state.state = CircuitState::HalfOpen;
                        state.successes = 0;
                        Some((CircuitState::Open, CircuitState::HalfOpen))
                    } else {
                        return Err(MeshError::CircuitOpen {
                            server_id: self.server_id.clone(),
                        });
                    }
                }
            }
        };
        if let Some((from, to)) = transition {
            self.notify(from, to);
        }
        Ok(())
    }

    fn record_success(&self) {
        let transition = {
            let mut state = self.state.lock().expect("breaker lock poisoned");
            state.last_success_time = Some(Utc::now());
            match state.state {
                CircuitState::Closed => {
                    state.failures = 0;
                    None
                }
                CircuitState::HalfOpen => {
                    state.successes += 1;
                    if state.successes >= self.config.success_threshold {
                        state.state = CircuitState::Closed;
                        state.failures = 0;
                        state.successes = 0;
                        state.next_retry_time = None;
                        Some((CircuitState::HalfOpen, CircuitState::Closed))
                    } else {
                        None
                    }
                }
                // A call admitted before the circuit opened can land here;
                // it does not change open-state bookkeeping
                CircuitState::Open => None,
            }
        };
        if let Some((from, to)) = transition {
            info!(server_id = %self.server_id, "circuit closed after recovery");
            self.notify(from, to);
        }
    }

    fn record_failure(&self) {
        let transition = {
            let mut state = self.state.lock().expect("breaker lock poisoned");
            state.last_failure_time = Some(Utc::now());
            match state.state {
                CircuitState::Closed => {
                    state.failures += 1;
                    if state.failures >= self.config.failure_threshold {
                        state.state = CircuitState::Open;
                        state.next_retry_time = Some(
                            Utc::now() + ChronoDuration::milliseconds(self.config.reset_timeout_ms as i64),
                        );
                        Some((CircuitState::Closed, CircuitState::Open))
                    } else {
                        None
                    }
                }
                CircuitState::HalfOpen => {
                    // One failure while probing reopens the circuit
                    state.failures += 1;
                    state.successes = 0;
                    state.state = CircuitState::Open;
                    state.next_retry_time = Some(
                        Utc::now() + ChronoDuration::milliseconds(self.config.reset_timeout_ms as i64),
                    );
                    Some((CircuitState::HalfOpen, CircuitState::Open))
                }
                CircuitState::Open => None,
            }
        };
        if let Some((from, to)) = transition {
            warn!(server_id = %self.server_id, from = %from, to = %to, "circuit opened");
            self.notify(from, to);
        }
    }

    fn notify(&self, from: CircuitState, to: CircuitState) {
        if let Some(events) = &self.events {
            events.emit_circuit_state_changed(&self.server_id, from, to);
        }
        let listeners = self.listeners.lock().expect("listener lock poisoned");
        for listener in listeners.iter() {
            listener(&self.server_id, from, to);
        }
    }
}

/// Lazily creates one breaker per server id; instances live for the process
/// lifetime or until explicitly reset
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    events: Option<EventBus>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        CircuitBreakerRegistry {
            config,
            breakers: DashMap::new(),
            events: None,
        }
    }

    pub fn with_events(config: CircuitBreakerConfig, events: EventBus) -> Self {
        CircuitBreakerRegistry {
            config,
            breakers: DashMap::new(),
            events: Some(events),
        }
    }

    /// The breaker guarding `server_id`, created on first use
    pub fn breaker_for(&self, server_id: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(server_id.to_string())
            .or_insert_with(|| {
                let breaker = match &self.events {
                    Some(events) => {
                        CircuitBreaker::with_events(server_id, self.config, events.clone())
                    }
                    None => CircuitBreaker::new(server_id, self.config),
                };
                Arc::new(breaker)
            })
            .clone()
    }

    /// Status of the breaker for `server_id`, if one exists yet
    pub fn status(&self, server_id: &str) -> Option<CircuitBreakerStatus> {
        self.breakers.get(server_id).map(|b| b.status())
    }

    pub fn reset(&self, server_id: &str) {
        if let Some(breaker) = self.breakers.get(server_id) {
            breaker.reset();
        }
    }

    pub fn reset_all(&self) {
        for entry in self.breakers.iter() {
            entry.value().reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 3,
            success_threshold: 2,
            reset_timeout_ms: 60000,
            call_timeout_ms: 1000,
        }
    }

    async fn fail(breaker: &CircuitBreaker) {
        let _ = breaker
            .call(|| async {
                Err::<(), _>(MeshError::Connection {
                    server_id: "srv".to_string(),
                    reason: "refused".to_string(),
                })
            })
            .await;
    }

    async fn succeed(breaker: &CircuitBreaker) {
        breaker.call(|| async { Ok(()) }).await.unwrap();
    }

    #[tokio::test]
    async fn test_three_failures_open_the_circuit() {
        let breaker = CircuitBreaker::new("srv", fast_config());
        for _ in 0..3 {
            fail(&breaker).await;
        }
        let status = breaker.status();
        assert_eq!(status.state, CircuitState::Open);
        assert!(status.next_retry_time.is_some());
    }

    #[tokio::test]
    async fn test_open_circuit_rejects_without_invoking() {
        let breaker = CircuitBreaker::new("srv", fast_config());
        for _ in 0..3 {
            fail(&breaker).await;
        }

        let invoked = AtomicU32::new(0);
        let result = breaker
            .call(|| async {
                invoked.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(MeshError::CircuitOpen { .. })));
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_success_resets_failure_count_while_closed() {
        let breaker = CircuitBreaker::new("srv", fast_config());
        fail(&breaker).await;
        fail(&breaker).await;
        succeed(&breaker).await;
        fail(&breaker).await;
        fail(&breaker).await;
        // Never three in a row, so still closed
        assert_eq!(breaker.status().state, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_probe_after_cooldown_then_close() {
        let mut config = fast_config();
        config.reset_timeout_ms = 0;
        let breaker = CircuitBreaker::new("srv", config);
        for _ in 0..3 {
            fail(&breaker).await;
        }

        // Cooldown of zero: the next call is admitted as a half-open probe
        succeed(&breaker).await;
        assert_eq!(breaker.status().state, CircuitState::HalfOpen);

        succeed(&breaker).await;
        assert_eq!(breaker.status().state, CircuitState::Closed);
        assert_eq!(breaker.status().failures, 0);
    }

    #[tokio::test]
    async fn test_half_open_failure_reopens() {
        let mut config = fast_config();
        config.reset_timeout_ms = 0;
        let breaker = CircuitBreaker::new("srv", config);
        for _ in 0..3 {
            fail(&breaker).await;
        }

        // Probe fails: straight back to open
        fail(&breaker).await;
        assert_eq!(breaker.status().state, CircuitState::Open);
    }

    #[tokio::test]
    async fn test_call_timeout_counts_as_failure() {
        let mut config = fast_config();
        config.call_timeout_ms = 10;
        let breaker = CircuitBreaker::new("srv", config);

        let result: Result<()> = breaker
            .call(|| async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(MeshError::Timeout { .. })));
        assert_eq!(breaker.status().failures, 1);
    }

    #[tokio::test]
    async fn test_listeners_observe_transitions() {
        let breaker = Arc::new(CircuitBreaker::new("srv", fast_config()));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        breaker.on_state_change(move |_, from, to| {
            sink.lock().unwrap().push((from, to));
        });

        for _ in 0..3 {
            fail(&breaker).await;
        }
        let transitions = seen.lock().unwrap().clone();
        assert_eq!(
            transitions,
            vec![(CircuitState::Closed, CircuitState::Open)]
        );
    }

    #[tokio::test]
    async fn test_registry_creates_breakers_lazily() {
        let registry = CircuitBreakerRegistry::new(fast_config());
        assert!(registry.status("a").is_none());

        let breaker = registry.breaker_for("a");
        fail(&breaker).await;
        assert_eq!(registry.status("a").unwrap().failures, 1);

        // Same instance on repeat lookup
        let again = registry.breaker_for("a");
        assert_eq!(again.status().failures, 1);
    }

    #[tokio::test]
    async fn test_registry_reset() {
        let registry = CircuitBreakerRegistry::new(fast_config());
        let breaker = registry.breaker_for("a");
        for _ in 0..3 {
            fail(&breaker).await;
        }
        assert_eq!(registry.status("a").unwrap().state, CircuitState::Open);

        registry.reset("a");
        assert_eq!(registry.status("a").unwrap().state, CircuitState::Closed);
    }
}
