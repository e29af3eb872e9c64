// Prioritized fallback sourcing for one logical operation

//! # Fallback Handler
//!
//! One handler owns a primary source and a priority-ordered list of
//! alternates for a single logical operation. Execution walks the sources
//! in priority order (primary implicitly highest) under one shared timeout,
//! returns on the first success, and fails only when every source fails.
//! Each source tracks health from observed outcomes and can be toggled off
//! individually; unhealthy sources are tried after healthy ones rather than
//! skipped outright, so a recovered source gets back into rotation.

use std::future::Future;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::engine::events::EventBus;
use crate::{MeshError, Result};

/// One candidate source for the operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FallbackSource {
    pub id: String,
    pub priority: u32,
    pub enabled: bool,
    pub healthy: bool,
}

/// Result of a fallback execution
#[derive(Debug, Clone, PartialEq)]
pub struct FallbackOutcome<T> {
    pub value: T,
    /// True when an alternate, not the primary, produced the value
    pub used_fallback: bool,
    pub source_id: String,
    /// Source ids tried, in order, including the one that succeeded
    pub attempted: Vec<String>,
}

/// Primary-plus-alternates executor with health tracking
pub struct FallbackHandler {
    operation: String,
    primary_id: String,
    timeout_ms: u64,
    sources: RwLock<Vec<FallbackSource>>,
    events: Option<EventBus>,
}

impl FallbackHandler {
    pub fn new<O: Into<String>, P: Into<String>>(operation: O, primary_id: P, timeout_ms: u64) -> Self {
        let primary_id = primary_id.into();
        FallbackHandler {
            operation: operation.into(),
            primary_id: primary_id.clone(),
            timeout_ms,
            sources: RwLock::new(vec![FallbackSource {
                id: primary_id,
                priority: u32::MAX,
                enabled: true,
                healthy: true,
            }]),
            events: None,
        }
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    /// Register an alternate source at the given priority
    pub async fn add_source<S: Into<String>>(&self, id: S, priority: u32) {
        let mut sources = self.sources.write().await;
        sources.push(FallbackSource {
            id: id.into(),
            priority,
            enabled: true,
            healthy: true,
        });
    }

    pub async fn set_enabled(&self, id: &str, enabled: bool) {
        let mut sources = self.sources.write().await;
        if let Some(source) = sources.iter_mut().find(|s| s.id == id) {
            source.enabled = enabled;
        }
    }

    pub async fn set_healthy(&self, id: &str, healthy: bool) {
        let mut sources = self.sources.write().await;
        if let Some(source) = sources.iter_mut().find(|s| s.id == id) {
            source.healthy = healthy;
        }
    }

    pub async fn sources(&self) -> Vec<FallbackSource> {
        self.sources.read().await.clone()
    }

    /// Enabled sources in attempt order: healthy before unhealthy, then by
    /// priority descending
    async fn candidates(&self) -> Vec<String> {
        let sources = self.sources.read().await;
        let mut candidates: Vec<&FallbackSource> =
            sources.iter().filter(|s| s.enabled).collect();
        candidates.sort_by(|a, b| {
            b.healthy
                .cmp(&a.healthy)
                .then_with(|| b.priority.cmp(&a.priority))
        });
        candidates.into_iter().map(|s| s.id.clone()).collect()
    }

    /// Try each candidate source until one succeeds, all under the shared
    /// timeout
    pub async fn execute<T, F, Fut>(&self, invoke: F) -> Result<FallbackOutcome<T>>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let budget = Duration::from_millis(self.timeout_ms);
        match tokio::time::timeout(budget, self.try_sources(invoke)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(MeshError::Timeout {
                timeout_ms: self.timeout_ms,
            }),
        }
    }

    async fn try_sources<T, F, Fut>(&self, invoke: F) -> Result<FallbackOutcome<T>>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let candidates = self.candidates().await;
        if candidates.is_empty() {
            return Err(MeshError::Internal(format!(
                "no enabled sources for operation '{}'",
                self.operation
            )));
        }

        let mut attempted = Vec::new();
        let mut last_error = None;

        for source_id in candidates {
            attempted.push(source_id.clone());
            match invoke(source_id.clone()).await {
                Ok(value) => {
                    self.set_healthy(&source_id, true).await;
                    let used_fallback = source_id != self.primary_id;
                    if used_fallback {
                        debug!(
                            operation = %self.operation,
                            source_id = %source_id,
                            "fallback source served the operation"
                        );
                        if let Some(events) = &self.events {
                            events.emit_fallback_used(&self.operation, &source_id);
                        }
                    }
                    return Ok(FallbackOutcome {
                        value,
                        used_fallback,
                        source_id,
                        attempted,
                    });
                }
                Err(err) => {
                    warn!(
                        operation = %self.operation,
                        source_id = %source_id,
                        error = %err,
                        "fallback source failed"
                    );
                    self.set_healthy(&source_id, false).await;
                    last_error = Some(err);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            MeshError::Internal(format!(
                "every source failed for operation '{}'",
                self.operation
            ))
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn handler_with_alternates() -> FallbackHandler {
        let handler = FallbackHandler::new("convert", "primary", 5000);
        handler.add_source("alt-high", 80).await;
        handler.add_source("alt-low", 20).await;
        handler
    }

    #[tokio::test]
    async fn test_primary_success_uses_no_fallback() {
        let handler = handler_with_alternates().await;
        let outcome = handler
            .execute(|id| async move { Ok::<_, MeshError>(id.clone()) })
            .await
            .unwrap();
        assert_eq!(outcome.source_id, "primary");
        assert!(!outcome.used_fallback);
        assert_eq!(outcome.attempted, vec!["primary"]);
    }

    #[tokio::test]
    async fn test_falls_through_in_priority_order() {
        let handler = handler_with_alternates().await;
        let outcome = handler
            .execute(|id| async move {
                if id == "alt-low" {
                    Ok(id.clone())
                } else {
                    Err(MeshError::Connection {
                        server_id: id.clone(),
                        reason: "refused".to_string(),
                    })
                }
            })
            .await
            .unwrap();

        assert_eq!(outcome.source_id, "alt-low");
        assert!(outcome.used_fallback);
        assert_eq!(outcome.attempted, vec!["primary", "alt-high", "alt-low"]);
    }

    #[tokio::test]
    async fn test_fails_only_when_every_source_fails() {
        let handler = handler_with_alternates().await;
        let result = handler
            .execute(|id| async move {
                Err::<(), _>(MeshError::Connection {
                    server_id: id.clone(),
                    reason: "refused".to_string(),
                })
            })
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_disabled_sources_are_skipped() {
        let handler = handler_with_alternates().await;
        handler.set_enabled("alt-high", false).await;

        let outcome = handler
            .execute(|id| async move {
                if id == "primary" {
                    Err(MeshError::Connection {
                        server_id: id.clone(),
                        reason: "refused".to_string(),
                    })
                } else {
                    Ok(id.clone())
                }
            })
            .await
            .unwrap();

        assert_eq!(outcome.source_id, "alt-low");
        assert_eq!(outcome.attempted, vec!["primary", "alt-low"]);
    }

    #[tokio::test]
    async fn test_unhealthy_sources_move_to_the_back() {
        let handler = handler_with_alternates().await;
        handler.set_healthy("primary", false).await;

        let outcome = handler
            .execute(|id| async move { Ok::<_, MeshError>(id.clone()) })
            .await
            .unwrap();

        // Healthy alternates come first once the primary is marked down
        assert_eq!(outcome.source_id, "alt-high");
        assert!(outcome.used_fallback);
    }

    #[tokio::test]
    async fn test_shared_timeout_covers_the_whole_sequence() {
        let handler = FallbackHandler::new("slow", "primary", 50);
        handler.add_source("alt", 10).await;

        let result = handler
            .execute(|_| async {
                tokio::time::sleep(Duration::from_millis(500)).await;
                Ok::<(), MeshError>(())
            })
            .await;

        assert!(matches!(result, Err(MeshError::Timeout { timeout_ms: 50 })));
    }

    #[tokio::test]
    async fn test_success_restores_health() {
        let handler = handler_with_alternates().await;
        handler.set_healthy("primary", false).await;

        // Alternates fail this round, so the demoted primary gets its turn
        // and a success flips it healthy again
        let outcome = handler
            .execute(|id| async move {
                if id == "primary" {
                    Ok(id.clone())
                } else {
                    Err(MeshError::Connection {
                        server_id: id.clone(),
                        reason: "refused".to_string(),
                    })
                }
            })
            .await
            .unwrap();

        assert_eq!(outcome.source_id, "primary");
        let sources = handler.sources().await;
        let primary = sources.iter().find(|s| s.id == "primary").unwrap();
        assert!(primary.healthy);
    }
}
