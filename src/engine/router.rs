// Capability router: which server serves an operation when several could

//! # Capability Router
//!
//! A derived, rebuildable view over the registry: capability name to ranked
//! candidate servers. Priority comes from the discovery tier (built-in
//! servers outrank first-party, community, and external ones). When more
//! than one server offers a capability, a per-capability conflict strategy
//! decides: take the highest-priority candidate, honor a preferred flag, or
//! rotate round-robin. Explicit user preference lists trump all of it.
//!
//! The mapping is rebuilt wholesale whenever the server set changes rather
//! than patched incrementally; readers between rebuilds see the previous
//! consistent snapshot. Selection never fails, it returns `None` when no
//! candidate is currently available.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use super::registry::ServerRegistry;
use crate::models::{ConflictStrategy, ServerDefinition};

/// Capability name prefixes treated as higher-level analysis operations,
/// which default to preferred-based resolution
const ANALYSIS_PREFIXES: &[&str] = &["analyze", "assess", "inspect", "report", "summarize"];

/// One ranked candidate for a capability
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilityCandidate {
    pub server_id: String,
    pub priority: u32,
    pub is_preferred: bool,
}

/// Candidates plus the strategy for one capability
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilityEntry {
    /// Sorted by priority descending, preferred first among equals
    pub candidates: Vec<CapabilityCandidate>,
    pub strategy: ConflictStrategy,
}

/// The full derived capability view
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapabilityMapping {
    entries: HashMap<String, CapabilityEntry>,
}

impl CapabilityMapping {
    /// Build the mapping from a server set
    pub fn from_servers(servers: &[ServerDefinition]) -> Self {
        let mut grouped: HashMap<String, Vec<&ServerDefinition>> = HashMap::new();
        for server in servers {
            for capability in &server.capabilities {
                grouped.entry(capability.clone()).or_default().push(server);
            }
        }

        let entries = grouped
            .into_iter()
            .map(|(capability, offering)| {
                let mut candidates: Vec<CapabilityCandidate> = offering
                    .iter()
                    .map(|server| CapabilityCandidate {
                        server_id: server.id.clone(),
                        priority: server.metadata.source.priority(),
                        is_preferred: server.metadata.preferred,
                    })
                    .collect();
                candidates.sort_by(|a, b| {
                    b.priority
                        .cmp(&a.priority)
                        .then_with(|| b.is_preferred.cmp(&a.is_preferred))
                        .then_with(|| a.server_id.cmp(&b.server_id))
                });

                // An explicit strategy declared by any offering server wins
                // over the inferred default
                let strategy = offering
                    .iter()
                    .filter_map(|server| server.metadata.conflict_strategy)
                    .next()
                    .unwrap_or_else(|| infer_strategy(&capability));

                (capability, CapabilityEntry { candidates, strategy })
            })
            .collect();

        CapabilityMapping { entries }
    }

    pub fn entry(&self, capability: &str) -> Option<&CapabilityEntry> {
        self.entries.get(capability)
    }

    pub fn capabilities(&self) -> Vec<&str> {
        self.entries.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Primitive operations resolve first-wins; analysis-style operations
/// resolve through the preferred flag
fn infer_strategy(capability: &str) -> ConflictStrategy {
    let lowered = capability.to_lowercase();
    if ANALYSIS_PREFIXES.iter().any(|p| lowered.starts_with(p)) {
        ConflictStrategy::Preferred
    } else {
        ConflictStrategy::First
    }
}

/// Routes capabilities to servers using the derived mapping
pub struct CapabilityRouter {
    registry: Arc<ServerRegistry>,
    mapping: RwLock<CapabilityMapping>,
    /// User preference lists, per capability, consulted before any strategy
    preferences: RwLock<HashMap<String, Vec<String>>>,
    /// Round-robin cursors, per capability
    cursors: Mutex<HashMap<String, usize>>,
}

impl CapabilityRouter {
    pub fn new(registry: Arc<ServerRegistry>) -> Self {
        CapabilityRouter {
            registry,
            mapping: RwLock::new(CapabilityMapping::default()),
            preferences: RwLock::new(HashMap::new()),
            cursors: Mutex::new(HashMap::new()),
        }
    }

    /// Rebuild the derived mapping from current registry state. Call after
    /// any registration change.
    pub async fn rebuild(&self) -> usize {
        let servers = self.registry.get_registered_servers().await;
        let rebuilt = CapabilityMapping::from_servers(&servers);
        let count = rebuilt.len();
        *self.mapping.write().await = rebuilt;
        debug!(capabilities = count, "capability mapping rebuilt");
        count
    }

    /// Current mapping snapshot
    pub async fn mapping(&self) -> CapabilityMapping {
        self.mapping.read().await.clone()
    }

    /// Set the user preference list for one capability
    pub async fn set_preference<C: Into<String>>(&self, capability: C, server_ids: Vec<String>) {
        self.preferences
            .write()
            .await
            .insert(capability.into(), server_ids);
    }

    pub async fn clear_preference(&self, capability: &str) {
        self.preferences.write().await.remove(capability);
    }

    /// Pick the server that should serve `capability` right now.
    ///
    /// Order of authority: the user preference list, then the capability's
    /// conflict strategy over currently-available candidates. Returns `None`
    /// when nobody can serve it.
    pub async fn select_server_for_capability(&self, capability: &str) -> Option<String> {
        // Preference list first: the first listed server that is available
        let preferred_ids = {
            let preferences = self.preferences.read().await;
            preferences.get(capability).cloned()
        };
        if let Some(ids) = preferred_ids {
            for id in ids {
                if self.is_available(&id).await {
                    return Some(id);
                }
            }
        }

        let entry = {
            let mapping = self.mapping.read().await;
            mapping.entry(capability).cloned()
        }?;

        let mut available = Vec::new();
        for candidate in &entry.candidates {
            if self.is_available(&candidate.server_id).await {
                available.push(candidate.clone());
            }
        }
        if available.is_empty() {
            return None;
        }

        match entry.strategy {
            ConflictStrategy::First => Some(available[0].server_id.clone()),
            ConflictStrategy::Preferred => available
                .iter()
                .find(|c| c.is_preferred)
                .or_else(|| available.first())
                .map(|c| c.server_id.clone()),
            ConflictStrategy::RoundRobin => {
                let mut cursors = self.cursors.lock().await;
                let cursor = cursors.entry(capability.to_string()).or_insert(0);
                let picked = available[*cursor % available.len()].server_id.clone();
                *cursor = cursor.wrapping_add(1);
                Some(picked)
            }
        }
    }

    async fn is_available(&self, server_id: &str) -> bool {
        match self.registry.get_server(server_id).await {
            Ok(server) => server.status.is_selectable(),
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::events::EventBus;
    use crate::models::{ServerMetadata, ServerSource, ServerStatus};

    fn server(id: &str, caps: &[&str], source: ServerSource, preferred: bool) -> ServerDefinition {
        ServerDefinition::http(
            id,
            format!("{id} server"),
            format!("http://localhost:9000/{id}"),
            5000,
            caps.iter().map(|c| c.to_string()).collect(),
        )
        .with_metadata(ServerMetadata {
            source,
            preferred,
            ..ServerMetadata::default()
        })
    }

    async fn router_with(servers: Vec<ServerDefinition>) -> (Arc<ServerRegistry>, CapabilityRouter) {
        let registry = Arc::new(ServerRegistry::new(Vec::new(), EventBus::new()));
        for definition in servers {
            registry.register_server(definition).await.unwrap();
        }
        let router = CapabilityRouter::new(Arc::clone(&registry));
        router.rebuild().await;
        (registry, router)
    }

    #[tokio::test]
    async fn test_mapping_ranks_by_source_priority() {
        let (_registry, router) = router_with(vec![
            server("community", &["convert"], ServerSource::Community, false),
            server("builtin", &["convert"], ServerSource::BuiltIn, false),
        ])
        .await;

        let mapping = router.mapping().await;
        let entry = mapping.entry("convert").unwrap();
        let ids: Vec<&str> = entry.candidates.iter().map(|c| c.server_id.as_str()).collect();
        assert_eq!(ids, vec!["builtin", "community"]);
        assert_eq!(entry.strategy, ConflictStrategy::First);
    }

    #[tokio::test]
    async fn test_first_strategy_picks_highest_priority_available() {
        let (registry, router) = router_with(vec![
            server("community", &["convert"], ServerSource::Community, false),
            server("builtin", &["convert"], ServerSource::BuiltIn, false),
        ])
        .await;

        assert_eq!(
            router.select_server_for_capability("convert").await,
            Some("builtin".to_string())
        );

        registry
            .update_server_status("builtin", ServerStatus::Error, None)
            .await
            .unwrap();
        assert_eq!(
            router.select_server_for_capability("convert").await,
            Some("community".to_string())
        );
    }

    #[tokio::test]
    async fn test_analysis_capabilities_resolve_through_preferred_flag() {
        let (_registry, router) = router_with(vec![
            server("builtin", &["analyze_document"], ServerSource::BuiltIn, false),
            server(
                "specialist",
                &["analyze_document"],
                ServerSource::Community,
                true,
            ),
        ])
        .await;

        let mapping = router.mapping().await;
        assert_eq!(
            mapping.entry("analyze_document").unwrap().strategy,
            ConflictStrategy::Preferred
        );

        // The preferred flag beats the higher priority tier
        assert_eq!(
            router.select_server_for_capability("analyze_document").await,
            Some("specialist".to_string())
        );
    }

    #[tokio::test]
    async fn test_preferred_falls_back_to_first_when_unavailable() {
        let (registry, router) = router_with(vec![
            server("builtin", &["analyze_document"], ServerSource::BuiltIn, false),
            server(
                "specialist",
                &["analyze_document"],
                ServerSource::Community,
                true,
            ),
        ])
        .await;

        registry
            .update_server_status("specialist", ServerStatus::Error, None)
            .await
            .unwrap();
        assert_eq!(
            router.select_server_for_capability("analyze_document").await,
            Some("builtin".to_string())
        );
    }

    #[tokio::test]
    async fn test_round_robin_rotates_among_available() {
        let mut a = server("a", &["render"], ServerSource::Community, false);
        a.metadata.conflict_strategy = Some(ConflictStrategy::RoundRobin);
        let b = server("b", &["render"], ServerSource::Community, false);
        let (_registry, router) = router_with(vec![a, b]).await;

        let first = router.select_server_for_capability("render").await.unwrap();
        let second = router.select_server_for_capability("render").await.unwrap();
        let third = router.select_server_for_capability("render").await.unwrap();

        assert_ne!(first, second);
        assert_eq!(first, third);
    }

    #[tokio::test]
    async fn test_preference_list_skips_unavailable_entries() {
        let (registry, router) = router_with(vec![
            server("a", &["convert"], ServerSource::BuiltIn, false),
            server("b", &["convert"], ServerSource::Community, false),
        ])
        .await;
        router
            .set_preference("convert", vec!["a".to_string(), "b".to_string()])
            .await;

        registry
            .update_server_status("a", ServerStatus::Unknown, None)
            .await
            .unwrap();

        assert_eq!(
            router.select_server_for_capability("convert").await,
            Some("b".to_string())
        );
    }

    #[tokio::test]
    async fn test_no_available_candidate_returns_none() {
        let (registry, router) =
            router_with(vec![server("a", &["convert"], ServerSource::BuiltIn, false)]).await;

        registry
            .update_server_status("a", ServerStatus::Error, None)
            .await
            .unwrap();

        assert_eq!(router.select_server_for_capability("convert").await, None);
        assert_eq!(router.select_server_for_capability("unknown_cap").await, None);
    }
}
