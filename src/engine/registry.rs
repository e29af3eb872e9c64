// Server registry: discovery, registration, capability indexing

//! # Server Registry
//!
//! The source of truth for "what servers exist and what can they do".
//! Definitions arrive through discovery sources or explicit registration,
//! get their capabilities indexed, and leave only through explicit
//! unregistration. Capability overlap between servers is legal and logged;
//! the capability router decides who actually serves an operation.
//!
//! The server map and capability index are guarded by separate `RwLock`s.
//! Lock order across the engine is registry locks before connection-manager
//! locks; nothing here calls into the connection manager while holding one.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use url::Url;

use super::events::EventBus;
use crate::models::{ServerDefinition, ServerStatus, Transport};
use crate::{MeshError, Result};

/// A place server definitions come from: a seed file, a well-known local
/// directory, a remote catalog. Sources are probed during discovery and an
/// unreachable source never fails the sweep.
#[async_trait]
pub trait DiscoverySource: Send + Sync {
    fn name(&self) -> &str;
    async fn discover(&self) -> Result<Vec<ServerDefinition>>;
}

/// Discovery source with a fixed set of definitions, typically seeded from
/// configuration
pub struct StaticDiscovery {
    name: String,
    servers: Vec<ServerDefinition>,
}

impl StaticDiscovery {
    pub fn new<N: Into<String>>(name: N, servers: Vec<ServerDefinition>) -> Self {
        StaticDiscovery {
            name: name.into(),
            servers,
        }
    }
}

#[async_trait]
impl DiscoverySource for StaticDiscovery {
    fn name(&self) -> &str {
        &self.name
    }

    async fn discover(&self) -> Result<Vec<ServerDefinition>> {
        Ok(self.servers.clone())
    }
}

/// Registry of known tool servers and their capabilities
pub struct ServerRegistry {
    servers: RwLock<HashMap<String, ServerDefinition>>,
    /// capability name -> ids of servers offering it
    capability_index: RwLock<HashMap<String, Vec<String>>>,
    sources: Vec<std::sync::Arc<dyn DiscoverySource>>,
    events: EventBus,
}

impl ServerRegistry {
    pub fn new(sources: Vec<std::sync::Arc<dyn DiscoverySource>>, events: EventBus) -> Self {
        ServerRegistry {
            servers: RwLock::new(HashMap::new()),
            capability_index: RwLock::new(HashMap::new()),
            sources,
            events,
        }
    }

    /// Probe every discovery source, merge results by id, register anything
    /// new, and return the full registered set ordered by id.
    ///
    /// A failing source is skipped, never fatal. With an unchanged
    /// environment repeated sweeps are idempotent and order-stable.
    pub async fn discover_servers(&self) -> Vec<ServerDefinition> {
        let mut merged: HashMap<String, ServerDefinition> = HashMap::new();

        for source in &self.sources {
            match source.discover().await {
                Ok(found) => {
                    debug!(source = source.name(), count = found.len(), "source probed");
                    for definition in found {
                        // First source to claim an id wins the merge
                        merged.entry(definition.id.clone()).or_insert(definition);
                    }
                }
                Err(err) => {
                    warn!(source = source.name(), error = %err, "discovery source failed, skipping");
                }
            }
        }

        for definition in merged.into_values() {
            match self.register_server(definition).await {
                Ok(()) => {}
                Err(MeshError::DuplicateServer { .. }) => {
                    // Already known from a previous sweep or manual registration
                }
                Err(err) => {
                    warn!(error = %err, "discovered definition rejected");
                }
            }
        }

        let servers = self.get_registered_servers().await;
        self.events.emit_discovery_completed(servers.len());
        servers
    }

    /// Register one server definition.
    ///
    /// Rejects malformed definitions and duplicate ids; an id collision
    /// leaves the existing registration untouched. Capability overlap with
    /// other servers is logged, not rejected.
    pub async fn register_server(&self, definition: ServerDefinition) -> Result<()> {
        definition.validate().map_err(MeshError::Validation)?;

        let mut servers = self.servers.write().await;
        if servers.contains_key(&definition.id) {
            return Err(MeshError::DuplicateServer {
                id: definition.id.clone(),
            });
        }

        {
            let mut index = self.capability_index.write().await;
            for capability in &definition.capabilities {
                let offering = index.entry(capability.clone()).or_default();
                if !offering.is_empty() {
                    info!(
                        capability,
                        server_id = %definition.id,
                        existing = ?offering,
                        "capability offered by multiple servers"
                    );
                }
                offering.push(definition.id.clone());
            }
        }

        self.events
            .emit_server_registered(&definition.id, &definition.capabilities);
        info!(server_id = %definition.id, transport = %definition.transport, "server registered");
        servers.insert(definition.id.clone(), definition);
        Ok(())
    }

    pub async fn unregister_server(&self, server_id: &str) -> Result<ServerDefinition> {
        let mut servers = self.servers.write().await;
        let removed = servers
            .remove(server_id)
            .ok_or_else(|| MeshError::ServerNotFound {
                id: server_id.to_string(),
            })?;

        let mut index = self.capability_index.write().await;
        for capability in &removed.capabilities {
            if let Some(offering) = index.get_mut(capability) {
                offering.retain(|id| id != server_id);
                if offering.is_empty() {
                    index.remove(capability);
                }
            }
        }

        self.events.emit_server_unregistered(server_id);
        Ok(removed)
    }

    pub async fn get_server(&self, server_id: &str) -> Result<ServerDefinition> {
        let servers = self.servers.read().await;
        servers
            .get(server_id)
            .cloned()
            .ok_or_else(|| MeshError::ServerNotFound {
                id: server_id.to_string(),
            })
    }

    /// Every registered server, ordered by id
    pub async fn get_registered_servers(&self) -> Vec<ServerDefinition> {
        let servers = self.servers.read().await;
        let mut all: Vec<ServerDefinition> = servers.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    pub async fn get_server_capabilities(&self, server_id: &str) -> Result<Vec<String>> {
        self.get_server(server_id)
            .await
            .map(|def| def.capabilities)
    }

    /// Servers currently offering `capability`, ordered by id
    pub async fn servers_with_capability(&self, capability: &str) -> Vec<ServerDefinition> {
        let ids: Vec<String> = {
            let index = self.capability_index.read().await;
            index.get(capability).cloned().unwrap_or_default()
        };
        let servers = self.servers.read().await;
        let mut found: Vec<ServerDefinition> = ids
            .iter()
            .filter_map(|id| servers.get(id).cloned())
            .collect();
        found.sort_by(|a, b| a.id.cmp(&b.id));
        found
    }

    pub async fn update_server_status(
        &self,
        server_id: &str,
        status: ServerStatus,
        error: Option<String>,
    ) -> Result<()> {
        let mut servers = self.servers.write().await;
        let server = servers
            .get_mut(server_id)
            .ok_or_else(|| MeshError::ServerNotFound {
                id: server_id.to_string(),
            })?;
        if let Some(reason) = error {
            warn!(server_id, status = ?status, reason, "server status updated");
        } else {
            debug!(server_id, status = ?status, "server status updated");
        }
        server.status = status;
        Ok(())
    }

    /// Cheap liveness stand-in: existence check for local executables, URL
    /// shape check for network servers. The connection manager performs the
    /// real reachability probe when it connects.
    pub async fn validate_server_connection(&self, server_id: &str) -> Result<bool> {
        let server = self.get_server(server_id).await?;
        let valid = match server.transport {
            Transport::Stdio => executable_exists(server.connection.endpoint()),
            Transport::Http => matches_scheme(server.connection.endpoint(), &["http", "https"]),
            Transport::WebSocket => matches_scheme(server.connection.endpoint(), &["ws", "wss"]),
        };
        Ok(valid)
    }
}

fn executable_exists(command: &str) -> bool {
    let path = Path::new(command);
    if path.components().count() > 1 {
        return path.exists();
    }
    // Bare command name: search PATH
    std::env::var_os("PATH")
        .map(|paths| {
            std::env::split_paths(&paths).any(|dir| dir.join(command).exists())
        })
        .unwrap_or(false)
}

fn matches_scheme(endpoint: &str, schemes: &[&str]) -> bool {
    Url::parse(endpoint)
        .map(|url| schemes.contains(&url.scheme()))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn registry() -> ServerRegistry {
        ServerRegistry::new(Vec::new(), EventBus::new())
    }

    fn http_server(id: &str, capabilities: &[&str]) -> ServerDefinition {
        ServerDefinition::http(
            id,
            format!("{id} server"),
            format!("http://localhost:9000/{id}"),
            5000,
            capabilities.iter().map(|c| c.to_string()).collect(),
        )
    }

    #[tokio::test]
    async fn test_register_and_lookup() {
        let registry = registry();
        registry
            .register_server(http_server("conv", &["convert", "render"]))
            .await
            .unwrap();

        let caps = registry.get_server_capabilities("conv").await.unwrap();
        assert_eq!(caps, vec!["convert", "render"]);

        let offering = registry.servers_with_capability("convert").await;
        assert_eq!(offering.len(), 1);
        assert_eq!(offering[0].id, "conv");
    }

    #[tokio::test]
    async fn test_unknown_server_is_not_found() {
        let registry = registry();
        assert!(matches!(
            registry.get_server_capabilities("ghost").await,
            Err(MeshError::ServerNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_duplicate_id_leaves_first_registration_untouched() {
        let registry = registry();
        registry
            .register_server(http_server("conv", &["convert"]))
            .await
            .unwrap();

        let mut second = http_server("conv", &["scan"]);
        second.name = "impostor".to_string();
        let err = registry.register_server(second).await.unwrap_err();
        assert!(matches!(err, MeshError::DuplicateServer { .. }));

        let kept = registry.get_server("conv").await.unwrap();
        assert_eq!(kept.name, "conv server");
        assert_eq!(kept.capabilities, vec!["convert"]);
        assert!(registry.servers_with_capability("scan").await.is_empty());
    }

    #[tokio::test]
    async fn test_registration_rejects_invalid_definitions() {
        let registry = registry();
        let mut no_caps = http_server("x", &["op"]);
        no_caps.capabilities.clear();
        assert!(matches!(
            registry.register_server(no_caps).await,
            Err(MeshError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_capability_overlap_is_allowed() {
        let registry = registry();
        registry
            .register_server(http_server("a", &["convert"]))
            .await
            .unwrap();
        registry
            .register_server(http_server("b", &["convert"]))
            .await
            .unwrap();

        let offering = registry.servers_with_capability("convert").await;
        assert_eq!(offering.len(), 2);
    }

    #[tokio::test]
    async fn test_unregister_removes_capability_entries() {
        let registry = registry();
        registry
            .register_server(http_server("a", &["convert"]))
            .await
            .unwrap();
        registry.unregister_server("a").await.unwrap();

        assert!(registry.servers_with_capability("convert").await.is_empty());
        assert!(registry.get_server("a").await.is_err());
    }

    #[tokio::test]
    async fn test_discovery_is_idempotent_and_order_stable() {
        let source_a = Arc::new(StaticDiscovery::new(
            "seed-a",
            vec![http_server("beta", &["convert"]), http_server("alpha", &["scan"])],
        ));
        let source_b = Arc::new(StaticDiscovery::new(
            "seed-b",
            // Overlapping id: first source wins the merge
            vec![http_server("alpha", &["other"]), http_server("gamma", &["render"])],
        ));
        let registry = ServerRegistry::new(vec![source_a, source_b], EventBus::new());

        let first = registry.discover_servers().await;
        let second = registry.discover_servers().await;

        let ids: Vec<&str> = first.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["alpha", "beta", "gamma"]);
        assert_eq!(first, second);

        let alpha = registry.get_server("alpha").await.unwrap();
        assert_eq!(alpha.capabilities, vec!["scan"]);
    }

    struct FailingSource;

    #[async_trait]
    impl DiscoverySource for FailingSource {
        fn name(&self) -> &str {
            "broken"
        }

        async fn discover(&self) -> Result<Vec<ServerDefinition>> {
            Err(MeshError::Connection {
                server_id: "catalog".to_string(),
                reason: "unreachable".to_string(),
            })
        }
    }

    #[tokio::test]
    async fn test_failing_source_is_skipped() {
        let registry = ServerRegistry::new(
            vec![
                Arc::new(FailingSource),
                Arc::new(StaticDiscovery::new("seed", vec![http_server("a", &["op"])])),
            ],
            EventBus::new(),
        );

        let servers = registry.discover_servers().await;
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].id, "a");
    }

    #[tokio::test]
    async fn test_update_server_status() {
        let registry = registry();
        registry
            .register_server(http_server("a", &["op"]))
            .await
            .unwrap();
        registry
            .update_server_status("a", ServerStatus::Error, Some("probe failed".to_string()))
            .await
            .unwrap();
        assert_eq!(
            registry.get_server("a").await.unwrap().status,
            ServerStatus::Error
        );
    }

    #[tokio::test]
    async fn test_validate_connection_checks_url_scheme() {
        let registry = registry();
        registry
            .register_server(http_server("good", &["op"]))
            .await
            .unwrap();
        assert!(registry.validate_server_connection("good").await.unwrap());

        let mut bad = http_server("bad", &["op"]);
        bad.connection = crate::models::ConnectionParams::Http {
            url: "ftp://nope".to_string(),
            timeout_ms: 5000,
        };
        registry.register_server(bad).await.unwrap();
        assert!(!registry.validate_server_connection("bad").await.unwrap());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_validate_connection_checks_executable() {
        let registry = registry();
        registry
            .register_server(ServerDefinition::stdio(
                "sh",
                "Shell",
                "/bin/sh",
                vec![],
                1000,
                vec!["run".to_string()],
            ))
            .await
            .unwrap();
        assert!(registry.validate_server_connection("sh").await.unwrap());

        registry
            .register_server(ServerDefinition::stdio(
                "ghost",
                "Ghost",
                "/definitely/not/here",
                vec![],
                1000,
                vec!["run".to_string()],
            ))
            .await
            .unwrap();
        assert!(!registry.validate_server_connection("ghost").await.unwrap());
    }
}
