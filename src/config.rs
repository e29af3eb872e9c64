// Mesh configuration loaded from file and environment

//! # Configuration
//!
//! [`MeshConfig`] carries every tunable the engines need: retry defaults,
//! breaker thresholds, checkpoint caps, and connection monitoring knobs.
//! `MeshConfig::load` layers an optional `toolmesh.toml` under `TOOLMESH_`
//! environment overrides, so deployments configure the mesh without code
//! changes while tests just build the struct directly.

use serde::{Deserialize, Serialize};

use crate::resilience::{CircuitBreakerConfig, RetryConfig};
use crate::{MeshError, Result};

/// Top-level mesh configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    /// Retry defaults for steps without their own policy
    pub retry: RetryConfig,
    /// Breaker settings applied to every per-server breaker
    pub breaker: CircuitBreakerConfig,
    /// Checkpoints kept per workflow before the oldest is evicted
    pub max_checkpoints_per_workflow: usize,
    /// A connection whose last ping is older than this is marked stale
    pub stale_connection_secs: i64,
    /// Period of the connection monitor sweep
    pub monitor_interval_secs: u64,
    /// Shared timeout across one fallback attempt sequence
    pub fallback_timeout_ms: u64,
}

impl Default for MeshConfig {
    fn default() -> Self {
        MeshConfig {
            retry: RetryConfig::default(),
            breaker: CircuitBreakerConfig::default(),
            max_checkpoints_per_workflow: 10,
            stale_connection_secs: 60,
            monitor_interval_secs: 30,
            fallback_timeout_ms: 30000,
        }
    }
}

impl MeshConfig {
    /// Load configuration: defaults, then an optional `toolmesh.toml`, then
    /// `TOOLMESH_`-prefixed environment variables (double underscore for
    /// nesting, e.g. `TOOLMESH_RETRY__MAX_RETRIES=5`)
    pub fn load() -> Result<Self> {
        Self::load_from("toolmesh")
    }

    pub fn load_from(file_stem: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(file_stem).required(false))
            .add_source(
                config::Environment::with_prefix("TOOLMESH")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| MeshError::Configuration(format!("config load failed: {e}")))?;

        let mut loaded: MeshConfig = settings
            .try_deserialize()
            .map_err(|e| MeshError::Configuration(format!("config parse failed: {e}")))?;

        if loaded.max_checkpoints_per_workflow == 0 {
            loaded.max_checkpoints_per_workflow = 1;
        }
        Ok(loaded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::BackoffStrategy;

    #[test]
    fn test_defaults_are_sane() {
        let cfg = MeshConfig::default();
        assert_eq!(cfg.retry.max_retries, 3);
        assert_eq!(cfg.retry.strategy, BackoffStrategy::Exponential);
        assert_eq!(cfg.breaker.failure_threshold, 5);
        assert!(cfg.max_checkpoints_per_workflow > 0);
    }

    #[test]
    fn test_config_serde_round_trip() {
        let cfg = MeshConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let back: MeshConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cfg);
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let back: MeshConfig =
            serde_json::from_str(r#"{"max_checkpoints_per_workflow": 3}"#).unwrap();
        assert_eq!(back.max_checkpoints_per_workflow, 3);
        assert_eq!(back.retry.max_retries, MeshConfig::default().retry.max_retries);
    }
}
