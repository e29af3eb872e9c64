// Policy gate collaborator: compliance checks before sensitive operations

//! # Policy Gate
//!
//! The orchestrator consults a [`PolicyGate`] before a remote step executes.
//! A denial is a fatal, non-retryable step failure; the gate decides which
//! operations it cares about. The compliance engine behind the gate is an
//! external collaborator; this module only defines the contract and two
//! simple implementations.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;

/// Verdict for one operation in one context
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyDecision {
    pub allowed: bool,
    pub violations: Vec<String>,
}

impl PolicyDecision {
    pub fn allow() -> Self {
        PolicyDecision {
            allowed: true,
            violations: Vec::new(),
        }
    }

    pub fn deny(violations: Vec<String>) -> Self {
        PolicyDecision {
            allowed: false,
            violations,
        }
    }
}

/// Compliance collaborator contract
#[async_trait]
pub trait PolicyGate: Send + Sync {
    async fn validate(&self, operation: &str, context: &Value) -> PolicyDecision;
}

/// Permissive default: every operation passes
#[derive(Debug, Default, Clone)]
pub struct AllowAllPolicy;

#[async_trait]
impl PolicyGate for AllowAllPolicy {
    async fn validate(&self, _operation: &str, _context: &Value) -> PolicyDecision {
        PolicyDecision::allow()
    }
}

/// Denies a fixed set of operation names; everything else passes
#[derive(Debug, Default, Clone)]
pub struct DenyListPolicy {
    denied: HashSet<String>,
}

impl DenyListPolicy {
    pub fn new<I, S>(denied: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        DenyListPolicy {
            denied: denied.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl PolicyGate for DenyListPolicy {
    async fn validate(&self, operation: &str, _context: &Value) -> PolicyDecision {
        if self.denied.contains(operation) {
            PolicyDecision::deny(vec![format!("operation '{operation}' is restricted")])
        } else {
            PolicyDecision::allow()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_allow_all_passes_everything() {
        let gate = AllowAllPolicy;
        assert!(gate.validate("export_data", &Value::Null).await.allowed);
    }

    #[tokio::test]
    async fn test_deny_list_blocks_listed_operations() {
        let gate = DenyListPolicy::new(["export_data"]);
        let decision = gate.validate("export_data", &Value::Null).await;
        assert!(!decision.allowed);
        assert_eq!(decision.violations.len(), 1);
        assert!(gate.validate("read_file", &Value::Null).await.allowed);
    }
}
