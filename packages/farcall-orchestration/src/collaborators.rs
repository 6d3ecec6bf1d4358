//! Interfaces to services the orchestrator consumes but does not implement:
//! credentials, target provisioning and cost lookups.

use async_trait::async_trait;
use farcall_fs::SshTarget;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use thiserror::Error;

use crate::adapters::{BackendKind, ResourceSpec};

// ═══════════════════════════════════════════════════════════════════════════
// Credentials
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuthMaterial {
    IdentityFile { path: PathBuf },
    /// Whatever the running ssh-agent offers
    Agent,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub username: String,
    pub auth_material: AuthMaterial,
}

impl Credential {
    /// Overlay this credential onto connection coordinates
    pub fn apply(&self, target: &mut SshTarget) {
        target.user = self.username.clone();
        if let AuthMaterial::IdentityFile { path } = &self.auth_material {
            target.identity_file = Some(path.clone());
        }
    }
}

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("No credential for target '{0}'")]
    NotFound(String),
}

#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn get_credential(&self, target: &str) -> Result<Credential, CredentialError>;
}

/// Map-backed provider for configuration and tests
#[derive(Debug, Clone, Default)]
pub struct StaticCredentials {
    entries: HashMap<String, Credential>,
}

impl StaticCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, target: impl Into<String>, credential: Credential) {
        self.entries.insert(target.into(), credential);
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentials {
    async fn get_credential(&self, target: &str) -> Result<Credential, CredentialError> {
        self.entries
            .get(target)
            .cloned()
            .ok_or_else(|| CredentialError::NotFound(target.to_string()))
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Provisioning
// ═══════════════════════════════════════════════════════════════════════════

/// What a provisioner needs to know about a backend target
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetSpec {
    pub name: String,
    pub kind: BackendKind,
    pub resources: ResourceSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub host: Option<String>,
    #[serde(default)]
    pub details: BTreeMap<String, String>,
}

/// Brings a target up before its first staging; called once per target
#[async_trait]
pub trait ResourceProvisioner: Send + Sync {
    async fn ensure_target_ready(&self, spec: &TargetSpec) -> anyhow::Result<ConnectionInfo>;
}

// ═══════════════════════════════════════════════════════════════════════════
// Cost
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostEstimate {
    pub amount: f64,
    pub currency: String,
    /// e.g. "per hour", "total"
    pub basis: String,
}

impl std::fmt::Display for CostEstimate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.2} {} {}", self.amount, self.currency, self.basis)
    }
}

/// Informational only; never consulted for a scheduling decision
pub trait CostEstimator: Send + Sync {
    fn estimate(&self, resources: &ResourceSpec, backend: BackendKind) -> Option<CostEstimate>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_credentials() {
        let mut creds = StaticCredentials::new();
        creds.insert(
            "hpc",
            Credential {
                username: "alice".to_string(),
                auth_material: AuthMaterial::IdentityFile {
                    path: PathBuf::from("/keys/hpc"),
                },
            },
        );

        let credential = creds.get_credential("hpc").await.unwrap();
        let mut target = SshTarget::new("login.hpc.example", "nobody");
        credential.apply(&mut target);
        assert_eq!(target.user, "alice");
        assert_eq!(target.identity_file, Some(PathBuf::from("/keys/hpc")));

        let err = creds.get_credential("cloud").await.unwrap_err();
        assert_eq!(err.to_string(), "No credential for target 'cloud'");
    }

    #[test]
    fn test_agent_keeps_identity_file() {
        let mut target = SshTarget::new("h", "u");
        target.identity_file = Some(PathBuf::from("/k"));
        Credential {
            username: "bob".to_string(),
            auth_material: AuthMaterial::Agent,
        }
        .apply(&mut target);
        assert_eq!(target.user, "bob");
        assert_eq!(target.identity_file, Some(PathBuf::from("/k")));
    }
}
