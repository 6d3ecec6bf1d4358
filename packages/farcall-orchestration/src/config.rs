//! `farcall.yaml` schema, loading and validation
//!
//! ```yaml
//! version: 1
//! logging:
//!   level: debug
//! retry:
//!   max_attempts: 5
//! polling:
//!   initial_interval_ms: 2000
//! timeout_secs: 7200
//! backends:
//!   hpc:
//!     kind: slurm
//!     host: login.hpc.example
//!     user: alice
//!     partition: gpu
//!   laptop:
//!     kind: local
//! ```

use farcall_bundle::{AnalyzerConfig, BundleConfig};
use farcall_fs::{FilesystemConfig, SshTarget};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::adapters::{BackendKind, ResourceSpec};
use crate::retry::{PollPolicy, RetryPolicy};
use crate::telemetry::LoggingConfig;

pub const SUPPORTED_VERSIONS: &[u32] = &[1];

#[derive(Error, Debug)]
pub enum ConfigError {
    /// Range validation error
    #[error("Invalid range for field '{field}': {value} not in {min}..={max}. {hint}")]
    Range {
        field: String,
        value: String,
        min: String,
        max: String,
        hint: String,
    },

    #[error("Missing 'version' field in configuration file. Add 'version: 1' to the top of your YAML file.")]
    MissingVersion,

    #[error("Unsupported configuration version {found}. Supported versions: {}", supported.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(", "))]
    UnsupportedVersion { found: u32, supported: Vec<u32> },

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

impl ConfigError {
    pub fn range_with_hint(
        field: impl Into<String>,
        value: impl ToString,
        min: impl ToString,
        max: impl ToString,
        hint: impl Into<String>,
    ) -> Self {
        Self::Range {
            field: field.into(),
            value: value.to_string(),
            min: min.to_string(),
            max: max.to_string(),
            hint: hint.into(),
        }
    }
}

fn check_range<T: PartialOrd + ToString>(
    field: &str,
    value: T,
    min: T,
    max: T,
    hint: &str,
) -> ConfigResult<()> {
    if value < min || value > max {
        return Err(ConfigError::range_with_hint(field, value, min, max, hint));
    }
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════════
// Backends
// ═══════════════════════════════════════════════════════════════════════════

/// One named backend target
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendConfig {
    Local {
        /// Staging root; defaults to `<tmp>/farcall`
        #[serde(default)]
        workdir: Option<PathBuf>,
        #[serde(default = "default_python")]
        python: String,
    },
    Ssh {
        host: String,
        user: String,
        #[serde(default = "default_ssh_port")]
        port: u16,
        #[serde(default)]
        identity_file: Option<PathBuf>,
        #[serde(default = "default_remote_dir")]
        remote_dir: String,
        #[serde(default = "default_python")]
        python: String,
    },
    Slurm {
        host: String,
        user: String,
        #[serde(default = "default_ssh_port")]
        port: u16,
        #[serde(default)]
        identity_file: Option<PathBuf>,
        #[serde(default = "default_remote_dir")]
        remote_dir: String,
        #[serde(default = "default_python")]
        python: String,
        #[serde(default)]
        partition: Option<String>,
        #[serde(default)]
        account: Option<String>,
    },
    Kubernetes {
        #[serde(default)]
        context: Option<String>,
        #[serde(default = "default_namespace")]
        namespace: String,
        #[serde(default = "default_image")]
        image: String,
        #[serde(default = "default_kubectl")]
        kubectl: String,
    },
}

fn default_python() -> String {
    "python3".to_string()
}

fn default_ssh_port() -> u16 {
    22
}

fn default_remote_dir() -> String {
    "~/.farcall".to_string()
}

fn default_namespace() -> String {
    "default".to_string()
}

fn default_image() -> String {
    "python:3.11-slim".to_string()
}

fn default_kubectl() -> String {
    "kubectl".to_string()
}

impl BackendConfig {
    pub fn kind(&self) -> BackendKind {
        match self {
            BackendConfig::Local { .. } => BackendKind::Local,
            BackendConfig::Ssh { .. } => BackendKind::Ssh,
            BackendConfig::Slurm { .. } => BackendKind::Slurm,
            BackendConfig::Kubernetes { .. } => BackendKind::Kubernetes,
        }
    }

    /// SSH coordinates for the remote-shell and Slurm backends
    pub fn ssh_target(&self) -> Option<SshTarget> {
        match self {
            BackendConfig::Ssh {
                host,
                user,
                port,
                identity_file,
                ..
            }
            | BackendConfig::Slurm {
                host,
                user,
                port,
                identity_file,
                ..
            } => Some(SshTarget {
                host: host.clone(),
                user: user.clone(),
                port: *port,
                identity_file: identity_file.clone(),
            }),
            _ => None,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Top level
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FarcallConfig {
    pub version: u32,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub analyzer: AnalyzerConfig,
    #[serde(default)]
    pub bundle: BundleConfig,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub polling: PollPolicy,
    /// Default per-job timeout
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Return the existing handle for an identical in-flight submission
    #[serde(default = "default_dedup")]
    pub dedup: bool,
    /// Default resources for submissions that do not name their own
    #[serde(default)]
    pub resources: ResourceSpec,
    #[serde(default)]
    pub filesystem: FilesystemConfig,
    #[serde(default)]
    pub backends: BTreeMap<String, BackendConfig>,
}

fn default_timeout_secs() -> u64 {
    3600
}

fn default_dedup() -> bool {
    true
}

impl Default for FarcallConfig {
    fn default() -> Self {
        Self {
            version: 1,
            logging: LoggingConfig::default(),
            analyzer: AnalyzerConfig::default(),
            bundle: BundleConfig::default(),
            retry: RetryPolicy::default(),
            polling: PollPolicy::default(),
            timeout_secs: default_timeout_secs(),
            dedup: default_dedup(),
            resources: ResourceSpec::default(),
            filesystem: FilesystemConfig::default(),
            backends: BTreeMap::new(),
        }
    }
}

impl FarcallConfig {
    /// Parse and validate a YAML document
    pub fn from_yaml_str(content: &str) -> ConfigResult<Self> {
        // Version first, so an old file gets a version error rather than a
        // field error
        let raw: serde_yaml::Value = serde_yaml::from_str(content)?;
        let version = raw
            .get("version")
            .ok_or(ConfigError::MissingVersion)?
            .as_u64()
            .ok_or_else(|| ConfigError::Invalid("'version' must be an integer".to_string()))?
            as u32;
        if !SUPPORTED_VERSIONS.contains(&version) {
            return Err(ConfigError::UnsupportedVersion {
                found: version,
                supported: SUPPORTED_VERSIONS.to_vec(),
            });
        }

        let config: FarcallConfig = serde_yaml::from_value(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    pub fn to_yaml(&self) -> ConfigResult<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        check_range(
            "retry.max_attempts",
            self.retry.max_attempts,
            1,
            20,
            "1 disables retries",
        )?;
        check_range(
            "retry.multiplier",
            self.retry.multiplier,
            1.0,
            10.0,
            "Use 1.0 for a constant delay",
        )?;
        check_range(
            "retry.initial_delay_ms",
            self.retry.initial_delay_ms,
            0,
            self.retry.max_delay_ms,
            "Must not exceed retry.max_delay_ms",
        )?;
        check_range(
            "polling.initial_interval_ms",
            self.polling.initial_interval_ms,
            10,
            self.polling.max_interval_ms.max(10),
            "Must be at least 10ms and not exceed polling.max_interval_ms",
        )?;
        check_range(
            "polling.multiplier",
            self.polling.multiplier,
            1.0,
            10.0,
            "Use 1.0 for a fixed poll interval",
        )?;
        check_range(
            "polling.unknown_budget",
            self.polling.unknown_budget,
            0,
            1000,
            "Consecutive unrecognised status tokens tolerated",
        )?;
        check_range(
            "timeout_secs",
            self.timeout_secs,
            1,
            30 * 24 * 3600,
            "At most 30 days",
        )?;

        tracing_subscriber::EnvFilter::try_new(&self.logging.level).map_err(|e| {
            ConfigError::Invalid(format!("logging.level '{}': {}", self.logging.level, e))
        })?;

        for (name, backend) in &self.backends {
            if name.is_empty() || name.contains(char::is_whitespace) {
                return Err(ConfigError::Invalid(format!(
                    "backend name '{}' must be non-empty without whitespace",
                    name
                )));
            }
            if let BackendConfig::Kubernetes { image, .. } = backend {
                if image.is_empty() {
                    return Err(ConfigError::Invalid(format!(
                        "backends.{}.image must not be empty",
                        name
                    )));
                }
            }
        }
        Ok(())
    }

    /// Settings handed to `JobOrchestrator::new`
    pub fn orchestrator(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            analyzer: self.analyzer.clone(),
            bundle: self.bundle.clone(),
            retry: self.retry.clone(),
            polling: self.polling.clone(),
            timeout: Duration::from_secs(self.timeout_secs),
            dedup: self.dedup,
            resources: self.resources.clone(),
            filesystem: self.filesystem.clone(),
        }
    }
}

/// Everything the orchestrator needs apart from its backends
#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorConfig {
    pub analyzer: AnalyzerConfig,
    pub bundle: BundleConfig,
    pub retry: RetryPolicy,
    pub polling: PollPolicy,
    pub timeout: Duration,
    pub dedup: bool,
    pub resources: ResourceSpec,
    pub filesystem: FilesystemConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        FarcallConfig::default().orchestrator()
    }
}
