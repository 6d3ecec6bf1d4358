//! Backend adapters
//!
//! One `BackendAdapter` implementation per backend family, selected by
//! configuration:
//! - `local`: subprocess on this machine (zero-network fallback)
//! - `ssh`: background process on a remote host
//! - `slurm`: batch scheduler reached over SSH
//! - `kubernetes`: batch/v1 Job created through kubectl
//!
//! Adapters are stateless per call apart from their transport; many jobs
//! share one adapter instance.

use async_trait::async_trait;
use farcall_bundle::{Artifact, BuildError};
use farcall_fs::TransportError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;

use crate::collaborators::CredentialError;
use crate::error::ErrorCategory;

pub mod kubernetes;
pub mod local;
pub mod slurm;
pub mod ssh;

pub use kubernetes::KubernetesAdapter;
pub use local::LocalAdapter;
pub use slurm::SlurmAdapter;
pub use ssh::SshAdapter;

/// Stdout marker the bootstrap prints before the result JSON
pub const RESULT_MARKER: &str = farcall_bundle::features::bundling::templates::RESULT_MARKER;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Local,
    Ssh,
    Slurm,
    Kubernetes,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Local => "local",
            BackendKind::Ssh => "ssh",
            BackendKind::Slurm => "slurm",
            BackendKind::Kubernetes => "kubernetes",
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Where staged artifacts land (a directory on the target, or a namespace-
/// level prefix for container backends)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageDestination {
    pub root: String,
}

impl StageDestination {
    pub fn new(root: impl Into<String>) -> Self {
        Self { root: root.into() }
    }

    /// `<root>/<name>`
    pub fn join(&self, name: &str) -> String {
        format!("{}/{}", self.root.trim_end_matches('/'), name)
    }
}

/// An artifact present on the target, ready to submit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagedRef {
    pub artifact_id: String,
    /// Staged directory (or config map name)
    pub location: String,
}

/// A submission as the backend knows it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteJob {
    /// Scheduler job id, pid or resource name
    pub backend_job_id: String,
    pub artifact_id: String,
    /// Directory holding the staged bundle
    pub staged_location: String,
    /// Where `result.json` and the sentinels are written
    pub output_location: String,
}

/// Canonical phase every backend maps its native status into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemotePhase {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// One poll observation; `phase` is `None` when the native token is not
/// recognised
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteStatus {
    pub phase: Option<RemotePhase>,
    pub raw: String,
}

impl RemoteStatus {
    pub fn known(phase: RemotePhase, raw: impl Into<String>) -> Self {
        Self {
            phase: Some(phase),
            raw: raw.into(),
        }
    }

    pub fn unknown(raw: impl Into<String>) -> Self {
        Self {
            phase: None,
            raw: raw.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResourceSpec {
    #[serde(default = "default_cpus")]
    pub cpus: u32,
    #[serde(default = "default_memory_mb")]
    pub memory_mb: u64,
    #[serde(default)]
    pub gpus: u32,
    #[serde(default)]
    pub walltime_secs: Option<u64>,
    #[serde(default)]
    pub partition: Option<String>,
    /// Backend-specific extras (`#SBATCH --<key>=<value>`, pod labels, ...)
    #[serde(default)]
    pub extra: BTreeMap<String, String>,
}

fn default_cpus() -> u32 {
    1
}

fn default_memory_mb() -> u64 {
    1024
}

impl Default for ResourceSpec {
    fn default() -> Self {
        Self {
            cpus: default_cpus(),
            memory_mb: default_memory_mb(),
            gpus: 0,
            walltime_secs: None,
            partition: None,
            extra: BTreeMap::new(),
        }
    }
}

/// Contents of `result.json` (or the log marker line)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemotePayload {
    pub ok: bool,
    #[serde(default)]
    pub value: Value,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub traceback: Option<String>,
    /// Tail of the job's stderr/log, when the adapter could read it
    #[serde(skip)]
    pub log_tail: Option<String>,
}

impl RemotePayload {
    pub fn parse(text: &str) -> Result<Self, AdapterError> {
        serde_json::from_str(text.trim()).map_err(|e| AdapterError::Parse {
            operation: "result",
            output: format!("{}: {}", e, truncate(text, 200)),
        })
    }

    /// Find the `__FARCALL_RESULT__` line in captured stdout
    pub fn from_log(log: &str) -> Result<Self, AdapterError> {
        let line = log
            .lines()
            .rev()
            .find_map(|l| l.trim().strip_prefix(RESULT_MARKER))
            .ok_or_else(|| AdapterError::ResultMissing("no result marker in job log".to_string()))?;
        let mut payload = Self::parse(line)?;
        payload.log_tail = Some(tail_lines(log, 40));
        Ok(payload)
    }

    pub fn with_log_tail(mut self, tail: Option<String>) -> Self {
        self.log_tail = tail.filter(|t| !t.trim().is_empty());
        self
    }

    /// Human-readable failure report: error, traceback, log tail
    pub fn diagnostics(&self) -> String {
        let mut parts = Vec::new();
        if let Some(error) = &self.error {
            parts.push(error.clone());
        }
        if let Some(traceback) = &self.traceback {
            parts.push(traceback.trim_end().to_string());
        }
        if let Some(tail) = &self.log_tail {
            parts.push(format!("--- log tail ---\n{}", tail.trim_end()));
        }
        if parts.is_empty() {
            "no diagnostics available".to_string()
        } else {
            parts.join("\n")
        }
    }
}

/// Last `n` lines of `text`
pub fn tail_lines(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    lines[lines.len().saturating_sub(n)..].join("\n")
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("{operation} failed on {target} (exit {status}): {stderr}")]
    Command {
        operation: &'static str,
        target: String,
        status: i32,
        stderr: String,
    },

    #[error("unexpected output from {operation}: {output}")]
    Parse {
        operation: &'static str,
        output: String,
    },

    #[error("result not available yet: {0}")]
    ResultMissing(String),

    #[error("packaging failed: {0}")]
    Packaging(#[from] BuildError),

    #[error("job {0} is not known to this adapter")]
    UnknownJob(String),

    #[error(transparent)]
    Credential(#[from] CredentialError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl AdapterError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            AdapterError::Transport(TransportError::Spawn { .. }) => ErrorCategory::Infrastructure,
            AdapterError::Transport(_) | AdapterError::ResultMissing(_) | AdapterError::Io(_) => {
                ErrorCategory::Transient
            }
            AdapterError::Packaging(e) if e.is_retryable() => ErrorCategory::Transient,
            _ => ErrorCategory::Permanent,
        }
    }

    pub(crate) fn command(
        operation: &'static str,
        target: impl Into<String>,
        output: &farcall_fs::CommandOutput,
    ) -> Self {
        AdapterError::Command {
            operation,
            target: target.into(),
            status: output.status,
            stderr: output.stderr.trim().to_string(),
        }
    }
}

#[async_trait]
pub trait BackendAdapter: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Where artifacts are staged unless the submission overrides it
    fn default_destination(&self) -> StageDestination;

    async fn stage(
        &self,
        artifact: &Artifact,
        destination: &StageDestination,
    ) -> Result<StagedRef, AdapterError>;

    async fn submit(
        &self,
        staged: &StagedRef,
        resources: &ResourceSpec,
    ) -> Result<RemoteJob, AdapterError>;

    async fn poll(&self, job: &RemoteJob) -> Result<RemoteStatus, AdapterError>;

    async fn cancel(&self, job: &RemoteJob) -> Result<(), AdapterError>;

    async fn fetch_result(&self, job: &RemoteJob) -> Result<RemotePayload, AdapterError>;

    /// Best-effort removal of backend-side bookkeeping for one job
    async fn cleanup(&self, job: &RemoteJob) -> Result<(), AdapterError>;
}

/// Short run identifier used for per-submission output directories
pub(crate) fn run_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..12].to_string()
}
