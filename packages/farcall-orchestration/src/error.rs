use farcall_bundle::{AnalysisError, BuildError};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::collaborators::CredentialError;
use crate::config::ConfigError;

pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Analysis error: {0}")]
    Analysis(#[from] AnalysisError),

    #[error("Build error: {0}")]
    Build(#[from] BuildError),

    #[error("Submission to '{target}' failed after {attempts} attempt(s): {detail}")]
    Submission {
        target: String,
        attempts: u32,
        detail: String,
    },

    /// Tracking stopped; the remote job's true outcome is unknown
    #[error("Lost track of job {job_id} (last observed state: {last_state}, outcome unknown): {detail}")]
    Monitoring {
        job_id: Uuid,
        last_state: String,
        detail: String,
    },

    /// The remote computation succeeded but its result could not be fetched
    #[error("Job {job_id} completed but its result could not be retrieved: {detail}")]
    ResultRetrieval { job_id: Uuid, detail: String },

    #[error("{qualified_name} failed remotely (job {job_id}, backend job {backend_job_id}): {diagnostics}")]
    RemoteExecution {
        job_id: Uuid,
        backend_job_id: String,
        qualified_name: String,
        diagnostics: String,
    },

    #[error("Job {job_id} timed out after {elapsed:?}")]
    Timeout { job_id: Uuid, elapsed: Duration },

    #[error("Job {0} was cancelled")]
    Cancelled(Uuid),

    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("No backend named '{0}' is registered")]
    UnknownBackend(String),

    #[error(transparent)]
    Credential(#[from] CredentialError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl OrchestratorError {
    /// Category for callers deciding whether to resubmit
    pub fn category(&self) -> ErrorCategory {
        match self {
            OrchestratorError::Build(e) if e.is_retryable() => ErrorCategory::Transient,
            OrchestratorError::Submission { .. }
            | OrchestratorError::Monitoring { .. }
            | OrchestratorError::ResultRetrieval { .. }
            | OrchestratorError::Timeout { .. } => ErrorCategory::Transient,
            OrchestratorError::Io(_) | OrchestratorError::Other(_) => ErrorCategory::Infrastructure,
            _ => ErrorCategory::Permanent,
        }
    }
}

/// Error category for retry logic
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Transient error - retry automatically (e.g., timeout, connection)
    Transient,
    /// Permanent error - don't retry (e.g., rejected submission, bad output)
    Permanent,
    /// Infrastructure error - alert ops (e.g., disk full, missing binary)
    Infrastructure,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Transient => "transient",
            ErrorCategory::Permanent => "permanent",
            ErrorCategory::Infrastructure => "infrastructure",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorCategory::Transient)
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
