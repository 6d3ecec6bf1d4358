/*
 * Farcall Orchestration - remote execution of work units
 *
 * Takes a work unit through analysis and bundling, then drives the
 * resulting job on a configured backend until it reaches a terminal state.
 *
 * Architecture:
 * - Job State Machine (Created → Staged → Submitted → Queued/Running → terminal)
 * - Backend Adapters (local, ssh, slurm, kubernetes)
 * - Retry / Poll Policies (bounded exponential backoff)
 * - Artifact Cache (content-addressed, submission dedup)
 * - Collaborator Interfaces (credentials, provisioning, cost)
 */

// Public modules
pub mod adapters;
pub mod cache;
pub mod collaborators;
pub mod config;
pub mod error;
pub mod job;
pub mod orchestrator;
pub mod retry;
pub mod telemetry;

mod driver;

// Re-exports
pub use adapters::{
    AdapterError, BackendAdapter, BackendKind, KubernetesAdapter, LocalAdapter, RemoteJob,
    RemotePayload, RemotePhase, RemoteStatus, ResourceSpec, SlurmAdapter, SshAdapter,
    StageDestination, StagedRef,
};
pub use cache::ArtifactCache;
pub use collaborators::{
    AuthMaterial, ConnectionInfo, CostEstimate, CostEstimator, Credential, CredentialError,
    CredentialProvider, ResourceProvisioner, StaticCredentials, TargetSpec,
};
pub use config::{BackendConfig, ConfigError, FarcallConfig, OrchestratorConfig};
pub use error::{ErrorCategory, OrchestratorError, Result};
pub use job::{FailureReason, Job, JobHandle, JobResult, JobState, JobStateMachine, StateTransition};
pub use orchestrator::{JobOrchestrator, SubmitOptions};
pub use retry::{PollPolicy, RetryExhausted, RetryPolicy};
pub use telemetry::{init_tracing, LoggingConfig};
