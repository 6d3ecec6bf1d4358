use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use farcall_bundle::{Artifact, BundleBuilder, DependencyAnalyzer, WorkUnit};
use farcall_fs::{CommandTransport, Filesystem, SessionPool};
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, OnceCell};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::adapters::{
    BackendAdapter, KubernetesAdapter, LocalAdapter, ResourceSpec, SlurmAdapter, SshAdapter,
    StageDestination,
};
use crate::cache::ArtifactCache;
use crate::collaborators::{
    ConnectionInfo, CostEstimator, CredentialProvider, ResourceProvisioner, TargetSpec,
};
use crate::config::{BackendConfig, FarcallConfig, OrchestratorConfig};
use crate::driver::{supervise, JobContext, JobRecord, Readiness};
use crate::error::{OrchestratorError, Result};
use crate::job::{Job, JobHandle, JobResult, JobState};

/// Per-submission overrides of the configured defaults
#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    pub resources: Option<ResourceSpec>,
    pub timeout: Option<Duration>,
    /// Staging root; the adapter's default when unset
    pub destination: Option<StageDestination>,
}

impl SubmitOptions {
    pub fn resources(mut self, resources: ResourceSpec) -> Self {
        self.resources = Some(resources);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn destination(mut self, destination: StageDestination) -> Self {
        self.destination = Some(destination);
        self
    }
}

/// Turns work units into tracked jobs on registered backends
///
/// Analysis and bundling run once per submission before any network I/O;
/// everything after that runs on the job's own task.
pub struct JobOrchestrator {
    config: OrchestratorConfig,
    analyzer: DependencyAnalyzer,
    builder: BundleBuilder,
    backends: DashMap<String, Arc<dyn BackendAdapter>>,
    jobs: DashMap<Uuid, Arc<JobRecord>>,
    /// (target, artifact id) → job, for dedup
    submissions: DashMap<(String, String), Uuid>,
    cache: ArtifactCache,
    provisioner: Option<Arc<dyn ResourceProvisioner>>,
    cost: Option<Arc<dyn CostEstimator>>,
    ready: DashMap<String, Arc<OnceCell<ConnectionInfo>>>,
    sessions: Arc<SessionPool>,
}

impl JobOrchestrator {
    pub fn new(config: OrchestratorConfig) -> Self {
        Self {
            analyzer: DependencyAnalyzer::new(config.analyzer.clone()),
            builder: BundleBuilder::new(config.bundle.clone()),
            config,
            backends: DashMap::new(),
            jobs: DashMap::new(),
            submissions: DashMap::new(),
            cache: ArtifactCache::new(),
            provisioner: None,
            cost: None,
            ready: DashMap::new(),
            sessions: Arc::new(SessionPool::new()),
        }
    }

    /// Build an orchestrator with one adapter per configured backend. SSH
    /// based backends share sessions per host; credentials, when a provider
    /// is given, override the configured user and key.
    pub async fn from_config(
        config: &FarcallConfig,
        credentials: Option<&dyn CredentialProvider>,
    ) -> Result<Self> {
        config.validate()?;
        let orchestrator = Self::new(config.orchestrator());

        for (name, backend) in &config.backends {
            let adapter: Arc<dyn BackendAdapter> = match backend {
                BackendConfig::Local { workdir, python } => {
                    let workdir = workdir
                        .clone()
                        .unwrap_or_else(|| std::env::temp_dir().join("farcall"));
                    Arc::new(LocalAdapter::new(workdir, python.clone()))
                }
                BackendConfig::Ssh {
                    remote_dir, python, ..
                } => {
                    let session = orchestrator
                        .remote_session(name, backend, credentials)
                        .await?;
                    Arc::new(SshAdapter::new(session, remote_dir.clone(), python.clone()))
                }
                BackendConfig::Slurm {
                    remote_dir,
                    python,
                    partition,
                    account,
                    ..
                } => {
                    let session = orchestrator
                        .remote_session(name, backend, credentials)
                        .await?;
                    Arc::new(
                        SlurmAdapter::new(session, remote_dir.clone(), python.clone())
                            .with_partition(partition.clone())
                            .with_account(account.clone()),
                    )
                }
                BackendConfig::Kubernetes {
                    context,
                    namespace,
                    image,
                    kubectl,
                } => Arc::new(
                    KubernetesAdapter::new(namespace.clone(), image.clone())
                        .with_kubectl(kubectl.clone())
                        .with_context(context.clone()),
                ),
            };
            orchestrator.register_backend(name.clone(), adapter);
        }

        info!(
            "Orchestrator ready with {} backend(s): {}",
            config.backends.len(),
            config.backends.keys().cloned().collect::<Vec<_>>().join(", ")
        );
        Ok(orchestrator)
    }

    async fn remote_session(
        &self,
        name: &str,
        backend: &BackendConfig,
        credentials: Option<&dyn CredentialProvider>,
    ) -> Result<Arc<dyn CommandTransport>> {
        let mut target = backend
            .ssh_target()
            .ok_or_else(|| OrchestratorError::UnknownBackend(name.to_string()))?;
        if let Some(provider) = credentials {
            let credential = provider.get_credential(name).await?;
            credential.apply(&mut target);
        }
        debug!("Backend '{}' uses SSH target {}", name, target);
        let session: Arc<dyn CommandTransport> = self.sessions.session(&target);
        Ok(session)
    }

    pub fn with_provisioner(mut self, provisioner: Arc<dyn ResourceProvisioner>) -> Self {
        self.provisioner = Some(provisioner);
        self
    }

    pub fn with_cost_estimator(mut self, estimator: Arc<dyn CostEstimator>) -> Self {
        self.cost = Some(estimator);
        self
    }

    pub fn register_backend(&self, name: impl Into<String>, adapter: Arc<dyn BackendAdapter>) {
        let name = name.into();
        info!("Registered {} backend '{}'", adapter.kind(), name);
        self.backends.insert(name, adapter);
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn cache(&self) -> &ArtifactCache {
        &self.cache
    }

    /// The configured filesystem, sharing SSH sessions with the backends
    pub fn filesystem(&self) -> Arc<dyn Filesystem> {
        farcall_fs::from_config(&self.config.filesystem, &self.sessions)
    }

    fn backend(&self, target: &str) -> Result<Arc<dyn BackendAdapter>> {
        self.backends
            .get(target)
            .map(|a| a.clone())
            .ok_or_else(|| OrchestratorError::UnknownBackend(target.to_string()))
    }

    fn record(&self, handle: &JobHandle) -> Result<Arc<JobRecord>> {
        self.jobs
            .get(&handle.id)
            .map(|r| r.clone())
            .ok_or_else(|| OrchestratorError::JobNotFound(handle.id.to_string()))
    }

    /// Analyse and bundle off the async workers
    async fn build(&self, unit: &WorkUnit) -> Result<Artifact> {
        let analyzer = self.analyzer.clone();
        let builder = self.builder.clone();
        let unit = unit.clone();
        tokio::task::spawn_blocking(move || -> Result<Artifact> {
            let graph = analyzer.analyze(&unit)?;
            Ok(builder.build(&graph)?)
        })
        .await
        .map_err(|e| OrchestratorError::Other(anyhow::anyhow!("build task failed: {}", e)))?
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Produced interface
    // ═══════════════════════════════════════════════════════════════════════

    pub async fn submit(&self, unit: &WorkUnit, target: &str) -> Result<JobHandle> {
        self.submit_with(unit, target, SubmitOptions::default())
            .await
    }

    /// Build the artifact, register the job in `Created` and start its task.
    /// Returns before anything is staged.
    pub async fn submit_with(
        &self,
        unit: &WorkUnit,
        target: &str,
        options: SubmitOptions,
    ) -> Result<JobHandle> {
        let adapter = self.backend(target)?;
        let artifact = self.cache.insert(self.build(unit).await?);

        let key = (target.to_string(), artifact.id().to_string());
        let record = match self.submissions.entry(key) {
            Entry::Occupied(mut entry) => {
                if let Some(existing) = self.reusable(*entry.get()) {
                    info!(
                        "Artifact {} already submitted to '{}' as job {}",
                        artifact.id(),
                        target,
                        existing.id
                    );
                    return Ok(existing);
                }
                let record = self.register(&artifact, target, adapter.clone());
                entry.insert(record.id);
                record
            }
            Entry::Vacant(entry) => {
                let record = self.register(&artifact, target, adapter.clone());
                entry.insert(record.id);
                record
            }
        };

        let resources = options
            .resources
            .unwrap_or_else(|| self.config.resources.clone());
        if let Some(cost) = &self.cost {
            if let Some(estimate) = cost.estimate(&resources, adapter.kind()) {
                info!("Estimated cost for job {}: {}", record.id, estimate);
            }
        }

        let readiness = self.provisioner.as_ref().map(|provisioner| Readiness {
            provisioner: provisioner.clone(),
            cell: self
                .ready
                .entry(target.to_string())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone(),
            spec: TargetSpec {
                name: target.to_string(),
                kind: adapter.kind(),
                resources: resources.clone(),
            },
        });

        let ctx = JobContext {
            artifact: artifact.clone(),
            destination: options
                .destination
                .unwrap_or_else(|| adapter.default_destination()),
            resources,
            retry: self.config.retry.clone(),
            polling: self.config.polling.clone(),
            timeout: options.timeout.unwrap_or(self.config.timeout),
            readiness,
        };

        info!(
            "Submitted job {} ({}) to '{}' with artifact {}",
            record.id,
            artifact.qualified_name(),
            target,
            artifact.id()
        );
        let handle = JobHandle {
            id: record.id,
            target: target.to_string(),
            artifact_id: artifact.id().to_string(),
        };
        tokio::spawn(supervise(record, ctx));
        Ok(handle)
    }

    fn register(
        &self,
        artifact: &Artifact,
        target: &str,
        adapter: Arc<dyn BackendAdapter>,
    ) -> Arc<JobRecord> {
        let job = Job::new(
            artifact.id(),
            artifact.qualified_name(),
            target,
            adapter.kind(),
        );
        let record = Arc::new(JobRecord::new(job, adapter));
        self.jobs.insert(record.id, record.clone());
        record
    }

    /// Handle of an earlier job for the same artifact that is still running
    /// or finished successfully
    fn reusable(&self, job_id: Uuid) -> Option<JobHandle> {
        if !self.config.dedup {
            return None;
        }
        let record = self.jobs.get(&job_id)?.clone();
        match record.state() {
            JobState::Failed { .. } | JobState::Cancelled => return None,
            _ => {}
        }
        if matches!(record.outcome(), Some(Err(_))) {
            return None;
        }
        Some(JobHandle {
            id: record.id,
            target: record.target.clone(),
            artifact_id: record.artifact_id.clone(),
        })
    }

    /// Submit and wait for the result
    pub async fn submit_work_unit(&self, unit: &WorkUnit, target: &str) -> Result<JobResult> {
        let handle = self.submit(unit, target).await?;
        self.wait(&handle).await
    }

    pub fn get_job_status(&self, handle: &JobHandle) -> Result<JobState> {
        Ok(self.record(handle)?.state())
    }

    /// Snapshot of the job, including its transition history
    pub fn job(&self, handle: &JobHandle) -> Result<Job> {
        Ok(self.record(handle)?.snapshot())
    }

    pub fn jobs(&self) -> Vec<Job> {
        self.jobs.iter().map(|r| r.snapshot()).collect()
    }

    /// Receiver that is updated on every state transition
    pub fn watch(&self, handle: &JobHandle) -> Result<watch::Receiver<JobState>> {
        Ok(self.record(handle)?.subscribe())
    }

    /// Request cancellation; honoured at the job's next poll boundary
    pub fn cancel_job(&self, handle: &JobHandle) -> Result<()> {
        let record = self.record(handle)?;
        let state = record.state();
        if state.is_terminal() {
            return Err(OrchestratorError::InvalidStateTransition {
                from: state.state_name().to_string(),
                to: "cancelled".to_string(),
            });
        }
        info!("Cancelling job {} ({})", record.id, state);
        record.cancel.cancel();
        Ok(())
    }

    pub async fn wait(&self, handle: &JobHandle) -> Result<JobResult> {
        let record = self.record(handle)?;
        record
            .wait_outcome()
            .await
            .map_err(|failure| failure.into_error(record.id, &record.qualified_name))
    }

    /// Remove backend-side leftovers and forget the job. Only allowed once
    /// the job task has finished.
    pub async fn cleanup(&self, handle: &JobHandle) -> Result<()> {
        let record = self.record(handle)?;
        if record.outcome().is_none() {
            return Err(OrchestratorError::InvalidStateTransition {
                from: record.state().state_name().to_string(),
                to: "destroyed".to_string(),
            });
        }
        if let Some(remote) = record.remote() {
            if let Err(e) = record.adapter.cleanup(&remote).await {
                warn!(
                    "Cleanup of job {} ({}) on '{}' failed: {}",
                    record.id, remote.backend_job_id, record.target, e
                );
            }
        }
        self.jobs.remove(&record.id);
        self.submissions.retain(|_, id| *id != record.id);
        let referenced = self
            .jobs
            .iter()
            .any(|r| r.artifact_id == record.artifact_id);
        if !referenced && self.cache.remove(&record.artifact_id).is_some() {
            debug!("Evicted artifact {} from the cache", record.artifact_id);
        }
        debug!("Job {} destroyed", record.id);
        Ok(())
    }

    /// Cancel every unfinished job, wait for their tasks and close sessions
    pub async fn shutdown(&self) {
        let records: Vec<Arc<JobRecord>> = self.jobs.iter().map(|r| r.clone()).collect();
        for record in &records {
            if record.outcome().is_none() {
                record.cancel.cancel();
            }
        }
        join_all(records.iter().map(|r| r.wait_outcome())).await;
        self.sessions.close_all().await;
        info!("Orchestrator shut down ({} job(s) tracked)", records.len());
    }
}
