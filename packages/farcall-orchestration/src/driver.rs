//! Per-job task: stage, submit, poll, fetch
//!
//! Each job runs on its own tokio task, so a slow backend call for one job
//! never delays another job's poll cycle. All state transitions for a job
//! happen here; callers only set the cancellation token.

use farcall_bundle::Artifact;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, OnceCell};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::adapters::{BackendAdapter, RemoteJob, RemotePhase, ResourceSpec, StageDestination};
use crate::collaborators::{ConnectionInfo, ResourceProvisioner, TargetSpec};
use crate::error::OrchestratorError;
use crate::job::{FailureReason, Job, JobResult, JobState, JobStateMachine};
use crate::retry::{PollPolicy, RetryPolicy};

/// How a job ended, kept cloneable so every waiter gets its own copy
#[derive(Debug, Clone)]
pub(crate) enum JobFailure {
    Submission {
        target: String,
        attempts: u32,
        detail: String,
    },
    Monitoring {
        last_state: String,
        detail: String,
    },
    ResultRetrieval {
        detail: String,
    },
    RemoteExecution {
        backend_job_id: String,
        diagnostics: String,
    },
    Timeout {
        elapsed: Duration,
    },
    Cancelled,
}

impl JobFailure {
    pub(crate) fn into_error(self, job_id: Uuid, qualified_name: &str) -> OrchestratorError {
        match self {
            JobFailure::Submission {
                target,
                attempts,
                detail,
            } => OrchestratorError::Submission {
                target,
                attempts,
                detail,
            },
            JobFailure::Monitoring { last_state, detail } => OrchestratorError::Monitoring {
                job_id,
                last_state,
                detail,
            },
            JobFailure::ResultRetrieval { detail } => {
                OrchestratorError::ResultRetrieval { job_id, detail }
            }
            JobFailure::RemoteExecution {
                backend_job_id,
                diagnostics,
            } => OrchestratorError::RemoteExecution {
                job_id,
                backend_job_id,
                qualified_name: qualified_name.to_string(),
                diagnostics,
            },
            JobFailure::Timeout { elapsed } => OrchestratorError::Timeout { job_id, elapsed },
            JobFailure::Cancelled => OrchestratorError::Cancelled(job_id),
        }
    }
}

pub(crate) type Outcome = std::result::Result<JobResult, JobFailure>;

// ═══════════════════════════════════════════════════════════════════════════
// Job record
// ═══════════════════════════════════════════════════════════════════════════

/// Registry entry shared between the orchestrator and the job task
pub(crate) struct JobRecord {
    pub(crate) id: Uuid,
    pub(crate) target: String,
    pub(crate) qualified_name: String,
    pub(crate) artifact_id: String,
    pub(crate) adapter: Arc<dyn BackendAdapter>,
    pub(crate) cancel: CancellationToken,
    machine: Mutex<JobStateMachine>,
    states: watch::Sender<JobState>,
    outcome: watch::Sender<Option<Outcome>>,
    remote: Mutex<Option<RemoteJob>>,
}

impl JobRecord {
    pub(crate) fn new(job: Job, adapter: Arc<dyn BackendAdapter>) -> Self {
        let (states, _) = watch::channel(job.state);
        let (outcome, _) = watch::channel(None);
        Self {
            id: job.id,
            target: job.target.clone(),
            qualified_name: job.qualified_name.clone(),
            artifact_id: job.artifact_id.clone(),
            adapter,
            cancel: CancellationToken::new(),
            machine: Mutex::new(JobStateMachine::new(job)),
            states,
            outcome,
            remote: Mutex::new(None),
        }
    }

    pub(crate) fn snapshot(&self) -> Job {
        self.machine.lock().job().clone()
    }

    pub(crate) fn state(&self) -> JobState {
        self.machine.lock().state()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<JobState> {
        self.states.subscribe()
    }

    pub(crate) fn remote(&self) -> Option<RemoteJob> {
        self.remote.lock().clone()
    }

    pub(crate) fn outcome(&self) -> Option<Outcome> {
        self.outcome.borrow().clone()
    }

    /// Resolves once the job task has recorded an outcome
    pub(crate) async fn wait_outcome(&self) -> Outcome {
        let mut rx = self.outcome.subscribe();
        let result = rx.wait_for(|o| o.is_some()).await;
        match result {
            Ok(outcome) => outcome.clone().unwrap_or(Err(JobFailure::Cancelled)),
            // The sender lives in `self`, so this only happens while tearing down
            Err(_) => Err(JobFailure::Cancelled),
        }
    }

    /// Apply a transition and publish the new state under the same lock, so
    /// watchers see transitions in order
    fn apply<F>(&self, transition: F) -> Result<(), JobFailure>
    where
        F: FnOnce(&mut JobStateMachine) -> crate::error::Result<()>,
    {
        let mut machine = self.machine.lock();
        let before = machine.state();
        match transition(&mut machine) {
            Ok(()) => {
                let after = machine.state();
                if after != before {
                    self.states.send_replace(after);
                }
                Ok(())
            }
            Err(e) => Err(JobFailure::Monitoring {
                last_state: before.to_string(),
                detail: e.to_string(),
            }),
        }
    }

    fn mark_polled(&self) {
        self.machine.lock().mark_polled();
    }

    fn finish(&self, outcome: Outcome) {
        self.outcome.send_replace(Some(outcome));
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Job task
// ═══════════════════════════════════════════════════════════════════════════

/// Runs `ensure_target_ready` at most once per target
pub(crate) struct Readiness {
    pub(crate) provisioner: Arc<dyn ResourceProvisioner>,
    pub(crate) cell: Arc<OnceCell<ConnectionInfo>>,
    pub(crate) spec: TargetSpec,
}

impl Readiness {
    async fn ensure(&self) -> anyhow::Result<()> {
        self.cell
            .get_or_try_init(|| self.provisioner.ensure_target_ready(&self.spec))
            .await
            .map(|info| debug!("Target {} ready: {:?}", self.spec.name, info.host))
    }
}

pub(crate) struct JobContext {
    pub(crate) artifact: Arc<Artifact>,
    pub(crate) destination: StageDestination,
    pub(crate) resources: ResourceSpec,
    pub(crate) retry: RetryPolicy,
    pub(crate) polling: PollPolicy,
    pub(crate) timeout: Duration,
    pub(crate) readiness: Option<Readiness>,
}

/// Entry point of the job task. `drive` runs on a child task so that a
/// panic inside an adapter still records an outcome and releases waiters.
pub(crate) async fn supervise(record: Arc<JobRecord>, ctx: JobContext) {
    let task = tokio::spawn(drive(record.clone(), ctx));
    if let Err(e) = task.await {
        if record.outcome().is_some() {
            return;
        }
        error!(
            "Job {} ({}) task {}: {}",
            record.id,
            record.qualified_name,
            if e.is_panic() { "panicked" } else { "was aborted" },
            e
        );
        record.finish(Err(JobFailure::Monitoring {
            last_state: record.state().to_string(),
            detail: format!("job task failed: {}", e),
        }));
    }
}

async fn drive(record: Arc<JobRecord>, ctx: JobContext) {
    let outcome = run(&record, &ctx).await;
    match &outcome {
        Ok(result) => info!(
            "Job {} ({}) completed on '{}' as {}",
            record.id, record.qualified_name, record.target, result.backend_job_id
        ),
        Err(failure) => warn!(
            "Job {} ({}) on '{}' ended in {}: {:?}",
            record.id,
            record.qualified_name,
            record.target,
            record.state(),
            failure
        ),
    }
    record.finish(outcome);
}

async fn run(record: &JobRecord, ctx: &JobContext) -> Outcome {
    let started = Instant::now();
    let adapter = record.adapter.as_ref();

    if record.cancel.is_cancelled() {
        return cancel_before_submit(record);
    }

    if let Some(readiness) = &ctx.readiness {
        if let Err(e) = readiness.ensure().await {
            return submission_failed(record, 1, format!("target not ready: {:#}", e));
        }
    }

    let staged = match ctx
        .retry
        .run("stage", || adapter.stage(&ctx.artifact, &ctx.destination))
        .await
    {
        Ok(staged) => staged,
        Err(e) => return submission_failed(record, e.attempts, e.last.to_string()),
    };
    record.apply(|sm| sm.stage())?;
    debug!("Job {} staged at {}", record.id, staged.location);

    if record.cancel.is_cancelled() {
        return cancel_before_submit(record);
    }

    let remote = match ctx
        .retry
        .run("submit", || adapter.submit(&staged, &ctx.resources))
        .await
    {
        Ok(remote) => remote,
        Err(e) => return submission_failed(record, e.attempts, e.last.to_string()),
    };
    record.apply(|sm| {
        sm.submit(
            remote.backend_job_id.clone(),
            remote.output_location.clone(),
        )
    })?;
    *record.remote.lock() = Some(remote.clone());
    info!(
        "Job {} ({}) submitted to '{}' as {}",
        record.id, record.qualified_name, record.target, remote.backend_job_id
    );

    let mut polls: u32 = 0;
    let mut unknown: u32 = 0;
    loop {
        let elapsed = started.elapsed();
        if elapsed >= ctx.timeout {
            return timed_out(record, &remote, elapsed).await;
        }
        let wait = ctx.polling.interval(polls).min(ctx.timeout - elapsed);

        tokio::select! {
            biased;
            _ = record.cancel.cancelled() => return cancel_remote(record, &remote).await,
            _ = tokio::time::sleep(wait) => {}
        }

        let elapsed = started.elapsed();
        if elapsed >= ctx.timeout {
            return timed_out(record, &remote, elapsed).await;
        }

        polls = polls.saturating_add(1);
        let status = match ctx.retry.run("poll", || adapter.poll(&remote)).await {
            Ok(status) => status,
            Err(e) => {
                return Err(JobFailure::Monitoring {
                    last_state: record.state().to_string(),
                    detail: e.to_string(),
                })
            }
        };
        record.mark_polled();

        // An in-flight poll completes; the cancel takes effect right after it
        if record.cancel.is_cancelled() {
            return cancel_remote(record, &remote).await;
        }

        let phase = match status.phase {
            Some(phase) => {
                unknown = 0;
                phase
            }
            None => {
                unknown += 1;
                debug!(
                    "Job {}: unrecognised status '{}' ({}/{})",
                    record.id, status.raw, unknown, ctx.polling.unknown_budget
                );
                if unknown > ctx.polling.unknown_budget {
                    return Err(JobFailure::Monitoring {
                        last_state: record.state().to_string(),
                        detail: format!(
                            "{} consecutive unrecognised status tokens (last: '{}')",
                            unknown, status.raw
                        ),
                    });
                }
                continue;
            }
        };

        match phase {
            RemotePhase::Queued | RemotePhase::Running => {
                record.apply(|sm| sm.observe(phase).map(|_| ()))?;
            }
            RemotePhase::Completed => {
                record.apply(|sm| sm.observe(phase).map(|_| ()))?;
                return fetch(record, ctx, &remote).await;
            }
            RemotePhase::Failed => {
                // One diagnostic fetch; the work unit is not re-run
                let diagnostics = match adapter.fetch_result(&remote).await {
                    Ok(payload) => payload.diagnostics(),
                    Err(e) => format!("no diagnostics available: {}", e),
                };
                record.apply(|sm| sm.fail(FailureReason::RemoteExecution))?;
                return Err(JobFailure::RemoteExecution {
                    backend_job_id: remote.backend_job_id.clone(),
                    diagnostics,
                });
            }
            RemotePhase::Cancelled => {
                record.apply(|sm| sm.cancel())?;
                return Err(JobFailure::Cancelled);
            }
        }
    }
}

async fn fetch(record: &JobRecord, ctx: &JobContext, remote: &RemoteJob) -> Outcome {
    let adapter = record.adapter.as_ref();
    match ctx
        .retry
        .run("fetch", || adapter.fetch_result(remote))
        .await
    {
        Ok(payload) if payload.ok => Ok(JobResult {
            job_id: record.id,
            artifact_id: record.artifact_id.clone(),
            backend_job_id: remote.backend_job_id.clone(),
            value: payload.value,
        }),
        // Backend reported success but the bootstrap recorded an exception
        Ok(payload) => Err(JobFailure::RemoteExecution {
            backend_job_id: remote.backend_job_id.clone(),
            diagnostics: payload.diagnostics(),
        }),
        Err(e) => Err(JobFailure::ResultRetrieval {
            detail: e.to_string(),
        }),
    }
}

fn submission_failed(record: &JobRecord, attempts: u32, detail: String) -> Outcome {
    record.apply(|sm| sm.fail(FailureReason::Submission))?;
    Err(JobFailure::Submission {
        target: record.target.clone(),
        attempts,
        detail,
    })
}

fn cancel_before_submit(record: &JobRecord) -> Outcome {
    record.apply(|sm| sm.cancel())?;
    Err(JobFailure::Cancelled)
}

async fn cancel_remote(record: &JobRecord, remote: &RemoteJob) -> Outcome {
    if let Err(e) = record.adapter.cancel(remote).await {
        warn!(
            "Backend cancel for job {} ({}) failed: {}",
            record.id, remote.backend_job_id, e
        );
    }
    record.apply(|sm| sm.cancel())?;
    info!("Job {} cancelled", record.id);
    Err(JobFailure::Cancelled)
}

async fn timed_out(record: &JobRecord, remote: &RemoteJob, elapsed: Duration) -> Outcome {
    if let Err(e) = record.adapter.cancel(remote).await {
        warn!(
            "Cancel after timeout for job {} ({}) failed: {}",
            record.id, remote.backend_job_id, e
        );
    }
    record.apply(|sm| sm.fail(FailureReason::Timeout))?;
    Err(JobFailure::Timeout { elapsed })
}
