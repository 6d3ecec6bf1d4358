//! Scripted in-memory backend for driving the job state machine

#![allow(dead_code)]

use async_trait::async_trait;
use farcall_bundle::{Artifact, WorkUnit};
use farcall_fs::TransportError;
use farcall_orchestration::{
    AdapterError, BackendAdapter, BackendKind, JobOrchestrator, OrchestratorConfig, PollPolicy,
    RemoteJob, RemotePayload, RemotePhase, RemoteStatus, ResourceSpec, RetryPolicy,
    StageDestination, StagedRef,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// One scripted poll answer
#[derive(Debug, Clone)]
pub enum Poll {
    Phase(RemotePhase),
    Unknown(&'static str),
    Unreachable,
    /// The adapter panics mid-poll
    Panic,
}

/// One scripted fetch answer
#[derive(Debug, Clone)]
pub enum Fetch {
    Value(Value),
    RemoteError(&'static str),
    Unreachable,
}

/// One scripted submit answer
#[derive(Debug, Clone)]
pub enum Submit {
    Accept,
    Unreachable,
    Reject,
}

fn unreachable_error() -> AdapterError {
    AdapterError::Transport(TransportError::Unreachable {
        target: "sim".to_string(),
        status: 255,
        stderr: "Connection reset by peer".to_string(),
    })
}

pub struct ScriptedBackend {
    polls: Mutex<VecDeque<Poll>>,
    /// Answer once the poll script is used up
    idle: Poll,
    fetches: Mutex<VecDeque<Fetch>>,
    submits: Mutex<VecDeque<Submit>>,
    pub stage_calls: AtomicU32,
    pub submit_calls: AtomicU32,
    pub poll_calls: AtomicU32,
    pub cancel_calls: AtomicU32,
    pub fetch_calls: AtomicU32,
    pub cleanup_calls: AtomicU32,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self {
            polls: Mutex::new(VecDeque::new()),
            idle: Poll::Phase(RemotePhase::Running),
            fetches: Mutex::new(VecDeque::new()),
            submits: Mutex::new(VecDeque::new()),
            stage_calls: AtomicU32::new(0),
            submit_calls: AtomicU32::new(0),
            poll_calls: AtomicU32::new(0),
            cancel_calls: AtomicU32::new(0),
            fetch_calls: AtomicU32::new(0),
            cleanup_calls: AtomicU32::new(0),
        }
    }

    pub fn polls(self, script: impl IntoIterator<Item = Poll>) -> Self {
        self.polls.lock().extend(script);
        self
    }

    pub fn then(mut self, idle: Poll) -> Self {
        self.idle = idle;
        self
    }

    pub fn fetches(self, script: impl IntoIterator<Item = Fetch>) -> Self {
        self.fetches.lock().extend(script);
        self
    }

    pub fn submits(self, script: impl IntoIterator<Item = Submit>) -> Self {
        self.submits.lock().extend(script);
        self
    }

    pub fn count(counter: &AtomicU32) -> u32 {
        counter.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BackendAdapter for ScriptedBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    fn default_destination(&self) -> StageDestination {
        StageDestination::new("mem://staging")
    }

    async fn stage(
        &self,
        artifact: &Artifact,
        destination: &StageDestination,
    ) -> Result<StagedRef, AdapterError> {
        self.stage_calls.fetch_add(1, Ordering::SeqCst);
        Ok(StagedRef {
            artifact_id: artifact.id().to_string(),
            location: destination.join(artifact.id()),
        })
    }

    async fn submit(
        &self,
        staged: &StagedRef,
        _resources: &ResourceSpec,
    ) -> Result<RemoteJob, AdapterError> {
        let n = self.submit_calls.fetch_add(1, Ordering::SeqCst) + 1;
        let step = self.submits.lock().pop_front().unwrap_or(Submit::Accept);
        match step {
            Submit::Accept => Ok(RemoteJob {
                backend_job_id: format!("sim-{}", n),
                artifact_id: staged.artifact_id.clone(),
                staged_location: staged.location.clone(),
                output_location: format!("{}/runs/{}", staged.location, n),
            }),
            Submit::Unreachable => Err(unreachable_error()),
            Submit::Reject => Err(AdapterError::Command {
                operation: "submit",
                target: "sim".to_string(),
                status: 1,
                stderr: "invalid partition".to_string(),
            }),
        }
    }

    async fn poll(&self, _job: &RemoteJob) -> Result<RemoteStatus, AdapterError> {
        self.poll_calls.fetch_add(1, Ordering::SeqCst);
        let step = self
            .polls
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.idle.clone());
        match step {
            Poll::Phase(phase) => Ok(RemoteStatus::known(phase, format!("{:?}", phase))),
            Poll::Unknown(token) => Ok(RemoteStatus::unknown(token)),
            Poll::Unreachable => Err(unreachable_error()),
            Poll::Panic => panic!("scripted adapter bug"),
        }
    }

    async fn cancel(&self, _job: &RemoteJob) -> Result<(), AdapterError> {
        self.cancel_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn fetch_result(&self, _job: &RemoteJob) -> Result<RemotePayload, AdapterError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        let step = self
            .fetches
            .lock()
            .pop_front()
            .unwrap_or(Fetch::Value(json!(42)));
        match step {
            Fetch::Value(value) => Ok(RemotePayload {
                ok: true,
                value,
                error: None,
                traceback: None,
                log_tail: None,
            }),
            Fetch::RemoteError(error) => Ok(RemotePayload {
                ok: false,
                value: Value::Null,
                error: Some(error.to_string()),
                traceback: Some(format!("Traceback (most recent call last):\n{}\n", error)),
                log_tail: None,
            }),
            Fetch::Unreachable => Err(unreachable_error()),
        }
    }

    async fn cleanup(&self, _job: &RemoteJob) -> Result<(), AdapterError> {
        self.cleanup_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub fn test_config() -> OrchestratorConfig {
    OrchestratorConfig {
        retry: RetryPolicy::new(3, Duration::from_millis(100), Duration::from_millis(400)),
        polling: PollPolicy {
            initial_interval_ms: 1_000,
            max_interval_ms: 5_000,
            multiplier: 2.0,
            unknown_budget: 5,
        },
        timeout: Duration::from_secs(600),
        ..OrchestratorConfig::default()
    }
}

/// Orchestrator with `backend` registered as `sim`
pub fn orchestrator(backend: Arc<ScriptedBackend>) -> JobOrchestrator {
    let orchestrator = JobOrchestrator::new(test_config());
    orchestrator.register_backend("sim", backend);
    orchestrator
}

pub fn doubling(x: i64) -> WorkUnit {
    WorkUnit::new("jobs", "def f(x):\n    return x * 2\n", "f").arg(x)
}
