//! Job lifecycle against a scripted backend, on a paused clock

mod common;

use async_trait::async_trait;
use common::{doubling, orchestrator, test_config, Fetch, Poll, ScriptedBackend, Submit};
use farcall_orchestration::{
    ConnectionInfo, FailureReason, JobOrchestrator, JobState, OrchestratorError,
    RemotePhase, ResourceProvisioner, SubmitOptions, TargetSpec,
};
use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn count(counter: &AtomicU32) -> u32 {
    ScriptedBackend::count(counter)
}

// ============================================================================
// State sequence
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_queued_running_completed_sequence() {
    let backend = Arc::new(ScriptedBackend::new().polls([
        Poll::Phase(RemotePhase::Queued),
        Poll::Phase(RemotePhase::Running),
        Poll::Phase(RemotePhase::Completed),
    ]));
    let orch = orchestrator(backend.clone());

    let handle = orch.submit(&doubling(21), "sim").await.unwrap();
    let result = orch.wait(&handle).await.unwrap();
    assert_eq!(result.value, json!(42));
    assert_eq!(result.backend_job_id, "sim-1");
    assert_eq!(result.artifact_id, handle.artifact_id);

    let job = orch.job(&handle).unwrap();
    assert_eq!(
        job.observed_states(),
        vec![
            JobState::Created,
            JobState::Staged,
            JobState::Submitted,
            JobState::Queued,
            JobState::Running,
            JobState::Completed,
        ]
    );
    assert_eq!(job.qualified_name, "jobs.f");
    assert!(job.last_polled_at.is_some());

    // Terminal: nothing polls any more
    tokio::time::sleep(Duration::from_secs(300)).await;
    assert_eq!(count(&backend.poll_calls), 3);
    assert_eq!(count(&backend.fetch_calls), 1);
}

#[tokio::test(start_paused = true)]
async fn test_completed_on_first_poll_records_running() {
    let backend = Arc::new(ScriptedBackend::new().polls([Poll::Phase(RemotePhase::Completed)]));
    let orch = orchestrator(backend);

    let handle = orch.submit(&doubling(4), "sim").await.unwrap();
    orch.wait(&handle).await.unwrap();
    assert_eq!(
        orch.job(&handle).unwrap().observed_states(),
        vec![
            JobState::Created,
            JobState::Staged,
            JobState::Submitted,
            JobState::Running,
            JobState::Completed,
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_repeated_running_is_not_a_transition() {
    let backend = Arc::new(ScriptedBackend::new().polls([
        Poll::Phase(RemotePhase::Running),
        Poll::Phase(RemotePhase::Running),
        Poll::Phase(RemotePhase::Queued),
        Poll::Phase(RemotePhase::Running),
        Poll::Phase(RemotePhase::Completed),
    ]));
    let orch = orchestrator(backend);

    let handle = orch.submit(&doubling(1), "sim").await.unwrap();
    orch.wait(&handle).await.unwrap();

    assert_eq!(
        orch.job(&handle).unwrap().observed_states(),
        vec![
            JobState::Created,
            JobState::Staged,
            JobState::Submitted,
            JobState::Running,
            JobState::Queued,
            JobState::Running,
            JobState::Completed,
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_unknown_tokens_are_tolerated() {
    let backend = Arc::new(ScriptedBackend::new().polls([
        Poll::Unknown("SPECIAL_EXIT"),
        Poll::Unknown("SPECIAL_EXIT"),
        Poll::Unknown(""),
        Poll::Phase(RemotePhase::Completed),
    ]));
    let orch = orchestrator(backend.clone());

    let handle = orch.submit(&doubling(3), "sim").await.unwrap();
    let result = orch.wait(&handle).await.unwrap();
    assert_eq!(result.value, json!(42));
    assert_eq!(orch.get_job_status(&handle).unwrap(), JobState::Completed);
    assert_eq!(count(&backend.poll_calls), 4);
}

#[tokio::test(start_paused = true)]
async fn test_unknown_budget_exhausted_reports_unknown_outcome() {
    let backend = Arc::new(
        ScriptedBackend::new()
            .polls([Poll::Phase(RemotePhase::Running)])
            .then(Poll::Unknown("???")),
    );
    let orch = orchestrator(backend.clone());

    let handle = orch.submit(&doubling(3), "sim").await.unwrap();
    let err = orch.wait(&handle).await.unwrap_err();
    match &err {
        OrchestratorError::Monitoring { last_state, .. } => assert_eq!(last_state, "running"),
        other => panic!("expected monitoring error, got {:?}", other),
    }
    assert!(err.to_string().contains("outcome unknown"));
    // Not asserted failed: the state stays at the last observation
    assert_eq!(orch.get_job_status(&handle).unwrap(), JobState::Running);
    // 1 Running + budget of 5 tolerated + the one that exceeded it
    assert_eq!(count(&backend.poll_calls), 7);
}

#[tokio::test(start_paused = true)]
async fn test_persistent_poll_failure_is_monitoring_error() {
    let backend = Arc::new(ScriptedBackend::new().then(Poll::Unreachable));
    let orch = orchestrator(backend.clone());

    let handle = orch.submit(&doubling(3), "sim").await.unwrap();
    let err = orch.wait(&handle).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::Monitoring { .. }));
    assert_eq!(orch.get_job_status(&handle).unwrap(), JobState::Submitted);
    assert_eq!(count(&backend.poll_calls), 3);
}

// ============================================================================
// Result retrieval
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_fetch_retried_after_transport_error() {
    let backend = Arc::new(
        ScriptedBackend::new()
            .polls([Poll::Phase(RemotePhase::Completed)])
            .fetches([Fetch::Unreachable, Fetch::Value(json!({"answer": 16}))]),
    );
    let orch = orchestrator(backend.clone());

    let result = orch.submit_work_unit(&doubling(8), "sim").await.unwrap();
    assert_eq!(result.value, json!({"answer": 16}));
    assert_eq!(count(&backend.fetch_calls), 2);
}

#[tokio::test(start_paused = true)]
async fn test_fetch_failure_keeps_completed_state() {
    let backend = Arc::new(
        ScriptedBackend::new()
            .polls([Poll::Phase(RemotePhase::Completed)])
            .fetches([Fetch::Unreachable, Fetch::Unreachable, Fetch::Unreachable]),
    );
    let orch = orchestrator(backend.clone());

    let handle = orch.submit(&doubling(8), "sim").await.unwrap();
    let err = orch.wait(&handle).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::ResultRetrieval { .. }));
    assert!(err.category().is_retryable());
    assert_eq!(orch.get_job_status(&handle).unwrap(), JobState::Completed);
}

#[tokio::test(start_paused = true)]
async fn test_remote_failure_carries_diagnostics() {
    let backend = Arc::new(
        ScriptedBackend::new()
            .polls([
                Poll::Phase(RemotePhase::Running),
                Poll::Phase(RemotePhase::Failed),
            ])
            .fetches([Fetch::RemoteError("ValueError: bad input 3")]),
    );
    let orch = orchestrator(backend.clone());

    let handle = orch.submit(&doubling(3), "sim").await.unwrap();
    let err = orch.wait(&handle).await.unwrap_err();
    match &err {
        OrchestratorError::RemoteExecution {
            job_id,
            backend_job_id,
            qualified_name,
            diagnostics,
        } => {
            assert_eq!(*job_id, handle.id);
            assert_eq!(backend_job_id, "sim-1");
            assert_eq!(qualified_name, "jobs.f");
            assert!(diagnostics.starts_with("ValueError: bad input 3"));
        }
        other => panic!("expected remote execution error, got {:?}", other),
    }
    assert!(!err.category().is_retryable());
    assert_eq!(
        orch.get_job_status(&handle).unwrap(),
        JobState::Failed {
            reason: FailureReason::RemoteExecution
        }
    );
    // One diagnostic fetch, no retries
    assert_eq!(count(&backend.fetch_calls), 1);
}

// ============================================================================
// Cancellation and timeout
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_cancel_while_running_stops_polling() {
    let backend = Arc::new(ScriptedBackend::new().then(Poll::Phase(RemotePhase::Running)));
    let orch = orchestrator(backend.clone());

    let handle = orch.submit(&doubling(2), "sim").await.unwrap();
    let mut states = orch.watch(&handle).unwrap();
    states
        .wait_for(|s| *s == JobState::Running)
        .await
        .unwrap();

    orch.cancel_job(&handle).unwrap();
    let err = orch.wait(&handle).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::Cancelled(id) if id == handle.id));
    assert_eq!(orch.get_job_status(&handle).unwrap(), JobState::Cancelled);
    assert_eq!(count(&backend.cancel_calls), 1);

    let polls = count(&backend.poll_calls);
    tokio::time::sleep(Duration::from_secs(600)).await;
    assert_eq!(count(&backend.poll_calls), polls);

    let history = orch.job(&handle).unwrap().observed_states();
    assert_eq!(history.last(), Some(&JobState::Cancelled));
    assert_eq!(history.iter().filter(|s| s.is_terminal()).count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_before_submission_skips_backend() {
    let backend = Arc::new(ScriptedBackend::new());
    let orch = orchestrator(backend.clone());

    // The job task has not run yet on this single-threaded runtime
    let handle = orch.submit(&doubling(2), "sim").await.unwrap();
    assert_eq!(orch.get_job_status(&handle).unwrap(), JobState::Created);
    orch.cancel_job(&handle).unwrap();

    assert!(matches!(
        orch.wait(&handle).await,
        Err(OrchestratorError::Cancelled(_))
    ));
    assert_eq!(
        orch.job(&handle).unwrap().observed_states(),
        vec![JobState::Created, JobState::Cancelled]
    );
    assert_eq!(count(&backend.submit_calls), 0);
    assert_eq!(count(&backend.cancel_calls), 0);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_terminal_job_is_rejected() {
    let backend = Arc::new(ScriptedBackend::new().polls([Poll::Phase(RemotePhase::Completed)]));
    let orch = orchestrator(backend);

    let handle = orch.submit(&doubling(2), "sim").await.unwrap();
    orch.wait(&handle).await.unwrap();
    assert!(matches!(
        orch.cancel_job(&handle),
        Err(OrchestratorError::InvalidStateTransition { .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn test_timeout_cancels_and_fails() {
    let backend = Arc::new(ScriptedBackend::new().then(Poll::Phase(RemotePhase::Running)));
    let orch = orchestrator(backend.clone());

    let handle = orch
        .submit_with(
            &doubling(2),
            "sim",
            SubmitOptions::default().timeout(Duration::from_secs(10)),
        )
        .await
        .unwrap();
    let err = orch.wait(&handle).await.unwrap_err();
    match err {
        OrchestratorError::Timeout { job_id, elapsed } => {
            assert_eq!(job_id, handle.id);
            assert!(elapsed >= Duration::from_secs(10));
        }
        other => panic!("expected timeout, got {:?}", other),
    }
    assert_eq!(
        orch.get_job_status(&handle).unwrap(),
        JobState::Failed {
            reason: FailureReason::Timeout
        }
    );
    assert_eq!(count(&backend.cancel_calls), 1);
}

// ============================================================================
// Submission
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_transient_submit_errors_are_retried() {
    let backend = Arc::new(
        ScriptedBackend::new()
            .submits([Submit::Unreachable, Submit::Unreachable])
            .polls([Poll::Phase(RemotePhase::Completed)]),
    );
    let orch = orchestrator(backend.clone());

    let result = orch.submit_work_unit(&doubling(2), "sim").await.unwrap();
    assert_eq!(result.backend_job_id, "sim-3");
    assert_eq!(count(&backend.submit_calls), 3);
}

#[tokio::test(start_paused = true)]
async fn test_rejected_submission_fails_without_retry() {
    let backend = Arc::new(ScriptedBackend::new().submits([Submit::Reject]));
    let orch = orchestrator(backend.clone());

    let handle = orch.submit(&doubling(2), "sim").await.unwrap();
    match orch.wait(&handle).await.unwrap_err() {
        OrchestratorError::Submission {
            target, attempts, ..
        } => {
            assert_eq!(target, "sim");
            assert_eq!(attempts, 1);
        }
        other => panic!("expected submission error, got {:?}", other),
    }
    assert_eq!(
        orch.get_job_status(&handle).unwrap(),
        JobState::Failed {
            reason: FailureReason::Submission
        }
    );
    assert_eq!(count(&backend.poll_calls), 0);
}

#[tokio::test(start_paused = true)]
async fn test_unknown_backend() {
    let orch = orchestrator(Arc::new(ScriptedBackend::new()));
    assert!(matches!(
        orch.submit(&doubling(2), "nowhere").await,
        Err(OrchestratorError::UnknownBackend(name)) if name == "nowhere"
    ));
}

#[tokio::test(start_paused = true)]
async fn test_analysis_error_surfaces_before_registration() {
    let orch = orchestrator(Arc::new(ScriptedBackend::new()));
    let unit = farcall_bundle::WorkUnit::new("jobs", "def f(x):\n    return x +\n", "f");
    assert!(matches!(
        orch.submit(&unit, "sim").await,
        Err(OrchestratorError::Analysis(_))
    ));
    assert!(orch.jobs().is_empty());
}

// ============================================================================
// Dedup, cleanup, concurrency
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_identical_submission_returns_existing_handle() {
    let backend = Arc::new(ScriptedBackend::new().then(Poll::Phase(RemotePhase::Running)));
    let orch = orchestrator(backend.clone());

    let first = orch.submit(&doubling(5), "sim").await.unwrap();
    let second = orch.submit(&doubling(5), "sim").await.unwrap();
    let other = orch.submit(&doubling(6), "sim").await.unwrap();

    assert_eq!(first, second);
    assert_ne!(first.id, other.id);
    assert_ne!(first.artifact_id, other.artifact_id);
    assert_eq!(orch.cache().len(), 2);

    // A cancelled job is not reused
    orch.cancel_job(&first).unwrap();
    let _ = orch.wait(&first).await;
    let third = orch.submit(&doubling(5), "sim").await.unwrap();
    assert_ne!(third.id, first.id);

    orch.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_dedup_can_be_disabled() {
    let backend = Arc::new(ScriptedBackend::new().then(Poll::Phase(RemotePhase::Running)));
    let mut config = test_config();
    config.dedup = false;
    let orch = JobOrchestrator::new(config);
    orch.register_backend("sim", backend);

    let first = orch.submit(&doubling(5), "sim").await.unwrap();
    let second = orch.submit(&doubling(5), "sim").await.unwrap();
    assert_ne!(first.id, second.id);
    assert_eq!(first.artifact_id, second.artifact_id);

    orch.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_cleanup_forgets_the_job() {
    let backend = Arc::new(ScriptedBackend::new().polls([Poll::Phase(RemotePhase::Completed)]));
    let orch = orchestrator(backend.clone());

    let handle = orch.submit(&doubling(2), "sim").await.unwrap();
    orch.wait(&handle).await.unwrap();
    orch.cleanup(&handle).await.unwrap();

    assert_eq!(count(&backend.cleanup_calls), 1);
    assert!(matches!(
        orch.get_job_status(&handle),
        Err(OrchestratorError::JobNotFound(_))
    ));

    // Forgotten, so the same artifact is submitted again
    let again = orch.submit(&doubling(2), "sim").await.unwrap();
    assert_ne!(again.id, handle.id);
}

#[tokio::test(start_paused = true)]
async fn test_cleanup_evicts_unreferenced_artifacts() {
    let backend = Arc::new(ScriptedBackend::new().then(Poll::Phase(RemotePhase::Completed)));
    let orch = orchestrator(backend.clone());
    orch.register_backend("other", backend);

    let first = orch.submit(&doubling(7), "sim").await.unwrap();
    let second = orch.submit(&doubling(7), "other").await.unwrap();
    assert_eq!(first.artifact_id, second.artifact_id);
    orch.wait(&first).await.unwrap();
    orch.wait(&second).await.unwrap();
    assert_eq!(orch.cache().len(), 1);

    // Still referenced by the job on "other"
    orch.cleanup(&first).await.unwrap();
    assert!(orch.cache().get(&first.artifact_id).is_some());

    orch.cleanup(&second).await.unwrap();
    assert!(orch.cache().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_cleanup_of_unfinished_job_is_rejected() {
    let backend = Arc::new(ScriptedBackend::new().then(Poll::Phase(RemotePhase::Running)));
    let orch = orchestrator(backend.clone());

    let handle = orch.submit(&doubling(2), "sim").await.unwrap();
    assert!(matches!(
        orch.cleanup(&handle).await,
        Err(OrchestratorError::InvalidStateTransition { .. })
    ));
    orch.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_jobs_progress_independently() {
    let slow = Arc::new(ScriptedBackend::new().then(Poll::Phase(RemotePhase::Queued)));
    let fast = Arc::new(ScriptedBackend::new().polls([Poll::Phase(RemotePhase::Completed)]));
    let orch = orchestrator(slow.clone());
    orch.register_backend("fast", fast.clone());

    let stuck = orch.submit(&doubling(1), "sim").await.unwrap();
    let done = orch.submit(&doubling(1), "fast").await.unwrap();

    orch.wait(&done).await.unwrap();
    orch.watch(&stuck)
        .unwrap()
        .wait_for(|s| *s == JobState::Queued)
        .await
        .unwrap();
    assert!(count(&slow.poll_calls) >= 1);
    assert_eq!(count(&fast.fetch_calls), 1);

    orch.shutdown().await;
    assert_eq!(orch.get_job_status(&stuck).unwrap(), JobState::Cancelled);
}

#[tokio::test(start_paused = true)]
async fn test_adapter_panic_releases_waiters() {
    let backend = Arc::new(ScriptedBackend::new().polls([
        Poll::Phase(RemotePhase::Running),
        Poll::Panic,
    ]));
    let orch = orchestrator(backend);

    let handle = orch.submit(&doubling(2), "sim").await.unwrap();
    match orch.wait(&handle).await.unwrap_err() {
        OrchestratorError::Monitoring {
            last_state, detail, ..
        } => {
            assert_eq!(last_state, "running");
            assert!(detail.contains("job task failed"));
        }
        other => panic!("expected monitoring error, got {:?}", other),
    }

    // An outcome is recorded, so cleanup and shutdown do not hang
    orch.shutdown().await;
    orch.cleanup(&handle).await.unwrap();
}

// ============================================================================
// Provisioning
// ============================================================================

struct CountingProvisioner {
    calls: AtomicU32,
    fail: bool,
}

#[async_trait]
impl ResourceProvisioner for CountingProvisioner {
    async fn ensure_target_ready(&self, spec: &TargetSpec) -> anyhow::Result<ConnectionInfo> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            anyhow::bail!("quota exceeded for {}", spec.name);
        }
        Ok(ConnectionInfo {
            host: Some("node-1".to_string()),
            ..ConnectionInfo::default()
        })
    }
}

#[tokio::test(start_paused = true)]
async fn test_provisioner_runs_once_per_target() {
    let provisioner = Arc::new(CountingProvisioner {
        calls: AtomicU32::new(0),
        fail: false,
    });
    let backend = Arc::new(ScriptedBackend::new().then(Poll::Phase(RemotePhase::Completed)));
    let orch = JobOrchestrator::new(test_config()).with_provisioner(provisioner.clone());
    orch.register_backend("sim", backend);

    orch.submit_work_unit(&doubling(1), "sim").await.unwrap();
    orch.submit_work_unit(&doubling(2), "sim").await.unwrap();
    assert_eq!(provisioner.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_provisioning_failure_is_submission_error() {
    let provisioner = Arc::new(CountingProvisioner {
        calls: AtomicU32::new(0),
        fail: true,
    });
    let backend = Arc::new(ScriptedBackend::new());
    let orch = JobOrchestrator::new(test_config()).with_provisioner(provisioner);
    orch.register_backend("sim", backend.clone());

    let err = orch.submit_work_unit(&doubling(1), "sim").await.unwrap_err();
    assert!(matches!(err, OrchestratorError::Submission { .. }));
    assert!(err.to_string().contains("quota exceeded for sim"));
    assert_eq!(count(&backend.stage_calls), 0);
}
