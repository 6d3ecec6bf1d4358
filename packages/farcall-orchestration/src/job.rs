use crate::adapters::{BackendKind, RemotePhase};
use crate::error::{OrchestratorError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Why a job ended in `Failed`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// Staging or submission never succeeded
    Submission,
    /// The work unit itself raised or exited non-zero
    RemoteExecution,
    /// The caller's timeout elapsed before a terminal state
    Timeout,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::Submission => "submission",
            FailureReason::RemoteExecution => "remote_execution",
            FailureReason::Timeout => "timeout",
        }
    }
}

/// Job lifecycle
///
/// `Created → Staged → Submitted → {Queued ⇄ Running} → {Completed | Failed | Cancelled}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobState {
    Created,
    Staged,
    Submitted,
    Queued,
    Running,
    Completed,
    Failed { reason: FailureReason },
    Cancelled,
}

impl JobState {
    pub fn state_name(&self) -> &'static str {
        match self {
            JobState::Created => "created",
            JobState::Staged => "staged",
            JobState::Submitted => "submitted",
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::Failed { .. } => "failed",
            JobState::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed { .. } | JobState::Cancelled
        )
    }

    /// Known to the backend and not finished
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            JobState::Submitted | JobState::Queued | JobState::Running
        )
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Failed { reason } => write!(f, "failed ({})", reason.as_str()),
            other => write!(f, "{}", other.state_name()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateTransition {
    pub state: JobState,
    pub at: DateTime<Utc>,
}

/// Caller-side reference to a submitted job
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobHandle {
    pub id: Uuid,
    /// Registered backend name
    pub target: String,
    pub artifact_id: String,
}

impl std::fmt::Display for JobHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.id, self.target)
    }
}

/// Value returned by a successfully completed job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub job_id: Uuid,
    pub artifact_id: String,
    pub backend_job_id: String,
    pub value: Value,
}

/// Job model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub artifact_id: String,
    /// Qualified name of the entry function
    pub qualified_name: String,
    pub target: String,
    pub backend: BackendKind,
    pub state: JobState,
    /// Identifier assigned by the backend on submission
    pub backend_job_id: Option<String>,
    /// Where the backend leaves `result.json`
    pub result_location: Option<String>,
    pub created_at: DateTime<Utc>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub last_polled_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    /// Every state entered, in order, starting with `Created`
    pub history: Vec<StateTransition>,
}

impl Job {
    pub fn new(
        artifact_id: impl Into<String>,
        qualified_name: impl Into<String>,
        target: impl Into<String>,
        backend: BackendKind,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            artifact_id: artifact_id.into(),
            qualified_name: qualified_name.into(),
            target: target.into(),
            backend,
            state: JobState::Created,
            backend_job_id: None,
            result_location: None,
            created_at: now,
            submitted_at: None,
            last_polled_at: None,
            updated_at: now,
            history: vec![StateTransition {
                state: JobState::Created,
                at: now,
            }],
        }
    }

    pub fn handle(&self) -> JobHandle {
        JobHandle {
            id: self.id,
            target: self.target.clone(),
            artifact_id: self.artifact_id.clone(),
        }
    }

    /// States entered so far, without timestamps
    pub fn observed_states(&self) -> Vec<JobState> {
        self.history.iter().map(|t| t.state).collect()
    }
}

/// Job state machine for transitions
pub struct JobStateMachine {
    job: Job,
}

impl JobStateMachine {
    pub fn new(job: Job) -> Self {
        Self { job }
    }

    pub fn job(&self) -> &Job {
        &self.job
    }

    pub fn into_job(self) -> Job {
        self.job
    }

    pub fn state(&self) -> JobState {
        self.job.state
    }

    fn enter(&mut self, state: JobState) {
        let now = Utc::now();
        self.job.state = state;
        self.job.updated_at = now;
        self.job.history.push(StateTransition { state, at: now });
    }

    fn invalid(&self, to: &str) -> OrchestratorError {
        OrchestratorError::InvalidStateTransition {
            from: self.job.state.state_name().to_string(),
            to: to.to_string(),
        }
    }

    /// Transition: CREATED → STAGED
    pub fn stage(&mut self) -> Result<()> {
        match self.job.state {
            JobState::Created => {
                self.enter(JobState::Staged);
                Ok(())
            }
            _ => Err(self.invalid("staged")),
        }
    }

    /// Transition: STAGED → SUBMITTED
    pub fn submit(&mut self, backend_job_id: String, result_location: String) -> Result<()> {
        match self.job.state {
            JobState::Staged => {
                self.job.backend_job_id = Some(backend_job_id);
                self.job.result_location = Some(result_location);
                self.job.submitted_at = Some(Utc::now());
                self.enter(JobState::Submitted);
                Ok(())
            }
            _ => Err(self.invalid("submitted")),
        }
    }

    pub fn mark_polled(&mut self) {
        self.job.last_polled_at = Some(Utc::now());
    }

    /// A job that finished between two polls still ran: `Submitted` goes
    /// through `Running` before a completed or failed outcome
    fn enter_running_if_submitted(&mut self) {
        if self.job.state == JobState::Submitted {
            self.enter(JobState::Running);
        }
    }

    /// Apply a phase reported by the backend. Returns `false` when the job
    /// is already in that phase (repeated `Running` polls are not transitions).
    pub fn observe(&mut self, phase: RemotePhase) -> Result<bool> {
        let next = match phase {
            RemotePhase::Queued => JobState::Queued,
            RemotePhase::Running => JobState::Running,
            RemotePhase::Completed => JobState::Completed,
            RemotePhase::Failed => JobState::Failed {
                reason: FailureReason::RemoteExecution,
            },
            RemotePhase::Cancelled => JobState::Cancelled,
        };
        if next == self.job.state {
            return Ok(false);
        }
        if !self.job.state.is_active() {
            return Err(self.invalid(next.state_name()));
        }
        if matches!(phase, RemotePhase::Completed | RemotePhase::Failed) {
            self.enter_running_if_submitted();
        }
        self.enter(next);
        Ok(true)
    }

    /// Transition: * → FAILED (non-terminal states only)
    pub fn fail(&mut self, reason: FailureReason) -> Result<()> {
        let allowed = match reason {
            FailureReason::Submission => {
                matches!(self.job.state, JobState::Created | JobState::Staged)
            }
            FailureReason::RemoteExecution | FailureReason::Timeout => self.job.state.is_active(),
        };
        if !allowed {
            return Err(self.invalid("failed"));
        }
        if reason == FailureReason::RemoteExecution {
            self.enter_running_if_submitted();
        }
        self.enter(JobState::Failed { reason });
        Ok(())
    }

    /// Transition: * → CANCELLED
    pub fn cancel(&mut self) -> Result<()> {
        if self.job.state.is_terminal() {
            return Err(self.invalid("cancelled"));
        }
        self.enter(JobState::Cancelled);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine() -> JobStateMachine {
        JobStateMachine::new(Job::new("abc123", "main.f", "local", BackendKind::Local))
    }

    fn submitted() -> JobStateMachine {
        let mut sm = machine();
        sm.stage().unwrap();
        sm.submit("4711".to_string(), "/tmp/out".to_string()).unwrap();
        sm
    }

    #[test]
    fn test_happy_path_history() {
        let mut sm = submitted();
        assert!(sm.observe(RemotePhase::Queued).unwrap());
        assert!(sm.observe(RemotePhase::Running).unwrap());
        assert!(!sm.observe(RemotePhase::Running).unwrap());
        assert!(sm.observe(RemotePhase::Completed).unwrap());

        assert_eq!(
            sm.job().observed_states(),
            vec![
                JobState::Created,
                JobState::Staged,
                JobState::Submitted,
                JobState::Queued,
                JobState::Running,
                JobState::Completed,
            ]
        );
        assert_eq!(sm.job().backend_job_id.as_deref(), Some("4711"));
    }

    #[test]
    fn test_requeue_alternates() {
        let mut sm = submitted();
        sm.observe(RemotePhase::Running).unwrap();
        sm.observe(RemotePhase::Queued).unwrap();
        sm.observe(RemotePhase::Running).unwrap();
        assert_eq!(sm.state(), JobState::Running);
    }

    #[test]
    fn test_terminal_states_are_final() {
        let mut sm = submitted();
        sm.observe(RemotePhase::Completed).unwrap();

        assert!(sm.observe(RemotePhase::Running).is_err());
        assert!(sm.cancel().is_err());
        assert!(sm.fail(FailureReason::Timeout).is_err());
        assert_eq!(sm.job().history.len(), 4);
    }

    #[test]
    fn test_cannot_skip_submission() {
        let mut sm = machine();
        assert!(matches!(
            sm.submit("1".to_string(), String::new()),
            Err(OrchestratorError::InvalidStateTransition { .. })
        ));
        assert!(sm.observe(RemotePhase::Running).is_err());
    }

    #[test]
    fn test_submission_failure_only_before_submit() {
        let mut sm = machine();
        sm.stage().unwrap();
        sm.fail(FailureReason::Submission).unwrap();
        assert_eq!(
            sm.state(),
            JobState::Failed {
                reason: FailureReason::Submission
            }
        );

        let mut sm = submitted();
        assert!(sm.fail(FailureReason::Submission).is_err());
        sm.fail(FailureReason::Timeout).unwrap();
        assert_eq!(sm.state().to_string(), "failed (timeout)");
    }

    #[test]
    fn test_first_poll_terminal_passes_through_running() {
        let mut sm = submitted();
        assert!(sm.observe(RemotePhase::Completed).unwrap());
        assert_eq!(
            sm.job().observed_states(),
            vec![
                JobState::Created,
                JobState::Staged,
                JobState::Submitted,
                JobState::Running,
                JobState::Completed,
            ]
        );

        let mut sm = submitted();
        sm.fail(FailureReason::RemoteExecution).unwrap();
        assert_eq!(
            &sm.job().observed_states()[2..],
            &[
                JobState::Submitted,
                JobState::Running,
                JobState::Failed {
                    reason: FailureReason::RemoteExecution
                },
            ]
        );

        // Not observed remotely: no synthetic Running
        let mut sm = submitted();
        sm.fail(FailureReason::Timeout).unwrap();
        assert_eq!(sm.job().history.len(), 4);
        let mut sm = submitted();
        sm.observe(RemotePhase::Cancelled).unwrap();
        assert_eq!(sm.job().history.len(), 4);
    }

    #[test]
    fn test_cancel_from_created() {
        let mut sm = machine();
        sm.cancel().unwrap();
        assert_eq!(sm.state(), JobState::Cancelled);
    }
}
