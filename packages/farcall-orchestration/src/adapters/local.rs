//! Local subprocess adapter
//!
//! Zero-network fallback: artifacts are materialised under a work directory
//! and run with the local interpreter. Used by the integration tests.

use async_trait::async_trait;
use dashmap::DashMap;
use farcall_bundle::features::bundling::artifact::{ARCHIVE_FILE, BUNDLE_FILE};
use farcall_bundle::Artifact;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use super::{
    run_id, tail_lines, AdapterError, BackendAdapter, BackendKind, RemoteJob, RemotePayload,
    RemotePhase, RemoteStatus, ResourceSpec, StageDestination, StagedRef,
};

/// Sentinel files written by the bootstrap (and by `cancel`)
fn sentinel_phase(out_dir: &Path) -> Option<RemotePhase> {
    if out_dir.join("_SUCCESS").exists() {
        Some(RemotePhase::Completed)
    } else if out_dir.join("_FAILED").exists() {
        Some(RemotePhase::Failed)
    } else if out_dir.join("_CANCELLED").exists() {
        Some(RemotePhase::Cancelled)
    } else {
        None
    }
}

fn io_error(e: impl std::fmt::Display) -> AdapterError {
    AdapterError::Io(std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))
}

/// Materialise next to `dir` and rename into place; `dir` either holds the
/// complete artifact or does not exist
fn materialize_atomically(artifact: &Artifact, dir: &Path) -> Result<(), AdapterError> {
    let parent = dir.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent)?;
    let scratch = tempfile::Builder::new()
        .prefix(".farcall-stage-")
        .tempdir_in(parent)?;
    let staging = scratch.path().join(artifact.id());
    artifact.materialize(&staging)?;

    if dir.exists() && !dir.join(ARCHIVE_FILE).exists() {
        warn!("Replacing incomplete staging directory {}", dir.display());
        std::fs::remove_dir_all(dir)?;
    }
    match std::fs::rename(&staging, dir) {
        Ok(()) => Ok(()),
        // A concurrent stage of the same artifact got there first
        Err(_) if dir.join(ARCHIVE_FILE).exists() => Ok(()),
        Err(e) => Err(e.into()),
    }
}

pub struct LocalAdapter {
    workdir: PathBuf,
    python: String,
    /// Run id → child process; kept after exit so the status stays readable
    children: DashMap<String, Child>,
}

impl Default for LocalAdapter {
    fn default() -> Self {
        Self::new(std::env::temp_dir().join("farcall"), "python3")
    }
}

impl LocalAdapter {
    pub fn new(workdir: impl Into<PathBuf>, python: impl Into<String>) -> Self {
        Self {
            workdir: workdir.into(),
            python: python.into(),
            children: DashMap::new(),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Exit code of a finished child, `None` while running or unknown
    fn exit_status(&self, run: &str) -> Result<Option<std::process::ExitStatus>, AdapterError> {
        match self.children.get_mut(run) {
            Some(mut child) => Ok(child.try_wait()?),
            None => Ok(None),
        }
    }

    async fn stderr_tail(out_dir: &Path) -> Option<String> {
        tokio::fs::read_to_string(out_dir.join("stderr.log"))
            .await
            .ok()
            .map(|s| tail_lines(&s, 40))
    }
}

#[async_trait]
impl BackendAdapter for LocalAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    fn default_destination(&self) -> StageDestination {
        StageDestination::new(self.workdir.to_string_lossy().into_owned())
    }

    async fn stage(
        &self,
        artifact: &Artifact,
        destination: &StageDestination,
    ) -> Result<StagedRef, AdapterError> {
        let location = destination.join(artifact.id());
        let dir = PathBuf::from(&location);

        // The archive is written last, and the directory only appears by rename
        if tokio::fs::try_exists(dir.join(ARCHIVE_FILE)).await? {
            debug!("Artifact {} already staged at {}", artifact.id(), location);
        } else {
            let owned = artifact.clone();
            tokio::task::spawn_blocking(move || materialize_atomically(&owned, &dir))
                .await
                .map_err(io_error)??;
            info!("Staged artifact {} to {}", artifact.id(), location);
        }

        Ok(StagedRef {
            artifact_id: artifact.id().to_string(),
            location,
        })
    }

    async fn submit(
        &self,
        staged: &StagedRef,
        _resources: &ResourceSpec,
    ) -> Result<RemoteJob, AdapterError> {
        let run = run_id();
        let staged_dir = PathBuf::from(&staged.location);
        let out_dir = staged_dir.join("runs").join(&run);
        tokio::fs::create_dir_all(&out_dir).await?;

        let stdout = std::fs::File::create(out_dir.join("stdout.log"))?;
        let stderr = std::fs::File::create(out_dir.join("stderr.log"))?;

        let child = Command::new(&self.python)
            .arg(staged_dir.join(BUNDLE_FILE))
            .current_dir(&staged_dir)
            .env("FARCALL_OUTPUT_DIR", &out_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| {
                AdapterError::Transport(farcall_fs::TransportError::Spawn {
                    program: self.python.clone(),
                    source,
                })
            })?;

        info!(
            "Started artifact {} locally as run {} (pid {:?})",
            staged.artifact_id,
            run,
            child.id()
        );
        self.children.insert(run.clone(), child);

        Ok(RemoteJob {
            backend_job_id: run,
            artifact_id: staged.artifact_id.clone(),
            staged_location: staged.location.clone(),
            output_location: out_dir.to_string_lossy().into_owned(),
        })
    }

    async fn poll(&self, job: &RemoteJob) -> Result<RemoteStatus, AdapterError> {
        let out_dir = Path::new(&job.output_location);
        let known = self.children.contains_key(&job.backend_job_id);
        // Exit status first: a finished bootstrap has already written its sentinel
        let exited = self.exit_status(&job.backend_job_id)?;

        if let Some(phase) = sentinel_phase(out_dir) {
            return Ok(RemoteStatus::known(phase, format!("{:?}", phase)));
        }
        match exited {
            Some(status) => Ok(RemoteStatus::known(
                RemotePhase::Failed,
                format!("exited without result ({})", status),
            )),
            None if known => Ok(RemoteStatus::known(RemotePhase::Running, "running")),
            None => Err(AdapterError::UnknownJob(job.backend_job_id.clone())),
        }
    }

    async fn cancel(&self, job: &RemoteJob) -> Result<(), AdapterError> {
        if let Some((_, mut child)) = self.children.remove(&job.backend_job_id) {
            if let Err(e) = child.kill().await {
                warn!("Killing local run {} failed: {}", job.backend_job_id, e);
            }
        }
        tokio::fs::write(Path::new(&job.output_location).join("_CANCELLED"), b"").await?;
        Ok(())
    }

    async fn fetch_result(&self, job: &RemoteJob) -> Result<RemotePayload, AdapterError> {
        let out_dir = Path::new(&job.output_location);
        match tokio::fs::read_to_string(out_dir.join("result.json")).await {
            Ok(text) => {
                let payload = RemotePayload::parse(&text)?;
                if payload.ok {
                    Ok(payload)
                } else {
                    Ok(payload.with_log_tail(Self::stderr_tail(out_dir).await))
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // Crashed before the bootstrap could report (e.g. import error)
                if let Some(status) = self.exit_status(&job.backend_job_id)? {
                    return Ok(RemotePayload {
                        ok: false,
                        value: serde_json::Value::Null,
                        error: Some(format!("bundle exited without a result ({})", status)),
                        traceback: None,
                        log_tail: None,
                    }
                    .with_log_tail(Self::stderr_tail(out_dir).await));
                }
                Err(AdapterError::ResultMissing(format!(
                    "{}",
                    out_dir.join("result.json").display()
                )))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn cleanup(&self, job: &RemoteJob) -> Result<(), AdapterError> {
        self.children.remove(&job.backend_job_id);
        match tokio::fs::remove_dir_all(&job.output_location).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_sentinel_precedence() {
        let dir = TempDir::new().unwrap();
        assert_eq!(sentinel_phase(dir.path()), None);

        std::fs::write(dir.path().join("_CANCELLED"), b"").unwrap();
        assert_eq!(sentinel_phase(dir.path()), Some(RemotePhase::Cancelled));

        std::fs::write(dir.path().join("_SUCCESS"), b"").unwrap();
        assert_eq!(sentinel_phase(dir.path()), Some(RemotePhase::Completed));
    }

    fn artifact() -> Artifact {
        let unit = farcall_bundle::WorkUnit::new("jobs", "def f(x):\n    return x\n", "f").arg(1);
        let graph = farcall_bundle::DependencyAnalyzer::default()
            .analyze(&unit)
            .unwrap();
        farcall_bundle::BundleBuilder::default().build(&graph).unwrap()
    }

    #[tokio::test]
    async fn test_stage_replaces_partial_directory() {
        let dir = TempDir::new().unwrap();
        let adapter = LocalAdapter::new(dir.path(), "python3");
        let artifact = artifact();

        // Interrupted earlier attempt: manifest only
        let partial = dir.path().join(artifact.id());
        std::fs::create_dir_all(&partial).unwrap();
        std::fs::write(partial.join("manifest.json"), b"{}").unwrap();

        let destination = adapter.default_destination();
        let staged = adapter.stage(&artifact, &destination).await.unwrap();
        let staged_dir = PathBuf::from(&staged.location);
        assert_eq!(staged_dir, partial);
        assert!(staged_dir.join(BUNDLE_FILE).exists());
        assert!(staged_dir.join(ARCHIVE_FILE).exists());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);

        adapter.stage(&artifact, &destination).await.unwrap();
        assert!(staged_dir.join(BUNDLE_FILE).exists());
    }

    #[tokio::test]
    async fn test_poll_unknown_run() {
        let dir = TempDir::new().unwrap();
        let adapter = LocalAdapter::new(dir.path(), "python3");
        let job = RemoteJob {
            backend_job_id: "nope".to_string(),
            artifact_id: "abc".to_string(),
            staged_location: dir.path().display().to_string(),
            output_location: dir.path().join("runs/nope").display().to_string(),
        };
        assert!(matches!(
            adapter.poll(&job).await,
            Err(AdapterError::UnknownJob(_))
        ));
    }

    #[tokio::test]
    async fn test_fetch_reads_result_file() {
        let dir = TempDir::new().unwrap();
        let adapter = LocalAdapter::new(dir.path(), "python3");
        let out = dir.path().join("runs/r1");
        std::fs::create_dir_all(&out).unwrap();
        std::fs::write(out.join("result.json"), br#"{"ok": true, "value": [1, 2]}"#).unwrap();

        let job = RemoteJob {
            backend_job_id: "r1".to_string(),
            artifact_id: "abc".to_string(),
            staged_location: dir.path().display().to_string(),
            output_location: out.display().to_string(),
        };
        let payload = adapter.fetch_result(&job).await.unwrap();
        assert_eq!(payload.value, serde_json::json!([1, 2]));

        adapter.cleanup(&job).await.unwrap();
        assert!(!out.exists());
        // Removing twice is fine
        adapter.cleanup(&job).await.unwrap();
    }
}
