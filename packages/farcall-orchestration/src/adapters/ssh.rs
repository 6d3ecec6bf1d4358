//! Remote-shell adapter
//!
//! The bundle runs as a detached background process on the remote host.
//! Status comes from the result sentinels and `kill -0` on the recorded pid.
//! Every command goes through the shared `SshSession` for the target.

use async_trait::async_trait;
use farcall_bundle::features::bundling::artifact::ARCHIVE_FILE;
use farcall_bundle::Artifact;
use farcall_fs::{shell_path, shell_quote, CommandTransport};
use std::sync::Arc;
use tracing::{debug, info};

use super::{
    run_id, AdapterError, BackendAdapter, BackendKind, RemoteJob, RemotePayload, RemotePhase,
    RemoteStatus, ResourceSpec, StageDestination, StagedRef,
};

// ═══════════════════════════════════════════════════════════════════════════
// Shared remote-shell operations (also used by the Slurm adapter)
// ═══════════════════════════════════════════════════════════════════════════

/// Materialise into a local temp dir, upload it next to `<root>/<artifact-id>`
/// and move it into place, so the staged directory is never half-copied
pub(crate) async fn stage_remote(
    transport: &dyn CommandTransport,
    artifact: &Artifact,
    destination: &StageDestination,
) -> Result<StagedRef, AdapterError> {
    let location = destination.join(artifact.id());
    let staged = StagedRef {
        artifact_id: artifact.id().to_string(),
        location: location.clone(),
    };

    // Content-addressed, and the archive is the last file written
    let staged_check = format!("test -f {}/{}", shell_path(&location), ARCHIVE_FILE);
    if transport.run(&staged_check).await?.success() {
        debug!("Artifact {} already staged at {}", artifact.id(), location);
        return Ok(staged);
    }

    let scratch = tempfile::Builder::new().prefix("farcall-stage-").tempdir()?;
    let local_dir = scratch.path().join(artifact.id());
    let owned = artifact.clone();
    let dir = local_dir.clone();
    tokio::task::spawn_blocking(move || owned.materialize(&dir))
        .await
        .map_err(|e| AdapterError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))??;

    let upload = destination.join(&format!(".upload-{}", run_id()));
    transport.upload_dir(&local_dir, &upload).await?;

    let uploaded = format!("{}/{}", upload, artifact.id());
    let install = format!(
        "if [ -f {dst}/{archive} ]; then :; else rm -rf {dst} && mv {src} {dst}; fi; rm -rf {tmp}",
        dst = shell_path(&location),
        archive = ARCHIVE_FILE,
        src = shell_path(&uploaded),
        tmp = shell_path(&upload),
    );
    let output = transport.run(&install).await?;
    if !output.success() {
        return Err(AdapterError::command("stage", transport.describe(), &output));
    }
    info!(
        "Staged artifact {} to {}:{}",
        artifact.id(),
        transport.describe(),
        location
    );
    Ok(staged)
}

/// `cat result.json`, plus the stderr tail for failed runs
pub(crate) async fn fetch_remote(
    transport: &dyn CommandTransport,
    job: &RemoteJob,
    log_file: &str,
) -> Result<RemotePayload, AdapterError> {
    let out_dir = shell_path(&job.output_location);
    let output = transport.run(&format!("cat {}/result.json", out_dir)).await?;
    if !output.success() {
        return Err(AdapterError::ResultMissing(format!(
            "{}/result.json: {}",
            job.output_location,
            output.stderr.trim()
        )));
    }
    let payload = RemotePayload::parse(&output.stdout)?;
    if payload.ok {
        return Ok(payload);
    }

    let tail = transport
        .run(&format!("tail -n 40 {}/{} 2>/dev/null", out_dir, log_file))
        .await
        .ok()
        .map(|o| o.stdout);
    Ok(payload.with_log_tail(tail))
}

pub(crate) async fn remove_remote(
    transport: &dyn CommandTransport,
    job: &RemoteJob,
) -> Result<(), AdapterError> {
    let output = transport
        .run(&format!("rm -rf {}", shell_path(&job.output_location)))
        .await?;
    if output.success() {
        Ok(())
    } else {
        Err(AdapterError::command("cleanup", transport.describe(), &output))
    }
}

/// Shell snippet printing `completed`, `failed`, `cancelled`, `running` or
/// `lost` for a background process and its output directory
fn status_script(out_dir: &str, pid: &str) -> String {
    format!(
        "out={out}; \
         if [ -f \"$out/_SUCCESS\" ]; then echo completed; \
         elif [ -f \"$out/_FAILED\" ]; then echo failed; \
         elif [ -f \"$out/_CANCELLED\" ]; then echo cancelled; \
         elif kill -0 {pid} 2>/dev/null; then echo running; \
         else echo lost; fi",
        out = shell_path(out_dir),
        pid = shell_quote(pid),
    )
}

fn status_phase(token: &str) -> Option<RemotePhase> {
    match token {
        "completed" => Some(RemotePhase::Completed),
        "failed" => Some(RemotePhase::Failed),
        "cancelled" => Some(RemotePhase::Cancelled),
        "running" => Some(RemotePhase::Running),
        _ => None,
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Adapter
// ═══════════════════════════════════════════════════════════════════════════

pub struct SshAdapter {
    transport: Arc<dyn CommandTransport>,
    remote_dir: String,
    python: String,
}

impl SshAdapter {
    pub fn new(
        transport: Arc<dyn CommandTransport>,
        remote_dir: impl Into<String>,
        python: impl Into<String>,
    ) -> Self {
        Self {
            transport,
            remote_dir: remote_dir.into(),
            python: python.into(),
        }
    }
}

#[async_trait]
impl BackendAdapter for SshAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::Ssh
    }

    fn default_destination(&self) -> StageDestination {
        StageDestination::new(self.remote_dir.clone())
    }

    async fn stage(
        &self,
        artifact: &Artifact,
        destination: &StageDestination,
    ) -> Result<StagedRef, AdapterError> {
        stage_remote(self.transport.as_ref(), artifact, destination).await
    }

    async fn submit(
        &self,
        staged: &StagedRef,
        _resources: &ResourceSpec,
    ) -> Result<RemoteJob, AdapterError> {
        let output_location = format!("{}/runs/{}", staged.location, run_id());
        let out = shell_path(&output_location);
        // `echo $!` must follow a single backgrounded command to get its pid
        let command = format!(
            "mkdir -p {out}; FARCALL_OUTPUT_DIR={out} nohup {python} {bundle} > {out}/stdout.log 2> {out}/stderr.log < /dev/null & echo $!",
            out = out,
            python = shell_quote(&self.python),
            bundle = shell_path(&format!("{}/bundle.py", staged.location)),
        );
        let output = self.transport.run(&command).await?;
        if !output.success() {
            return Err(AdapterError::command("submit", self.transport.describe(), &output));
        }
        let pid = output
            .first_line()
            .filter(|l| l.chars().all(|c| c.is_ascii_digit()))
            .ok_or_else(|| AdapterError::Parse {
                operation: "submit",
                output: output.stdout.clone(),
            })?
            .to_string();

        info!(
            "Launched artifact {} on {} as pid {}",
            staged.artifact_id,
            self.transport.describe(),
            pid
        );
        Ok(RemoteJob {
            backend_job_id: pid,
            artifact_id: staged.artifact_id.clone(),
            staged_location: staged.location.clone(),
            output_location,
        })
    }

    async fn poll(&self, job: &RemoteJob) -> Result<RemoteStatus, AdapterError> {
        let output = self
            .transport
            .run(&status_script(&job.output_location, &job.backend_job_id))
            .await?;
        if !output.success() {
            return Err(AdapterError::command("poll", self.transport.describe(), &output));
        }
        let token = output.first_line().unwrap_or("").to_string();
        Ok(match status_phase(&token) {
            Some(phase) => RemoteStatus::known(phase, token),
            None => RemoteStatus::unknown(token),
        })
    }

    async fn cancel(&self, job: &RemoteJob) -> Result<(), AdapterError> {
        let command = format!(
            "kill {pid} 2>/dev/null; touch {out}/_CANCELLED",
            pid = shell_quote(&job.backend_job_id),
            out = shell_path(&job.output_location),
        );
        let output = self.transport.run(&command).await?;
        if output.success() {
            Ok(())
        } else {
            Err(AdapterError::command("cancel", self.transport.describe(), &output))
        }
    }

    async fn fetch_result(&self, job: &RemoteJob) -> Result<RemotePayload, AdapterError> {
        fetch_remote(self.transport.as_ref(), job, "stderr.log").await
    }

    async fn cleanup(&self, job: &RemoteJob) -> Result<(), AdapterError> {
        remove_remote(self.transport.as_ref(), job).await
    }
}
