//! Slurm batch-scheduler adapter
//!
//! Staging and result retrieval work like the remote-shell adapter. Submission
//! renders an `#SBATCH` script from the `ResourceSpec` and pipes it into
//! `sbatch --parsable`; polling asks `squeue` first and falls back to `sacct`
//! once the job has left the queue.

use async_trait::async_trait;
use farcall_bundle::Artifact;
use farcall_fs::{shell_path, shell_quote, CommandTransport};
use std::sync::Arc;
use tracing::{debug, info};

use super::ssh::{fetch_remote, remove_remote, stage_remote};
use super::{
    run_id, AdapterError, BackendAdapter, BackendKind, RemoteJob, RemotePayload, RemotePhase,
    RemoteStatus, ResourceSpec, StageDestination, StagedRef,
};

/// Map a Slurm job state token onto the canonical phases
pub fn slurm_phase(token: &str) -> Option<RemotePhase> {
    // sacct reports e.g. "CANCELLED by 1000"; squeue may append "+"
    let token = token
        .split_whitespace()
        .next()
        .unwrap_or("")
        .trim_end_matches('+');
    match token {
        "PENDING" | "REQUEUED" | "REQUEUE_HOLD" | "REQUEUE_FED" | "CONFIGURING" | "RESV_DEL_HOLD"
        | "SUSPENDED" => Some(RemotePhase::Queued),
        "RUNNING" | "COMPLETING" | "STAGE_OUT" | "SIGNALING" | "RESIZING" => {
            Some(RemotePhase::Running)
        }
        "COMPLETED" => Some(RemotePhase::Completed),
        "FAILED" | "TIMEOUT" | "NODE_FAIL" | "OUT_OF_MEMORY" | "BOOT_FAIL" | "DEADLINE"
        | "PREEMPTED" => Some(RemotePhase::Failed),
        "CANCELLED" | "REVOKED" => Some(RemotePhase::Cancelled),
        _ => None,
    }
}

/// `D-HH:MM:SS` for `--time`
fn slurm_time(secs: u64) -> String {
    let days = secs / 86_400;
    let rest = secs % 86_400;
    let (h, m, s) = (rest / 3600, (rest % 3600) / 60, rest % 60);
    if days > 0 {
        format!("{}-{:02}:{:02}:{:02}", days, h, m, s)
    } else {
        format!("{:02}:{:02}:{:02}", h, m, s)
    }
}

pub struct SlurmAdapter {
    transport: Arc<dyn CommandTransport>,
    remote_dir: String,
    python: String,
    /// Default partition when the resource spec names none
    partition: Option<String>,
    account: Option<String>,
}

impl SlurmAdapter {
    pub fn new(
        transport: Arc<dyn CommandTransport>,
        remote_dir: impl Into<String>,
        python: impl Into<String>,
    ) -> Self {
        Self {
            transport,
            remote_dir: remote_dir.into(),
            python: python.into(),
            partition: None,
            account: None,
        }
    }

    pub fn with_partition(mut self, partition: Option<String>) -> Self {
        self.partition = partition;
        self
    }

    pub fn with_account(mut self, account: Option<String>) -> Self {
        self.account = account;
        self
    }

    /// Batch script for one submission
    pub fn render_script(
        &self,
        staged: &StagedRef,
        output_location: &str,
        resources: &ResourceSpec,
    ) -> String {
        let mut lines = vec![
            "#!/bin/bash".to_string(),
            format!(
                "#SBATCH --job-name=farcall-{}",
                &staged.artifact_id[..staged.artifact_id.len().min(12)]
            ),
            format!("#SBATCH --cpus-per-task={}", resources.cpus.max(1)),
            format!("#SBATCH --mem={}M", resources.memory_mb),
        ];
        if resources.gpus > 0 {
            lines.push(format!("#SBATCH --gres=gpu:{}", resources.gpus));
        }
        if let Some(secs) = resources.walltime_secs {
            lines.push(format!("#SBATCH --time={}", slurm_time(secs)));
        }
        if let Some(partition) = resources.partition.as_ref().or(self.partition.as_ref()) {
            lines.push(format!("#SBATCH --partition={}", partition));
        }
        if let Some(account) = &self.account {
            lines.push(format!("#SBATCH --account={}", account));
        }
        // sbatch does not expand `~` in these paths
        let log_dir = output_location.replacen("~/", "$HOME/", 1);
        lines.push(format!("#SBATCH --output={}/stdout.log", log_dir));
        lines.push(format!("#SBATCH --error={}/stderr.log", log_dir));
        for (key, value) in &resources.extra {
            lines.push(format!("#SBATCH --{}={}", key, value));
        }
        lines.push(String::new());
        lines.push(format!(
            "export FARCALL_OUTPUT_DIR={}",
            shell_path(output_location)
        ));
        lines.push(format!("cd {}", shell_path(&staged.location)));
        lines.push(format!("exec {} bundle.py", shell_quote(&self.python)));
        lines.join("\n") + "\n"
    }

    async fn query(&self, command: &str) -> Result<String, AdapterError> {
        let output = self.transport.run(command).await?;
        if !output.success() {
            return Err(AdapterError::command("poll", self.transport.describe(), &output));
        }
        Ok(output.first_line().unwrap_or("").to_string())
    }
}

#[async_trait]
impl BackendAdapter for SlurmAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::Slurm
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
        resources: &ResourceSpec,
    ) -> Result<RemoteJob, AdapterError> {
        let output_location = format!("{}/runs/{}", staged.location, run_id());
        let script = self.render_script(staged, &output_location, resources);
        debug!("sbatch script for {}:\n{}", staged.artifact_id, script);

        let command = format!(
            "mkdir -p {} && sbatch --parsable",
            shell_path(&output_location)
        );
        let output = self
            .transport
            .run_with_input(&command, script.as_bytes())
            .await?;
        if !output.success() {
            return Err(AdapterError::command("sbatch", self.transport.describe(), &output));
        }

        // --parsable prints "<id>" or "<id>;<cluster>"
        let job_id = output
            .first_line()
            .and_then(|l| l.split(';').next())
            .filter(|id| !id.is_empty() && id.chars().all(|c| c.is_ascii_digit() || c == '_'))
            .ok_or_else(|| AdapterError::Parse {
                operation: "sbatch",
                output: output.stdout.clone(),
            })?
            .to_string();

        info!(
            "Submitted artifact {} to Slurm on {} as job {}",
            staged.artifact_id,
            self.transport.describe(),
            job_id
        );
        Ok(RemoteJob {
            backend_job_id: job_id,
            artifact_id: staged.artifact_id.clone(),
            staged_location: staged.location.clone(),
            output_location,
        })
    }

    async fn poll(&self, job: &RemoteJob) -> Result<RemoteStatus, AdapterError> {
        let id = shell_quote(&job.backend_job_id);
        let mut token = self
            .query(&format!("squeue -h -j {} -o %T 2>/dev/null || true", id))
            .await?;
        if token.is_empty() {
            token = self
                .query(&format!("sacct -n -X -P -o State -j {}", id))
                .await?;
        }
        Ok(match slurm_phase(&token) {
            Some(phase) => RemoteStatus::known(phase, token),
            None => RemoteStatus::unknown(token),
        })
    }

    async fn cancel(&self, job: &RemoteJob) -> Result<(), AdapterError> {
        let output = self
            .transport
            .run(&format!("scancel {}", shell_quote(&job.backend_job_id)))
            .await?;
        if output.success() {
            Ok(())
        } else {
            Err(AdapterError::command("scancel", self.transport.describe(), &output))
        }
    }

    async fn fetch_result(&self, job: &RemoteJob) -> Result<RemotePayload, AdapterError> {
        fetch_remote(self.transport.as_ref(), job, "stderr.log").await
    }

    async fn cleanup(&self, job: &RemoteJob) -> Result<(), AdapterError> {
        remove_remote(self.transport.as_ref(), job).await
    }
}
