//! Container-orchestrator adapter
//!
//! The staged files become a config map (`farcall-<artifact>`), each run a
//! batch/v1 Job mounting it at `/farcall`. The result comes back through the
//! pod log: the bootstrap prints a `__FARCALL_RESULT__ <json>` line.

use async_trait::async_trait;
use dashmap::DashMap;
use farcall_bundle::features::bundling::artifact::{BUNDLE_FILE, DATA_DIR, MANIFEST_FILE};
use farcall_bundle::Artifact;
use farcall_fs::{shell_quote, CommandTransport, LocalShell};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info};

use super::{
    run_id, AdapterError, BackendAdapter, BackendKind, RemoteJob, RemotePayload, RemotePhase,
    RemoteStatus, ResourceSpec, StageDestination, StagedRef,
};

const MOUNT_PATH: &str = "/farcall";
const OUTPUT_DIR: &str = "/tmp/farcall-out";

/// Map a pod phase onto the canonical phases
pub fn pod_phase(token: &str) -> Option<RemotePhase> {
    match token {
        // No pod yet: the job controller has not scheduled one
        "" | "Pending" => Some(RemotePhase::Queued),
        "Running" => Some(RemotePhase::Running),
        "Succeeded" => Some(RemotePhase::Completed),
        "Failed" => Some(RemotePhase::Failed),
        _ => None,
    }
}

/// Config map keys allow `[-._a-zA-Z0-9]` only
fn config_key(name: &str) -> String {
    let sanitized: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("data.{}", sanitized)
}

pub struct KubernetesAdapter {
    transport: Arc<dyn CommandTransport>,
    kubectl: String,
    context: Option<String>,
    namespace: String,
    image: String,
    /// Config map name → (key, mount path) for data files, recorded at stage
    data_items: DashMap<String, Vec<(String, String)>>,
}

impl KubernetesAdapter {
    pub fn new(namespace: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            transport: Arc::new(LocalShell),
            kubectl: "kubectl".to_string(),
            context: None,
            namespace: namespace.into(),
            image: image.into(),
            data_items: DashMap::new(),
        }
    }

    pub fn with_transport(mut self, transport: Arc<dyn CommandTransport>) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_kubectl(mut self, kubectl: impl Into<String>) -> Self {
        self.kubectl = kubectl.into();
        self
    }

    pub fn with_context(mut self, context: Option<String>) -> Self {
        self.context = context;
        self
    }

    /// `kubectl [--context C] -n NS`
    fn kubectl(&self) -> String {
        let mut cmd = shell_quote(&self.kubectl);
        if let Some(context) = &self.context {
            cmd.push_str(" --context ");
            cmd.push_str(&shell_quote(context));
        }
        cmd.push_str(" -n ");
        cmd.push_str(&shell_quote(&self.namespace));
        cmd
    }

    async fn kubectl_run(&self, operation: &'static str, args: &str) -> Result<String, AdapterError> {
        let output = self
            .transport
            .run(&format!("{} {}", self.kubectl(), args))
            .await?;
        if !output.success() {
            return Err(AdapterError::command(operation, self.describe(), &output));
        }
        Ok(output.stdout)
    }

    fn describe(&self) -> String {
        match &self.context {
            Some(context) => format!("{}/{}", context, self.namespace),
            None => self.namespace.clone(),
        }
    }

    /// batch/v1 Job for one run of a staged config map
    pub fn job_manifest(
        &self,
        job_name: &str,
        staged: &StagedRef,
        resources: &ResourceSpec,
        data_items: &[(String, String)],
    ) -> Value {
        let mut items = vec![
            json!({"key": MANIFEST_FILE, "path": MANIFEST_FILE}),
            json!({"key": BUNDLE_FILE, "path": BUNDLE_FILE}),
        ];
        items.extend(
            data_items
                .iter()
                .map(|(key, path)| json!({"key": key, "path": path})),
        );

        let mut labels = serde_json::Map::new();
        labels.insert("app.kubernetes.io/managed-by".to_string(), json!("farcall"));
        labels.insert(
            "farcall/artifact".to_string(),
            json!(&staged.artifact_id[..staged.artifact_id.len().min(16)]),
        );
        for (key, value) in &resources.extra {
            labels.insert(key.clone(), json!(value));
        }

        let mut container_resources = json!({
            "requests": {
                "cpu": resources.cpus.max(1).to_string(),
                "memory": format!("{}Mi", resources.memory_mb),
            }
        });
        if resources.gpus > 0 {
            container_resources["limits"] = json!({"nvidia.com/gpu": resources.gpus.to_string()});
        }

        let mut spec = json!({
            "backoffLimit": 0,
            "template": {
                "metadata": {"labels": labels.clone()},
                "spec": {
                    "restartPolicy": "Never",
                    "containers": [{
                        "name": "work-unit",
                        "image": self.image,
                        "command": ["python3", format!("{}/{}", MOUNT_PATH, BUNDLE_FILE)],
                        "env": [{"name": "FARCALL_OUTPUT_DIR", "value": OUTPUT_DIR}],
                        "resources": container_resources,
                        "volumeMounts": [{"name": "bundle", "mountPath": MOUNT_PATH, "readOnly": true}],
                    }],
                    "volumes": [{
                        "name": "bundle",
                        "configMap": {"name": staged.location, "items": items},
                    }],
                }
            }
        });
        if let Some(secs) = resources.walltime_secs {
            spec["activeDeadlineSeconds"] = json!(secs);
        }

        json!({
            "apiVersion": "batch/v1",
            "kind": "Job",
            "metadata": {"name": job_name, "namespace": self.namespace, "labels": labels},
            "spec": spec,
        })
    }
}

#[async_trait]
impl BackendAdapter for KubernetesAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::Kubernetes
    }

    fn default_destination(&self) -> StageDestination {
        StageDestination::new(self.namespace.clone())
    }

    async fn stage(
        &self,
        artifact: &Artifact,
        _destination: &StageDestination,
    ) -> Result<StagedRef, AdapterError> {
        let name = format!("farcall-{}", &artifact.id()[..artifact.id().len().min(16)]);

        let scratch = tempfile::Builder::new().prefix("farcall-stage-").tempdir()?;
        let owned = artifact.clone();
        let dir = scratch.path().to_path_buf();
        let files = tokio::task::spawn_blocking(move || owned.materialize(&dir))
            .await
            .map_err(|e| AdapterError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))??;

        let mut sources = vec![
            format!("--from-file={}={}", MANIFEST_FILE, shell_quote(&files.manifest_path.to_string_lossy())),
            format!("--from-file={}={}", BUNDLE_FILE, shell_quote(&files.bundle_path.to_string_lossy())),
        ];
        let mut items = Vec::new();
        for data in artifact.data_files() {
            let key = config_key(&data.name);
            let path = files.dir.join(DATA_DIR).join(&data.name);
            sources.push(format!(
                "--from-file={}={}",
                key,
                shell_quote(&path.to_string_lossy())
            ));
            items.push((key, format!("{}/{}", DATA_DIR, data.name)));
        }

        // Rendered client-side and applied so re-staging the same artifact is a no-op
        let command = format!(
            "{k} create configmap {name} {sources} --dry-run=client -o yaml | {k} apply -f -",
            k = self.kubectl(),
            name = shell_quote(&name),
            sources = sources.join(" "),
        );
        let output = self.transport.run(&command).await?;
        if !output.success() {
            return Err(AdapterError::command("stage", self.describe(), &output));
        }

        self.data_items.insert(name.clone(), items);
        info!(
            "Staged artifact {} as config map {} in {}",
            artifact.id(),
            name,
            self.describe()
        );
        Ok(StagedRef {
            artifact_id: artifact.id().to_string(),
            location: name,
        })
    }

    async fn submit(
        &self,
        staged: &StagedRef,
        resources: &ResourceSpec,
    ) -> Result<RemoteJob, AdapterError> {
        let job_name = format!(
            "farcall-{}-{}",
            &staged.artifact_id[..staged.artifact_id.len().min(12)],
            &run_id()[..8]
        );
        let data_items = self
            .data_items
            .get(&staged.location)
            .map(|items| items.clone())
            .unwrap_or_default();
        let manifest = self.job_manifest(&job_name, staged, resources, &data_items);
        let body = serde_json::to_vec(&manifest).map_err(|e| AdapterError::Parse {
            operation: "submit",
            output: e.to_string(),
        })?;
        debug!("Job manifest for {}: {}", job_name, manifest);

        let output = self
            .transport
            .run_with_input(&format!("{} apply -f -", self.kubectl()), &body)
            .await?;
        if !output.success() {
            return Err(AdapterError::command("submit", self.describe(), &output));
        }

        info!(
            "Created Kubernetes job {} for artifact {} in {}",
            job_name,
            staged.artifact_id,
            self.describe()
        );
        Ok(RemoteJob {
            backend_job_id: job_name,
            artifact_id: staged.artifact_id.clone(),
            staged_location: staged.location.clone(),
            output_location: OUTPUT_DIR.to_string(),
        })
    }

    async fn poll(&self, job: &RemoteJob) -> Result<RemoteStatus, AdapterError> {
        let args = format!(
            "get pods -l job-name={} -o jsonpath={}",
            shell_quote(&job.backend_job_id),
            shell_quote("{.items[*].status.phase}")
        );
        let stdout = self.kubectl_run("poll", &args).await?;
        // backoffLimit is 0, so the newest pod decides
        let token = stdout.split_whitespace().last().unwrap_or("").to_string();
        Ok(match pod_phase(&token) {
            Some(phase) => RemoteStatus::known(phase, token),
            None => RemoteStatus::unknown(token),
        })
    }

    async fn cancel(&self, job: &RemoteJob) -> Result<(), AdapterError> {
        let args = format!(
            "delete job {} --ignore-not-found --wait=false",
            shell_quote(&job.backend_job_id)
        );
        self.kubectl_run("cancel", &args).await.map(|_| ())
    }

    async fn fetch_result(&self, job: &RemoteJob) -> Result<RemotePayload, AdapterError> {
        let output = self
            .transport
            .run(&format!(
                "{} logs job/{} --tail=-1",
                self.kubectl(),
                shell_quote(&job.backend_job_id)
            ))
            .await?;
        if !output.success() {
            return Err(AdapterError::ResultMissing(format!(
                "logs for job {}: {}",
                job.backend_job_id,
                output.stderr.trim()
            )));
        }
        RemotePayload::from_log(&output.stdout)
    }

    async fn cleanup(&self, job: &RemoteJob) -> Result<(), AdapterError> {
        let args = format!(
            "delete job {} --ignore-not-found --cascade=background",
            shell_quote(&job.backend_job_id)
        );
        self.kubectl_run("cleanup", &args).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pod_phases() {
        assert_eq!(pod_phase(""), Some(RemotePhase::Queued));
        assert_eq!(pod_phase("Pending"), Some(RemotePhase::Queued));
        assert_eq!(pod_phase("Running"), Some(RemotePhase::Running));
        assert_eq!(pod_phase("Succeeded"), Some(RemotePhase::Completed));
        assert_eq!(pod_phase("Failed"), Some(RemotePhase::Failed));
        assert_eq!(pod_phase("Unknown"), None);
    }

    #[test]
    fn test_config_keys_are_sanitized() {
        assert_eq!(config_key("input.csv"), "data.input.csv");
        assert_eq!(config_key("my file+1.txt"), "data.my_file_1.txt");
    }

    #[test]
    fn test_job_manifest_shape() {
        let adapter = KubernetesAdapter::new("research", "python:3.11-slim")
            .with_context(Some("gpu-cluster".to_string()));
        let staged = StagedRef {
            artifact_id: "0123456789abcdef0123".to_string(),
            location: "farcall-0123456789abcdef".to_string(),
        };
        let resources = ResourceSpec {
            cpus: 2,
            memory_mb: 4096,
            gpus: 1,
            walltime_secs: Some(600),
            ..ResourceSpec::default()
        };
        let items = vec![("data.input.csv".to_string(), "data/input.csv".to_string())];
        let manifest = adapter.job_manifest("farcall-0123456789ab-run1", &staged, &resources, &items);

        assert_eq!(manifest["kind"], "Job");
        assert_eq!(manifest["metadata"]["namespace"], "research");
        assert_eq!(manifest["spec"]["backoffLimit"], 0);
        assert_eq!(manifest["spec"]["activeDeadlineSeconds"], 600);

        let pod = &manifest["spec"]["template"]["spec"];
        assert_eq!(pod["restartPolicy"], "Never");
        let container = &pod["containers"][0];
        assert_eq!(container["command"], json!(["python3", "/farcall/bundle.py"]));
        assert_eq!(container["resources"]["requests"]["memory"], "4096Mi");
        assert_eq!(container["resources"]["limits"]["nvidia.com/gpu"], "1");

        let volume = &pod["volumes"][0]["configMap"];
        assert_eq!(volume["name"], "farcall-0123456789abcdef");
        assert_eq!(volume["items"].as_array().unwrap().len(), 3);
        assert_eq!(volume["items"][2]["path"], "data/input.csv");

        assert_eq!(adapter.kubectl(), "kubectl --context gpu-cluster -n research");
    }
}
