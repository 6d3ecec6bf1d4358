//! Slurm backend against stub `sbatch`/`squeue`/`sacct`/`scancel`
//!
//! The stubs run the generated batch script in the background and answer
//! queries from the run's sentinel files, so the adapter's command lines,
//! script rendering and state mapping are exercised without a cluster.
//! Skipped when no `python3` is on PATH.
#![cfg(unix)]

use farcall_bundle::WorkUnit;
use farcall_fs::LocalShell;
use farcall_orchestration::{
    JobOrchestrator, JobState, OrchestratorConfig, OrchestratorError, PollPolicy, RetryPolicy,
    SlurmAdapter,
};
use pretty_assertions::assert_eq;
use serde_json::json;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

const SBATCH: &str = r#"#!/bin/sh
state="$(dirname "$0")/jobs"
mkdir -p "$state"
id=$$
script="$state/$id.sh"
cat > "$script"
log=$(sed -n 's/^#SBATCH --output=//p' "$script")
out=$(dirname "$log")
echo "$out" > "$state/$id.out"
nohup sh "$script" > "$out/stdout.log" 2> "$out/stderr.log" < /dev/null &
echo $! > "$state/$id.pid"
echo "$id;stub"
"#;

// squeue -h -j ID -o %T
const SQUEUE: &str = r#"#!/bin/sh
state="$(dirname "$0")/jobs"
id="$3"
out=$(cat "$state/$id.out")
[ -f "$state/$id.cancelled" ] && exit 0
[ -f "$out/_SUCCESS" ] && exit 0
[ -f "$out/_FAILED" ] && exit 0
if kill -0 "$(cat "$state/$id.pid")" 2>/dev/null; then echo RUNNING; fi
"#;

// sacct -n -X -P -o State -j ID
const SACCT: &str = r#"#!/bin/sh
state="$(dirname "$0")/jobs"
id="$7"
out=$(cat "$state/$id.out")
if [ -f "$state/$id.cancelled" ]; then echo "CANCELLED by 1000"
elif [ -f "$out/_SUCCESS" ]; then echo COMPLETED
elif [ -f "$out/_FAILED" ]; then echo FAILED
else echo PENDING
fi
"#;

const SCANCEL: &str = r#"#!/bin/sh
state="$(dirname "$0")/jobs"
kill "$(cat "$state/$1.pid")" 2>/dev/null
touch "$state/$1.cancelled"
"#;

fn python_available() -> bool {
    Command::new("python3")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// Writes the stubs once and puts them first on PATH for the whole test binary
fn install_stubs() -> &'static Path {
    static STUBS: OnceLock<PathBuf> = OnceLock::new();
    STUBS.get_or_init(|| {
        let dir = std::env::temp_dir().join(format!("farcall-slurm-stubs-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        for (name, body) in [
            ("sbatch", SBATCH),
            ("squeue", SQUEUE),
            ("sacct", SACCT),
            ("scancel", SCANCEL),
        ] {
            let path = dir.join(name);
            std::fs::write(&path, body).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        let path = std::env::var("PATH").unwrap_or_default();
        std::env::set_var("PATH", format!("{}:{}", dir.display(), path));
        dir
    })
}

fn slurm_orchestrator(remote_dir: &Path) -> JobOrchestrator {
    install_stubs();
    let config = OrchestratorConfig {
        retry: RetryPolicy::new(2, Duration::from_millis(50), Duration::from_millis(100)),
        polling: PollPolicy {
            initial_interval_ms: 50,
            max_interval_ms: 200,
            multiplier: 1.5,
            unknown_budget: 5,
        },
        timeout: Duration::from_secs(60),
        ..OrchestratorConfig::default()
    };
    let orchestrator = JobOrchestrator::new(config);
    let adapter = SlurmAdapter::new(
        Arc::new(LocalShell),
        remote_dir.to_string_lossy().into_owned(),
        "python3",
    )
    .with_partition(Some("debug".to_string()));
    orchestrator.register_backend("slurm", Arc::new(adapter));
    orchestrator
}

#[tokio::test]
async fn test_batch_job_completes_through_sacct() {
    if !python_available() {
        eprintln!("python3 not found, skipping");
        return;
    }
    let remote = tempfile::tempdir().unwrap();
    let orch = slurm_orchestrator(remote.path());
    let source = "def add(a, b):\n    return {\"sum\": a + b}\n";

    let handle = orch
        .submit(&WorkUnit::new("main", source, "add").arg(2).arg(3), "slurm")
        .await
        .unwrap();
    let result = tokio::time::timeout(Duration::from_secs(30), orch.wait(&handle))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(result.value, json!({"sum": 5}));

    let job = orch.job(&handle).unwrap();
    assert_eq!(job.state, JobState::Completed);
    // `--parsable` output is "<id>;<cluster>"
    let id = job.backend_job_id.clone().unwrap();
    assert!(id.chars().all(|c| c.is_ascii_digit()), "job id {:?}", id);

    // the stub kept the script sbatch received
    let script = std::fs::read_to_string(install_stubs().join("jobs").join(format!("{}.sh", id)))
        .unwrap();
    assert!(script.contains("#SBATCH --partition=debug"));
    assert!(script.contains("exec python3 bundle.py"));
}

#[tokio::test]
async fn test_scancel_maps_to_cancelled() {
    if !python_available() {
        eprintln!("python3 not found, skipping");
        return;
    }
    let remote = tempfile::tempdir().unwrap();
    let orch = slurm_orchestrator(remote.path());
    let source = "import time\n\ndef nap(x):\n    time.sleep(x)\n    return x\n";

    let handle = orch
        .submit(&WorkUnit::new("main", source, "nap").arg(30), "slurm")
        .await
        .unwrap();
    orch.watch(&handle)
        .unwrap()
        .wait_for(|s| *s == JobState::Running)
        .await
        .unwrap();

    orch.cancel_job(&handle).unwrap();
    let err = tokio::time::timeout(Duration::from_secs(10), orch.wait(&handle))
        .await
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::Cancelled(_)));
    assert_eq!(orch.get_job_status(&handle).unwrap(), JobState::Cancelled);
}
