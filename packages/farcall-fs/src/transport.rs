//! Command transport used by the remote filesystem and the backend adapters
//!
//! `SshSession` keeps one multiplexed OpenSSH connection per target
//! (`ControlMaster=auto`). Every command acquires a permit from a fair
//! semaphore for the duration of that single command; the permit is an RAII
//! guard, so it is released on success, error and cancellation alike. No lock
//! is held across a whole job lifecycle, which lets status polls and cancels
//! from different jobs interleave on the same connection.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::Semaphore;
use tracing::debug;

use crate::error::TransportError;

/// Captured output of one command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }

    /// First non-empty stdout line, trimmed
    pub fn first_line(&self) -> Option<&str> {
        self.stdout.lines().map(str::trim).find(|l| !l.is_empty())
    }
}

/// Runs shell commands on some target
#[async_trait]
pub trait CommandTransport: Send + Sync {
    /// Human-readable target (`user@host:port`, `localhost`)
    fn describe(&self) -> String;

    async fn run(&self, command: &str) -> Result<CommandOutput, TransportError>;

    async fn run_with_input(
        &self,
        command: &str,
        input: &[u8],
    ) -> Result<CommandOutput, TransportError>;

    /// Copy a local directory tree to `remote_parent/<dir name>`
    async fn upload_dir(&self, local: &Path, remote_parent: &str) -> Result<(), TransportError>;
}

/// Quote a string for POSIX `sh`
pub fn shell_quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "/._-=:,+@%".contains(c))
    {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', "'\\''"))
}

/// Quote a remote path, leaving a leading `~/` for the remote shell to expand
pub fn shell_path(path: &str) -> String {
    match path.strip_prefix("~/") {
        Some(rest) => format!("~/{}", shell_quote(rest)),
        None => shell_quote(path),
    }
}

async fn collect(
    program: &str,
    target: &str,
    mut cmd: Command,
    input: Option<&[u8]>,
) -> Result<CommandOutput, TransportError> {
    cmd.stdin(if input.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    })
    .stdout(Stdio::piped())
    .stderr(Stdio::piped());

    let mut child = cmd.spawn().map_err(|source| TransportError::Spawn {
        program: program.to_string(),
        source,
    })?;

    if let Some(bytes) = input {
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(bytes)
                .await
                .map_err(|source| TransportError::Io {
                    target: target.to_string(),
                    source,
                })?;
            // Dropping stdin closes the pipe so the remote side sees EOF
        }
    }

    let output = child
        .wait_with_output()
        .await
        .map_err(|source| TransportError::Io {
            target: target.to_string(),
            source,
        })?;

    Ok(CommandOutput {
        status: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

// ═══════════════════════════════════════════════════════════════════════════
// Local shell
// ═══════════════════════════════════════════════════════════════════════════

/// Runs commands through the local `sh`; used for tools that live on the
/// submitting machine (`kubectl`) and for exercising remote code paths in tests
#[derive(Debug, Clone, Default)]
pub struct LocalShell;

#[async_trait]
impl CommandTransport for LocalShell {
    fn describe(&self) -> String {
        "localhost".to_string()
    }

    async fn run(&self, command: &str) -> Result<CommandOutput, TransportError> {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command);
        collect("sh", "localhost", cmd, None).await
    }

    async fn run_with_input(
        &self,
        command: &str,
        input: &[u8],
    ) -> Result<CommandOutput, TransportError> {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command);
        collect("sh", "localhost", cmd, Some(input)).await
    }

    async fn upload_dir(&self, local: &Path, remote_parent: &str) -> Result<(), TransportError> {
        let command = format!(
            "mkdir -p {parent} && cp -R {src} {parent}/",
            parent = shell_path(remote_parent),
            src = shell_quote(&local.to_string_lossy()),
        );
        let out = self.run(&command).await?;
        if out.success() {
            Ok(())
        } else {
            Err(TransportError::Unreachable {
                target: self.describe(),
                status: out.status,
                stderr: out.stderr,
            })
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// SSH
// ═══════════════════════════════════════════════════════════════════════════

/// SSH coordinates of a remote host
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SshTarget {
    pub host: String,
    pub user: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Path to a private key, if not using the agent/default key
    #[serde(default)]
    pub identity_file: Option<PathBuf>,
}

fn default_port() -> u16 {
    22
}

impl SshTarget {
    pub fn new(host: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            user: user.into(),
            port: default_port(),
            identity_file: None,
        }
    }

    /// Build the `user@host` string used in SSH/scp commands
    pub fn user_at_host(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }

    /// Connection options shared by ssh and scp (no port flag, no destination)
    fn common_options(&self, control_path: &Path) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "StrictHostKeyChecking=accept-new".to_string(),
            "-o".to_string(),
            "ConnectTimeout=10".to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "ControlMaster=auto".to_string(),
            "-o".to_string(),
            format!("ControlPath={}", control_path.display()),
            "-o".to_string(),
            "ControlPersist=60".to_string(),
        ];
        if let Some(ref key) = self.identity_file {
            args.push("-i".to_string());
            args.push(key.display().to_string());
        }
        args
    }

    /// Base SSH arguments (port, options, key, user@host) without a command
    pub fn ssh_base_args(&self, control_path: &Path) -> Vec<String> {
        let mut args = vec!["-p".to_string(), self.port.to_string()];
        args.extend(self.common_options(control_path));
        args.push(self.user_at_host());
        args
    }

    /// scp arguments up to (not including) source and destination
    pub fn scp_base_args(&self, control_path: &Path) -> Vec<String> {
        let mut args = vec!["-P".to_string(), self.port.to_string(), "-r".to_string(), "-q".to_string()];
        args.extend(self.common_options(control_path));
        args
    }
}

impl std::fmt::Display for SshTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}:{}", self.user, self.host, self.port)
    }
}

/// One multiplexed SSH connection shared by every caller of the same target
#[derive(Debug)]
pub struct SshSession {
    target: SshTarget,
    control_path: PathBuf,
    permits: Semaphore,
}

impl SshSession {
    /// Default number of commands allowed in flight over one connection
    pub const DEFAULT_MAX_CONCURRENT: usize = 4;

    pub fn new(target: SshTarget) -> Self {
        Self::with_concurrency(target, Self::DEFAULT_MAX_CONCURRENT)
    }

    pub fn with_concurrency(target: SshTarget, max_concurrent: usize) -> Self {
        // %C is expanded by ssh to a hash of (local host, host, port, user)
        let control_path = std::env::temp_dir().join("farcall-%C");
        Self {
            target,
            control_path,
            permits: Semaphore::new(max_concurrent.max(1)),
        }
    }

    pub fn target(&self) -> &SshTarget {
        &self.target
    }

    async fn execute(&self, command: &str, input: Option<&[u8]>) -> Result<CommandOutput, TransportError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| TransportError::Closed {
                target: self.target.to_string(),
            })?;

        debug!("ssh {}: {}", self.target, command);
        let mut cmd = Command::new("ssh");
        cmd.args(self.target.ssh_base_args(&self.control_path))
            .arg("--")
            .arg(command);
        let out = collect("ssh", &self.target.to_string(), cmd, input).await?;

        // ssh reserves 255 for its own failures (connection, auth)
        if out.status == 255 {
            return Err(TransportError::Unreachable {
                target: self.target.to_string(),
                status: out.status,
                stderr: out.stderr.trim().to_string(),
            });
        }
        Ok(out)
    }

    /// Tear down the master connection; later commands reconnect on demand
    pub async fn close(&self) -> Result<(), TransportError> {
        let mut cmd = Command::new("ssh");
        cmd.arg("-o")
            .arg(format!("ControlPath={}", self.control_path.display()))
            .arg("-O")
            .arg("exit")
            .arg(self.target.user_at_host());
        collect("ssh", &self.target.to_string(), cmd, None).await?;
        Ok(())
    }
}

#[async_trait]
impl CommandTransport for SshSession {
    fn describe(&self) -> String {
        self.target.to_string()
    }

    async fn run(&self, command: &str) -> Result<CommandOutput, TransportError> {
        self.execute(command, None).await
    }

    async fn run_with_input(
        &self,
        command: &str,
        input: &[u8],
    ) -> Result<CommandOutput, TransportError> {
        self.execute(command, Some(input)).await
    }

    async fn upload_dir(&self, local: &Path, remote_parent: &str) -> Result<(), TransportError> {
        let mkdir = self
            .execute(&format!("mkdir -p {}", shell_path(remote_parent)), None)
            .await?;
        if !mkdir.success() {
            return Err(TransportError::Unreachable {
                target: self.target.to_string(),
                status: mkdir.status,
                stderr: mkdir.stderr.trim().to_string(),
            });
        }

        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| TransportError::Closed {
                target: self.target.to_string(),
            })?;

        debug!("scp {} -> {}:{}", local.display(), self.target, remote_parent);
        let mut cmd = Command::new("scp");
        cmd.args(self.target.scp_base_args(&self.control_path))
            .arg(local)
            .arg(format!("{}:{}/", self.target.user_at_host(), remote_parent));
        let out = collect("scp", &self.target.to_string(), cmd, None).await?;
        if out.success() {
            Ok(())
        } else {
            Err(TransportError::Unreachable {
                target: self.target.to_string(),
                status: out.status,
                stderr: out.stderr.trim().to_string(),
            })
        }
    }
}

/// Shares one `SshSession` per target across every job and filesystem handle
#[derive(Debug, Default)]
pub struct SessionPool {
    sessions: DashMap<SshTarget, Arc<SshSession>>,
    max_concurrent: Option<usize>,
}

impl SessionPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_concurrency(max_concurrent: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            max_concurrent: Some(max_concurrent),
        }
    }

    pub fn session(&self, target: &SshTarget) -> Arc<SshSession> {
        self.sessions
            .entry(target.clone())
            .or_insert_with(|| {
                let max = self.max_concurrent.unwrap_or(SshSession::DEFAULT_MAX_CONCURRENT);
                Arc::new(SshSession::with_concurrency(target.clone(), max))
            })
            .clone()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Close every master connection (best effort)
    pub async fn close_all(&self) {
        let sessions: Vec<_> = self.sessions.iter().map(|e| e.value().clone()).collect();
        for session in sessions {
            if let Err(e) = session.close().await {
                debug!("closing session {} failed: {}", session.target(), e);
            }
        }
        self.sessions.clear();
    }
}
