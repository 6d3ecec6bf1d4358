//! Error types for farcall-fs

use std::path::PathBuf;
use thiserror::Error;

/// Failure of the command transport itself (the remote could not be reached
/// or the local helper process could not be spawned).
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{target} unreachable (exit {status}): {stderr}")]
    Unreachable {
        target: String,
        status: i32,
        stderr: String,
    },

    #[error("session for {target} is closed")]
    Closed { target: String },

    #[error("IO error while talking to {target}: {source}")]
    Io {
        target: String,
        #[source]
        source: std::io::Error,
    },
}

/// Filesystem error taxonomy shared by the local and remote implementations
#[derive(Debug, Error)]
pub enum FsError {
    #[error("path not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("permission denied: {}", .0.display())]
    Permission(PathBuf),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("invalid pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("remote command failed on {} (exit {status}): {stderr}", .path.display())]
    Command {
        path: PathBuf,
        status: i32,
        stderr: String,
    },

    /// The remote tools lack a flag this crate relies on
    #[error("unsupported remote tooling for {}: {detail}", .path.display())]
    Unsupported { path: PathBuf, detail: String },

    #[error("unexpected output for {}: {line}", .path.display())]
    Parse { path: PathBuf, line: String },

    #[error("IO error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl FsError {
    /// Map an OS-level error on `path` onto the taxonomy
    pub fn from_io(path: impl Into<PathBuf>, err: std::io::Error) -> Self {
        let path = path.into();
        match err.kind() {
            std::io::ErrorKind::NotFound => FsError::NotFound(path),
            std::io::ErrorKind::PermissionDenied => FsError::Permission(path),
            _ => FsError::Io { path, source: err },
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, FsError::NotFound(_))
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, FsError>;
