//! Domain layer for the filesystem abstraction
//!
//! # Domain Models
//!
//! - `DirEntry`: one child of a listed directory
//! - `FileStat`: size / modified time / permission bits / directory flag
//! - `UsageSummary`: aggregated directory usage
//!
//! # Port Trait
//!
//! - `Filesystem`: identical operations for the local machine and remote hosts.
//!   Call sites hold an `Arc<dyn Filesystem>` built from configuration and never
//!   branch on where the files live.
//!
//! # Pattern matching
//!
//! `find` and `count_files` take glob patterns: `*` and `?` never cross a `/`,
//! `**` spans directories. A pattern without `/` is matched against the file
//! name only; a pattern with `/` is matched against the path relative to the
//! search root.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::Result;

// ═══════════════════════════════════════════════════════════════════════════
// Domain Models
// ═══════════════════════════════════════════════════════════════════════════

/// One entry of a directory listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    pub name: String,
    pub path: PathBuf,
    pub is_dir: bool,
    pub size: u64,
}

/// File metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStat {
    pub path: PathBuf,
    pub size: u64,
    pub modified: DateTime<Utc>,
    /// Permission bits (e.g. `0o644`)
    pub permissions: u32,
    pub is_dir: bool,
}

impl FileStat {
    /// Permission bits rendered the way `ls`/`stat` print them (`"755"`)
    pub fn mode_string(&self) -> String {
        format!("{:o}", self.permissions)
    }
}

/// Aggregated usage below a directory (the root itself is not counted)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageSummary {
    pub total_bytes: u64,
    pub files: u64,
    pub directories: u64,
}

/// Which implementation serves a `Filesystem`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilesystemKind {
    Local,
    Remote,
}

impl FilesystemKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FilesystemKind::Local => "local",
            FilesystemKind::Remote => "remote",
        }
    }
}

impl std::fmt::Display for FilesystemKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Port Trait
// ═══════════════════════════════════════════════════════════════════════════

/// Uniform file operations, local or remote
///
/// # Errors
///
/// - `FsError::NotFound` when the path does not exist
/// - `FsError::Permission` when the OS denies access
/// - `FsError::Transport` when a remote target cannot be reached
#[async_trait]
pub trait Filesystem: Send + Sync {
    fn kind(&self) -> FilesystemKind;

    /// Direct children of `path`, sorted by name
    async fn list(&self, path: &Path) -> Result<Vec<DirEntry>>;

    /// Recursive search below `root`; returns matching paths (files and
    /// directories) sorted, each joined onto `root`
    async fn find(&self, root: &Path, pattern: &str) -> Result<Vec<PathBuf>>;

    async fn stat(&self, path: &Path) -> Result<FileStat>;

    /// `Ok(false)` for a missing path; only transport failures are errors
    async fn exists(&self, path: &Path) -> Result<bool>;

    async fn disk_usage(&self, path: &Path) -> Result<UsageSummary>;

    /// Number of regular files below `path`, optionally filtered by pattern
    async fn count_files(&self, path: &Path, pattern: Option<&str>) -> Result<u64>;
}
