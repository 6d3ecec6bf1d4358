//! Local filesystem implementation (tokio::fs + walkdir)

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fs::Metadata;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use super::pattern::GlobPattern;
use crate::domain::{DirEntry, FileStat, Filesystem, FilesystemKind, UsageSummary};
use crate::{FsError, Result};

/// Filesystem rooted at the machine the process runs on
#[derive(Debug, Clone, Default)]
pub struct LocalFilesystem;

impl LocalFilesystem {
    pub fn new() -> Self {
        Self
    }
}

#[cfg(unix)]
fn permission_bits(meta: &Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn permission_bits(meta: &Metadata) -> u32 {
    if meta.permissions().readonly() {
        0o444
    } else {
        0o644
    }
}

fn to_stat(path: &Path, meta: &Metadata) -> Result<FileStat> {
    let modified = meta
        .modified()
        .map_err(|e| FsError::from_io(path, e))?;
    Ok(FileStat {
        path: path.to_path_buf(),
        size: meta.len(),
        modified: DateTime::<Utc>::from(modified),
        permissions: permission_bits(meta),
        is_dir: meta.is_dir(),
    })
}

fn walk_error(root: &Path, err: walkdir::Error) -> FsError {
    let path = err.path().map(Path::to_path_buf).unwrap_or_else(|| root.to_path_buf());
    match err.into_io_error() {
        Some(io) => FsError::from_io(path, io),
        None => FsError::Io {
            path,
            source: std::io::Error::new(std::io::ErrorKind::Other, "filesystem loop detected"),
        },
    }
}

/// Relative `/`-separated path of `path` below `root`
fn relative(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Run a walkdir traversal off the async runtime
async fn walk_blocking<T, F>(root: &Path, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(PathBuf) -> Result<T> + Send + 'static,
{
    let root = root.to_path_buf();
    let task_root = root.clone();
    tokio::task::spawn_blocking(move || f(task_root))
        .await
        .map_err(|e| FsError::Io {
            path: root,
            source: std::io::Error::new(std::io::ErrorKind::Other, e.to_string()),
        })?
}

#[async_trait]
impl Filesystem for LocalFilesystem {
    fn kind(&self) -> FilesystemKind {
        FilesystemKind::Local
    }

    async fn list(&self, path: &Path) -> Result<Vec<DirEntry>> {
        let mut dir = tokio::fs::read_dir(path)
            .await
            .map_err(|e| FsError::from_io(path, e))?;

        let mut entries = Vec::new();
        while let Some(entry) = dir.next_entry().await.map_err(|e| FsError::from_io(path, e))? {
            let meta = entry
                .metadata()
                .await
                .map_err(|e| FsError::from_io(entry.path(), e))?;
            entries.push(DirEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                path: entry.path(),
                is_dir: meta.is_dir(),
                size: meta.len(),
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    async fn find(&self, root: &Path, pattern: &str) -> Result<Vec<PathBuf>> {
        let glob = GlobPattern::new(pattern)?;
        tokio::fs::metadata(root)
            .await
            .map_err(|e| FsError::from_io(root, e))?;

        walk_blocking(root, move |root| {
            let mut found = Vec::new();
            for entry in WalkDir::new(&root).min_depth(1).sort_by_file_name() {
                let entry = entry.map_err(|e| walk_error(&root, e))?;
                if glob.matches(&relative(&root, entry.path())) {
                    found.push(entry.path().to_path_buf());
                }
            }
            found.sort();
            Ok(found)
        })
        .await
    }

    async fn stat(&self, path: &Path) -> Result<FileStat> {
        let meta = tokio::fs::metadata(path)
            .await
            .map_err(|e| FsError::from_io(path, e))?;
        to_stat(path, &meta)
    }

    async fn exists(&self, path: &Path) -> Result<bool> {
        match tokio::fs::metadata(path).await {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(FsError::from_io(path, e)),
        }
    }

    async fn disk_usage(&self, path: &Path) -> Result<UsageSummary> {
        let meta = tokio::fs::metadata(path)
            .await
            .map_err(|e| FsError::from_io(path, e))?;
        if !meta.is_dir() {
            return Ok(UsageSummary {
                total_bytes: meta.len(),
                files: 1,
                directories: 0,
            });
        }

        walk_blocking(path, |root| {
            let mut usage = UsageSummary::default();
            for entry in WalkDir::new(&root).min_depth(1) {
                let entry = entry.map_err(|e| walk_error(&root, e))?;
                let meta = entry.metadata().map_err(|e| walk_error(&root, e))?;
                if meta.is_dir() {
                    usage.directories += 1;
                } else {
                    usage.files += 1;
                    usage.total_bytes += meta.len();
                }
            }
            Ok(usage)
        })
        .await
    }

    async fn count_files(&self, path: &Path, pattern: Option<&str>) -> Result<u64> {
        let glob = pattern.map(GlobPattern::new).transpose()?;
        tokio::fs::metadata(path)
            .await
            .map_err(|e| FsError::from_io(path, e))?;

        walk_blocking(path, move |root| {
            let mut count = 0u64;
            for entry in WalkDir::new(&root).min_depth(1) {
                let entry = entry.map_err(|e| walk_error(&root, e))?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let selected = glob
                    .as_ref()
                    .map_or(true, |g| g.matches(&relative(&root, entry.path())));
                if selected {
                    count += 1;
                }
            }
            Ok(count)
        })
        .await
    }
}
