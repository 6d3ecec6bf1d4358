//! Remote filesystem implementation over a `CommandTransport`
//!
//! Every operation is one POSIX command (`find`, `stat`, `test`) run on the
//! target; listings come back as tab-separated records and pattern filtering
//! happens locally with the same matcher as the local implementation.
//!
//! The target needs GNU findutils and coreutils: listings use `find -printf`
//! and stats use `stat -c`. The BSD variants (macOS, FreeBSD) reject both
//! flags, which surfaces as [`FsError::Unsupported`].

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::pattern::GlobPattern;
use crate::domain::{DirEntry, FileStat, Filesystem, FilesystemKind, UsageSummary};
use crate::transport::{shell_path, CommandOutput, CommandTransport};
use crate::{FsError, Result};

/// Filesystem of a remote host
pub struct RemoteFilesystem {
    transport: Arc<dyn CommandTransport>,
}

/// One record of a `find -printf '%y\t%s\t%P\n'` walk
#[derive(Debug, Clone, PartialEq, Eq)]
struct WalkRecord {
    is_dir: bool,
    size: u64,
    relative: String,
}

impl RemoteFilesystem {
    pub fn new(transport: Arc<dyn CommandTransport>) -> Self {
        Self { transport }
    }

    pub fn target(&self) -> String {
        self.transport.describe()
    }

    async fn run(&self, path: &Path, command: &str) -> Result<CommandOutput> {
        let out = self.transport.run(command).await?;
        if out.success() {
            Ok(out)
        } else {
            Err(classify_failure(path, &out))
        }
    }

    async fn walk(&self, root: &Path, max_depth: Option<u32>) -> Result<Vec<WalkRecord>> {
        let depth = max_depth
            .map(|d| format!(" -maxdepth {}", d))
            .unwrap_or_default();
        let command = format!(
            "find {}{} -mindepth 1 -printf '%y\\t%s\\t%P\\n'",
            shell_path(&root.to_string_lossy()),
            depth
        );
        let out = self.run(root, &command).await?;
        out.stdout
            .lines()
            .filter(|l| !l.is_empty())
            .map(|l| parse_walk_line(root, l))
            .collect()
    }
}

/// BSD and busybox complaints about the GNU-only flags
const NON_GNU_MARKERS: &[&str] = &[
    "-printf: unknown primary",
    "unrecognized: -printf",
    "illegal option -- c",
];

/// Map stderr of a failed command onto the error taxonomy
fn classify_failure(path: &Path, out: &CommandOutput) -> FsError {
    if NON_GNU_MARKERS.iter().any(|m| out.stderr.contains(m)) {
        FsError::Unsupported {
            path: path.to_path_buf(),
            detail: format!(
                "remote host needs GNU find and stat ({})",
                out.stderr.trim()
            ),
        }
    } else if out.stderr.contains("No such file or directory") {
        FsError::NotFound(path.to_path_buf())
    } else if out.stderr.contains("Permission denied") {
        FsError::Permission(path.to_path_buf())
    } else {
        FsError::Command {
            path: path.to_path_buf(),
            status: out.status,
            stderr: out.stderr.trim().to_string(),
        }
    }
}

fn parse_walk_line(root: &Path, line: &str) -> Result<WalkRecord> {
    let mut parts = line.splitn(3, '\t');
    let (Some(kind), Some(size), Some(relative)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(FsError::Parse {
            path: root.to_path_buf(),
            line: line.to_string(),
        });
    };
    let size = size.parse::<u64>().map_err(|_| FsError::Parse {
        path: root.to_path_buf(),
        line: line.to_string(),
    })?;
    Ok(WalkRecord {
        is_dir: kind == "d",
        size,
        relative: relative.to_string(),
    })
}

/// Parse `stat -c '%s|%Y|%a|%F'`
fn parse_stat_line(path: &Path, line: &str) -> Result<FileStat> {
    let bad = || FsError::Parse {
        path: path.to_path_buf(),
        line: line.to_string(),
    };
    let fields: Vec<&str> = line.trim().splitn(4, '|').collect();
    if fields.len() != 4 {
        return Err(bad());
    }
    let size = fields[0].parse::<u64>().map_err(|_| bad())?;
    let epoch = fields[1].parse::<i64>().map_err(|_| bad())?;
    let permissions = u32::from_str_radix(fields[2], 8).map_err(|_| bad())?;
    let modified: DateTime<Utc> = Utc.timestamp_opt(epoch, 0).single().ok_or_else(bad)?;
    Ok(FileStat {
        path: path.to_path_buf(),
        size,
        modified,
        permissions,
        is_dir: fields[3] == "directory",
    })
}

#[async_trait]
impl Filesystem for RemoteFilesystem {
    fn kind(&self) -> FilesystemKind {
        FilesystemKind::Remote
    }

    async fn list(&self, path: &Path) -> Result<Vec<DirEntry>> {
        let mut entries: Vec<DirEntry> = self
            .walk(path, Some(1))
            .await?
            .into_iter()
            .map(|r| DirEntry {
                path: path.join(&r.relative),
                name: r.relative,
                is_dir: r.is_dir,
                size: r.size,
            })
            .collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    async fn find(&self, root: &Path, pattern: &str) -> Result<Vec<PathBuf>> {
        let glob = GlobPattern::new(pattern)?;
        let mut found: Vec<PathBuf> = self
            .walk(root, None)
            .await?
            .into_iter()
            .filter(|r| glob.matches(&r.relative))
            .map(|r| root.join(r.relative))
            .collect();
        found.sort();
        Ok(found)
    }

    async fn stat(&self, path: &Path) -> Result<FileStat> {
        let command = format!(
            "stat -c '%s|%Y|%a|%F' {}",
            shell_path(&path.to_string_lossy())
        );
        let out = self.run(path, &command).await?;
        let line = out.first_line().ok_or_else(|| FsError::Parse {
            path: path.to_path_buf(),
            line: String::new(),
        })?;
        parse_stat_line(path, line)
    }

    async fn exists(&self, path: &Path) -> Result<bool> {
        let command = format!(
            "if [ -e {} ]; then echo yes; else echo no; fi",
            shell_path(&path.to_string_lossy())
        );
        let out = self.run(path, &command).await?;
        Ok(out.first_line() == Some("yes"))
    }

    async fn disk_usage(&self, path: &Path) -> Result<UsageSummary> {
        let stat = self.stat(path).await?;
        if !stat.is_dir {
            return Ok(UsageSummary {
                total_bytes: stat.size,
                files: 1,
                directories: 0,
            });
        }
        let mut usage = UsageSummary::default();
        for record in self.walk(path, None).await? {
            if record.is_dir {
                usage.directories += 1;
            } else {
                usage.files += 1;
                usage.total_bytes += record.size;
            }
        }
        Ok(usage)
    }

    async fn count_files(&self, path: &Path, pattern: Option<&str>) -> Result<u64> {
        let glob = pattern.map(GlobPattern::new).transpose()?;
        let count = self
            .walk(path, None)
            .await?
            .iter()
            .filter(|r| !r.is_dir)
            .filter(|r| glob.as_ref().map_or(true, |g| g.matches(&r.relative)))
            .count();
        Ok(count as u64)
    }
}
