//! farcall-fs - Uniform local/remote file operations
//!
//! Work-unit code and the orchestrator call the same `Filesystem` operations
//! (list, find, stat, exists, disk usage, file counting) whether the configured
//! target is the local machine or a remote host. The `transport` module holds
//! the command transport (local shell or a multiplexed SSH session) that the
//! remote implementation and the backend adapters share.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use farcall_fs::{from_config, FilesystemConfig, SessionPool};
//!
//! let pool = SessionPool::new();
//! let fs = from_config(&FilesystemConfig::Local, &pool);
//! let csvs = fs.find(Path::new("/data"), "**/*.csv").await?;
//! ```

pub mod config;
pub mod domain;
pub mod error;
pub mod infrastructure;
pub mod transport;

pub use config::{from_config, FilesystemConfig};
pub use domain::{DirEntry, FileStat, Filesystem, FilesystemKind, UsageSummary};
pub use error::{FsError, Result, TransportError};
pub use infrastructure::{GlobPattern, LocalFilesystem, RemoteFilesystem};
pub use transport::{
    shell_path, shell_quote, CommandOutput, CommandTransport, LocalShell, SessionPool, SshSession,
    SshTarget,
};
