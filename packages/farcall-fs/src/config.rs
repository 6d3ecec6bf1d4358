//! Config-driven dispatch between the local and remote implementations

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::domain::Filesystem;
use crate::infrastructure::{LocalFilesystem, RemoteFilesystem};
use crate::transport::{SessionPool, SshTarget};

/// Selects where filesystem operations run
///
/// ```yaml
/// filesystem:
///   kind: remote
///   host: login.cluster.example
///   user: alice
///   port: 22
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FilesystemConfig {
    #[default]
    Local,
    Remote(SshTarget),
}

/// Build the configured filesystem; remote targets share sessions from `pool`
pub fn from_config(config: &FilesystemConfig, pool: &SessionPool) -> Arc<dyn Filesystem> {
    match config {
        FilesystemConfig::Local => Arc::new(LocalFilesystem::new()),
        FilesystemConfig::Remote(target) => {
            Arc::new(RemoteFilesystem::new(pool.session(target)))
        }
    }
}
