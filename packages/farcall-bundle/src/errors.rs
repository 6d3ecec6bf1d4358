//! Error types for dependency analysis and bundle building

use std::path::PathBuf;
use thiserror::Error;

/// The work unit cannot be analyzed as written; the caller has to restructure it
#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("syntax error in module '{module}' at line {line}: {message}")]
    Syntax {
        module: String,
        line: usize,
        message: String,
    },

    #[error("'{entry}' cannot be recovered as source: {reason}")]
    Opaque { entry: String, reason: String },

    #[error("module '{0}' is not part of the work unit")]
    ModuleNotFound(String),

    #[error("unsupported construct in {qualified_name} (line {line}): {construct}")]
    UnsupportedConstruct {
        qualified_name: String,
        line: usize,
        construct: String,
    },

    #[error("import alias '{alias}' is bound to both '{first}' and '{second}'")]
    ImportConflict {
        alias: String,
        first: String,
        second: String,
    },

    #[error("parser initialization failed: {0}")]
    Parser(String),
}

/// Archive container could not be read back
#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("not a farcall archive (bad magic)")]
    BadMagic,

    #[error("unsupported archive format version {0}")]
    UnsupportedVersion(u16),

    #[error("truncated archive: {0}")]
    Truncated(#[from] std::io::Error),

    #[error("invalid archive entry '{0}'")]
    InvalidEntry(String),

    #[error("archive has no manifest")]
    MissingManifest,

    #[error("manifest is not valid JSON: {0}")]
    Manifest(#[from] serde_json::Error),

    #[error("content hash mismatch: manifest says {expected}, contents hash to {actual}")]
    HashMismatch { expected: String, actual: String },
}

/// Bundle building failures
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("dependency cycle could not be flattened into one block: {}", .members.join(", "))]
    CycleUnresolved { members: Vec<String> },

    #[error("rendered symbol '{symbol}' is produced by both {first} and {second}")]
    NameCollision {
        symbol: String,
        first: String,
        second: String,
    },

    #[error("failed to package {}: {source}", .path.display())]
    Packaging {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("data file {} is {size} bytes, limit is {limit}", .path.display())]
    DataFileTooLarge { path: PathBuf, size: u64, limit: u64 },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Archive(#[from] ArchiveError),
}

impl BuildError {
    pub fn packaging(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Packaging {
            path: path.into(),
            source,
        }
    }

    /// I/O while collecting or writing files can succeed on a later attempt
    pub fn is_retryable(&self) -> bool {
        matches!(self, BuildError::Packaging { .. })
    }
}
