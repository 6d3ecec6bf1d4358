//! Infrastructure layer - Filesystem adapters
//!
//! - `local`: tokio::fs + walkdir
//! - `remote`: POSIX commands over a `CommandTransport`

pub mod local;
pub mod pattern;
pub mod remote;

pub use local::LocalFilesystem;
pub use pattern::GlobPattern;
pub use remote::RemoteFilesystem;
