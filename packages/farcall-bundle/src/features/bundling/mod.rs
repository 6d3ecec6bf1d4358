//! Bundling: block ordering, source rendering, manifest, archive

pub mod archive;
pub mod artifact;
mod builder;
pub mod manifest;
mod ordering;
pub mod templates;

pub use artifact::{Artifact, DataFile, MaterializedArtifact, SourceUnit};
pub use builder::BundleBuilder;
pub use manifest::{Manifest, MANIFEST_SCHEMA_VERSION};
pub use ordering::order_blocks;
