/*
 * farcall-bundle - Dependency analysis and bundle building
 *
 * Feature-First Layout:
 * - shared/    : Models (WorkUnit, CodeNode, DependencyGraph)
 * - features/  : parsing → analysis → bundling
 *
 * Pipeline:
 *   WorkUnit ──analyze──▶ DependencyGraph ──build──▶ Artifact
 *
 * The analyzer walks the entry function's references transitively, hoists
 * nested functions to the top level with their captures as leading
 * parameters, and classifies module-level state. The builder orders the
 * closure dependencies-first and seals it into a content-addressed artifact.
 */

#![allow(clippy::too_many_arguments)] // Renderers thread node, scope and source together
#![allow(clippy::module_inception)]

pub mod config;
pub mod errors;
pub mod features;
pub mod shared;

// ═══════════════════════════════════════════════════════════════════════════
// Re-exports
// ═══════════════════════════════════════════════════════════════════════════

pub use config::{AnalyzerConfig, BundleConfig, FILESYSTEM_OPERATIONS};
pub use errors::{AnalysisError, ArchiveError, BuildError};
pub use features::analysis::{is_path_like, DependencyAnalyzer};
pub use features::bundling::{
    Artifact, BundleBuilder, DataFile, Manifest, MaterializedArtifact, SourceUnit,
    MANIFEST_SCHEMA_VERSION,
};
pub use shared::models::{
    Arguments, Binding, BindingValue, CodeNode, DeclaringScope, Dependency, DependencyEdge,
    DependencyGraph, EdgeKind, ExternalRef, FileRef, FileRefKind, SourceModule,
    UnresolvedSymbol, WorkUnit,
};
