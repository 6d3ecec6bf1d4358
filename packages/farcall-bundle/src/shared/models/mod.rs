//! Shared models (SSOT for analyzer and builder)

pub mod code_node;
pub mod dependency_graph;
pub mod work_unit;

pub use code_node::{CodeNode, DeclaringScope};
pub use dependency_graph::{
    Binding, BindingValue, Dependency, DependencyEdge, DependencyGraph, EdgeKind, ExternalRef,
    FileRef, FileRefKind, UnresolvedSymbol,
};
pub use work_unit::{Arguments, SourceModule, WorkUnit};
