//! Analysis feature - dependency closure of a work unit
//!
//! Parsing produces one tree per module; the module index turns the trees
//! into owned tables; the analyzer resolves names and renders nodes.

mod analyzer;
mod builtins;
mod module_index;
mod rewrite;
mod scope;

pub use analyzer::{is_path_like, DependencyAnalyzer};
