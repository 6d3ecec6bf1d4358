//! Feature modules
//!
//! - parsing: tree-sitter front end
//! - analysis: dependency closure and closure rewriting
//! - bundling: ordering, rendering, manifest and archive

pub mod analysis;
pub mod bundling;
pub mod parsing;
