//! CodeNode - one function or nested function of the dependency closure

use serde::{Deserialize, Serialize};

/// Where a function was declared
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeclaringScope {
    Module,
    /// Nested inside another function; `parent` is that function's qualified
    /// name (a lookup key into the same graph, never an owning pointer)
    Nested { parent: String },
}

impl DeclaringScope {
    pub fn is_nested(&self) -> bool {
        matches!(self, DeclaringScope::Nested { .. })
    }

    pub fn parent(&self) -> Option<&str> {
        match self {
            DeclaringScope::Module => None,
            DeclaringScope::Nested { parent } => Some(parent),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeNode {
    /// `module.function[.nested...]`, unique within one graph
    pub qualified_name: String,
    pub module: String,
    /// Name the node is defined under at the top level of the bundle
    pub symbol: String,
    pub scope: DeclaringScope,
    /// First line of the definition (decorators included), 1-based
    pub line: usize,
    /// Definition text exactly as written
    pub source: String,
    /// Relocatable top-level definition: captures turned into leading
    /// parameters, call sites and references rewritten
    pub rendered: String,
    /// Captured enclosing-scope names, sorted; these lead the rendered
    /// parameter list
    pub captures: Vec<String>,
    /// Qualified names of the functions this node references
    pub callees: Vec<String>,
    /// Aliases of external imports this node uses
    pub externals: Vec<String>,
    /// Position in analyzer discovery order
    pub discovery_index: usize,
}

impl CodeNode {
    pub fn is_nested(&self) -> bool {
        self.scope.is_nested()
    }

    /// Bare function name (last path segment)
    pub fn name(&self) -> &str {
        self.qualified_name
            .rsplit('.')
            .next()
            .unwrap_or(&self.qualified_name)
    }
}
