//! DependencyGraph - the closure of one work unit
//!
//! Directed graph where:
//! - Nodes are `CodeNode`s (functions and nested functions)
//! - `Calls` edges: A → B means A references B
//! - `Captures` edges: nested A → enclosing B means A reads B's locals
//!
//! Two auxiliary sets travel with it: external references (imports resolved
//! outside the closure) and file references (paths the code touches). The graph
//! may contain cycles (mutual recursion); they are reported by `cycles()` and
//! flattened into single blocks by the bundle builder.

use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;

use super::code_node::CodeNode;
use super::work_unit::Arguments;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    Calls,
    Captures,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyEdge {
    pub from: String,
    pub to: String,
    pub kind: EdgeKind,
    /// Target was still on the analysis path when this edge was found
    pub circular: bool,
}

/// Name resolved to code outside the closure (a third-party or stdlib import)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExternalRef {
    /// Name the code uses (`np`)
    pub alias: String,
    /// Imported module (`numpy`, `os.path`)
    pub module: String,
    /// Imported member for `from module import symbol`
    pub symbol: Option<String>,
}

impl ExternalRef {
    /// The import statement that binds `alias`
    pub fn import_statement(&self) -> String {
        match &self.symbol {
            Some(symbol) if *symbol == self.alias => {
                format!("from {} import {}", self.module, symbol)
            }
            Some(symbol) => format!("from {} import {} as {}", self.module, symbol, self.alias),
            None if self.module == self.alias
                || self.module.starts_with(&format!("{}.", self.alias)) =>
            {
                format!("import {}", self.module)
            }
            None => format!("import {} as {}", self.module, self.alias),
        }
    }

    /// `module` or `module.symbol`, used for conflict messages
    pub fn target(&self) -> String {
        match &self.symbol {
            Some(symbol) => format!("{}.{}", self.module, symbol),
            None => self.module.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileRefKind {
    List,
    Find,
    Stat,
    Exists,
    DiskUsage,
    CountFiles,
    /// Builtin `open(...)`
    Open,
    /// Path-shaped string literal
    Literal,
}

impl FileRefKind {
    /// Filesystem-abstraction operation for a method name
    pub fn from_operation(name: &str) -> Option<Self> {
        match name {
            "list" => Some(FileRefKind::List),
            "find" => Some(FileRefKind::Find),
            "stat" => Some(FileRefKind::Stat),
            "exists" => Some(FileRefKind::Exists),
            "disk_usage" => Some(FileRefKind::DiskUsage),
            "count_files" => Some(FileRefKind::CountFiles),
            _ => None,
        }
    }

    pub fn is_filesystem_operation(&self) -> bool {
        !matches!(self, FileRefKind::Open | FileRefKind::Literal)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FileRef {
    pub kind: FileRefKind,
    /// Literal path argument, when there is one
    pub path: Option<String>,
    pub line: usize,
    pub qualified_name: String,
}

/// Module-level state a node needs at run time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BindingValue {
    /// Serializable value, shipped in the manifest's captured state
    Data { value: Value },
    /// Statement re-executed in the bundle. `late` statements reference
    /// closure functions and are emitted after all code blocks.
    Source { text: String, late: bool },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Binding {
    /// Name defined at the top level of the bundle
    pub name: String,
    /// Further names bound by the same statement (`a, b = ...`)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_names: Vec<String>,
    pub module: String,
    pub value: BindingValue,
}

impl Binding {
    pub fn names(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.name.as_str()).chain(self.extra_names.iter().map(String::as_str))
    }

    pub fn is_late(&self) -> bool {
        matches!(self.value, BindingValue::Source { late: true, .. })
    }
}

/// Free name that matched nothing; left for the remote environment
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UnresolvedSymbol {
    pub name: String,
    pub referenced_from: String,
    pub line: usize,
}

/// One explicit dependency of a node
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dependency {
    Code(String),
    External(ExternalRef),
    File(FileRef),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DependencyGraph {
    /// Qualified name of the entry function
    pub entry: String,
    /// Nodes in discovery order
    pub nodes: Vec<CodeNode>,
    pub edges: Vec<DependencyEdge>,
    /// Sorted by alias
    pub externals: Vec<ExternalRef>,
    /// Dependencies before dependents
    pub bindings: Vec<Binding>,
    pub file_refs: Vec<FileRef>,
    pub unresolved: Vec<UnresolvedSymbol>,
    /// Filesystem aliases the code actually uses
    pub filesystem_aliases: Vec<String>,
    /// Local modules importing each other (strongly connected components)
    pub module_cycles: Vec<Vec<String>>,
    pub arguments: Arguments,
    pub data_files: Vec<PathBuf>,
}

impl DependencyGraph {
    pub fn node(&self, qualified_name: &str) -> Option<&CodeNode> {
        self.nodes.iter().find(|n| n.qualified_name == qualified_name)
    }

    pub fn entry_node(&self) -> Option<&CodeNode> {
        self.node(&self.entry)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Whether the bundle needs the filesystem abstraction wired in
    pub fn needs_filesystem(&self) -> bool {
        self.file_refs
            .iter()
            .any(|r| r.kind.is_filesystem_operation())
    }

    /// Call graph over node indices (`Calls` edges only)
    pub fn call_graph(&self) -> (DiGraph<usize, ()>, HashMap<&str, NodeIndex>) {
        let mut graph = DiGraph::new();
        let mut index = HashMap::new();
        for (i, node) in self.nodes.iter().enumerate() {
            let idx = graph.add_node(i);
            index.insert(node.qualified_name.as_str(), idx);
        }
        for edge in self.edges.iter().filter(|e| e.kind == EdgeKind::Calls) {
            if let (Some(&from), Some(&to)) = (index.get(edge.from.as_str()), index.get(edge.to.as_str())) {
                graph.add_edge(from, to, ());
            }
        }
        (graph, index)
    }

    /// Mutually dependent node groups (SCCs with more than one member, plus
    /// self-recursive nodes), each sorted by discovery order
    pub fn cycles(&self) -> Vec<Vec<String>> {
        let (graph, _) = self.call_graph();
        let mut cycles: Vec<Vec<usize>> = tarjan_scc(&graph)
            .into_iter()
            .filter(|scc| scc.len() > 1 || graph.contains_edge(scc[0], scc[0]))
            .map(|scc| {
                let mut members: Vec<usize> = scc.into_iter().map(|idx| graph[idx]).collect();
                members.sort_unstable();
                members
            })
            .collect();
        cycles.sort();
        cycles
            .into_iter()
            .map(|c| c.into_iter().map(|i| self.nodes[i].qualified_name.clone()).collect())
            .collect()
    }

    /// Explicit dependency list of one node
    pub fn dependencies(&self, qualified_name: &str) -> Vec<Dependency> {
        let Some(node) = self.node(qualified_name) else {
            return Vec::new();
        };
        let mut deps: Vec<Dependency> = node
            .callees
            .iter()
            .map(|c| Dependency::Code(c.clone()))
            .collect();
        deps.extend(
            node.externals
                .iter()
                .filter_map(|alias| self.externals.iter().find(|e| &e.alias == alias))
                .map(|e| Dependency::External(e.clone())),
        );
        deps.extend(
            self.file_refs
                .iter()
                .filter(|r| r.qualified_name == qualified_name)
                .map(|r| Dependency::File(r.clone())),
        );
        deps
    }

    /// Serializable captured state (`Data` bindings)
    pub fn captured_state(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.bindings.iter().filter_map(|b| match &b.value {
            BindingValue::Data { value } => Some((b.name.as_str(), value)),
            BindingValue::Source { .. } => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::models::DeclaringScope;

    fn node(qn: &str, index: usize, callees: &[&str]) -> CodeNode {
        CodeNode {
            qualified_name: qn.to_string(),
            module: "m".to_string(),
            symbol: qn.trim_start_matches("m.").to_string(),
            scope: DeclaringScope::Module,
            line: 1,
            source: String::new(),
            rendered: String::new(),
            captures: Vec::new(),
            callees: callees.iter().map(|c| c.to_string()).collect(),
            externals: Vec::new(),
            discovery_index: index,
        }
    }

    fn graph(nodes: Vec<CodeNode>) -> DependencyGraph {
        let edges = nodes
            .iter()
            .flat_map(|n| {
                n.callees.iter().map(move |c| DependencyEdge {
                    from: n.qualified_name.clone(),
                    to: c.clone(),
                    kind: EdgeKind::Calls,
                    circular: false,
                })
            })
            .collect();
        DependencyGraph {
            entry: nodes[0].qualified_name.clone(),
            nodes,
            edges,
            externals: Vec::new(),
            bindings: Vec::new(),
            file_refs: Vec::new(),
            unresolved: Vec::new(),
            filesystem_aliases: Vec::new(),
            module_cycles: Vec::new(),
            arguments: Arguments::default(),
            data_files: Vec::new(),
        }
    }

    #[test]
    fn test_two_cycle_is_reported() {
        let g = graph(vec![
            node("m.main", 0, &["m.a"]),
            node("m.a", 1, &["m.b"]),
            node("m.b", 2, &["m.a"]),
        ]);
        assert_eq!(g.cycles(), vec![vec!["m.a".to_string(), "m.b".to_string()]]);
    }

    #[test]
    fn test_self_recursion_is_a_cycle() {
        let g = graph(vec![node("m.fact", 0, &["m.fact"])]);
        assert_eq!(g.cycles(), vec![vec!["m.fact".to_string()]]);
    }

    #[test]
    fn test_acyclic_graph_has_no_cycles() {
        let g = graph(vec![node("m.f", 0, &["m.g"]), node("m.g", 1, &[])]);
        assert!(g.cycles().is_empty());
        assert_eq!(g.entry_node().unwrap().qualified_name, "m.f");
    }

    #[test]
    fn test_import_statements() {
        let np = ExternalRef {
            alias: "np".to_string(),
            module: "numpy".to_string(),
            symbol: None,
        };
        assert_eq!(np.import_statement(), "import numpy as np");

        let os_path = ExternalRef {
            alias: "os".to_string(),
            module: "os.path".to_string(),
            symbol: None,
        };
        assert_eq!(os_path.import_statement(), "import os.path");

        let join = ExternalRef {
            alias: "join".to_string(),
            module: "os.path".to_string(),
            symbol: Some("join".to_string()),
        };
        assert_eq!(join.import_statement(), "from os.path import join");

        let pjoin = ExternalRef {
            alias: "pjoin".to_string(),
            module: "os.path".to_string(),
            symbol: Some("join".to_string()),
        };
        assert_eq!(pjoin.import_statement(), "from os.path import join as pjoin");
    }

    #[test]
    fn test_dependencies_are_tagged() {
        let mut g = graph(vec![node("m.f", 0, &["m.g"]), node("m.g", 1, &[])]);
        g.nodes[0].externals.push("np".to_string());
        g.externals.push(ExternalRef {
            alias: "np".to_string(),
            module: "numpy".to_string(),
            symbol: None,
        });
        g.file_refs.push(FileRef {
            kind: FileRefKind::Find,
            path: Some("/data".to_string()),
            line: 3,
            qualified_name: "m.f".to_string(),
        });

        let deps = g.dependencies("m.f");
        assert_eq!(deps.len(), 3);
        assert_eq!(deps[0], Dependency::Code("m.g".to_string()));
        assert!(matches!(deps[1], Dependency::External(_)));
        assert!(matches!(deps[2], Dependency::File(_)));
        assert!(g.needs_filesystem());
    }
}
