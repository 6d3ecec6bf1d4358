//! BundleBuilder - dependency graph in, sealed artifact out
//!
//! Unit layout of every bundle:
//! 1. `preamble`: manifest loading, captured state, external imports,
//!    the filesystem shim when used, module-level statements
//! 2. one unit per code block, dependencies first
//! 3. `late_globals`: statements that refer to closure functions
//! 4. `bootstrap`: entry-point call and result protocol

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Instant;
use tracing::{debug, info};

use super::artifact::{Artifact, DataFile, SourceUnit};
use super::manifest::Manifest;
use super::ordering::order_blocks;
use super::templates;
use crate::config::BundleConfig;
use crate::errors::BuildError;
use crate::shared::models::{BindingValue, DependencyGraph};

#[derive(Debug, Clone, Default)]
pub struct BundleBuilder {
    config: BundleConfig,
}

impl BundleBuilder {
    pub fn new(config: BundleConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &BundleConfig {
        &self.config
    }

    pub fn build(&self, graph: &DependencyGraph) -> Result<Artifact, BuildError> {
        let started = Instant::now();

        check_collisions(graph)?;
        let entry_point = graph
            .entry_node()
            .map(|n| n.symbol.clone())
            .unwrap_or_else(|| graph.entry.clone());

        let blocks = order_blocks(graph)?;
        let data_files = self.collect_data_files(graph)?;

        let mut units = Vec::with_capacity(blocks.len() + 3);
        units.push(SourceUnit::new("preamble", render_preamble(graph)));
        for block in &blocks {
            units.push(SourceUnit::new(block_name(graph, block), render_block(graph, block)));
        }
        if let Some(late) = render_late_globals(graph) {
            units.push(SourceUnit::new("late_globals", late));
        }
        units.push(SourceUnit::new("bootstrap", templates::BOOTSTRAP));

        let manifest = Manifest::describe(
            graph,
            &entry_point,
            &blocks,
            data_files.iter().map(|f| f.name.clone()).collect(),
        );
        let artifact = Artifact::seal(manifest, units, data_files)?;

        info!(
            "Built artifact {} for {}: {} blocks, {} units, {} data files in {:?}",
            &artifact.id()[..12],
            graph.entry,
            blocks.len(),
            artifact.units().len(),
            artifact.data_files().len(),
            started.elapsed()
        );
        Ok(artifact)
    }

    fn collect_data_files(&self, graph: &DependencyGraph) -> Result<Vec<DataFile>, BuildError> {
        let mut seen: HashMap<String, &Path> = HashMap::new();
        let mut files = Vec::with_capacity(graph.data_files.len());

        for path in &graph.data_files {
            let meta = fs::metadata(path).map_err(|e| BuildError::packaging(path, e))?;
            if meta.len() > self.config.max_data_file_bytes {
                return Err(BuildError::DataFileTooLarge {
                    path: path.clone(),
                    size: meta.len(),
                    limit: self.config.max_data_file_bytes,
                });
            }

            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .ok_or_else(|| {
                    BuildError::packaging(
                        path,
                        std::io::Error::new(std::io::ErrorKind::InvalidInput, "no file name"),
                    )
                })?;
            if let Some(first) = seen.insert(name.clone(), path.as_path()) {
                return Err(BuildError::NameCollision {
                    symbol: format!("data/{}", name),
                    first: first.display().to_string(),
                    second: path.display().to_string(),
                });
            }

            let bytes = fs::read(path).map_err(|e| BuildError::packaging(path, e))?;
            debug!("Packaged data file {} ({} bytes)", name, bytes.len());
            files.push(DataFile { name, bytes });
        }
        Ok(files)
    }
}

/// Every top-level name the bundle defines must come from exactly one place
fn check_collisions(graph: &DependencyGraph) -> Result<(), BuildError> {
    let mut owners: HashMap<String, String> = HashMap::new();
    let mut claim = |symbol: &str, owner: String| -> Result<(), BuildError> {
        match owners.get(symbol) {
            Some(first) => Err(BuildError::NameCollision {
                symbol: symbol.to_string(),
                first: first.clone(),
                second: owner,
            }),
            None => {
                owners.insert(symbol.to_string(), owner);
                Ok(())
            }
        }
    };

    for node in &graph.nodes {
        claim(&node.symbol, format!("function {}", node.qualified_name))?;
    }
    for external in &graph.externals {
        claim(&external.alias, format!("import of {}", external.target()))?;
    }
    for alias in &graph.filesystem_aliases {
        claim(alias, "the filesystem shim".to_string())?;
    }
    for binding in &graph.bindings {
        for name in binding.names() {
            claim(name, format!("module-level name {}.{}", binding.module, name))?;
        }
    }
    Ok(())
}

fn block_name(graph: &DependencyGraph, block: &[usize]) -> String {
    let first = block
        .first()
        .map(|&i| graph.nodes[i].symbol.as_str())
        .unwrap_or("block");
    if block.len() > 1 {
        format!("cycle_{}", first)
    } else {
        first.to_string()
    }
}

fn render_preamble(graph: &DependencyGraph) -> String {
    let mut out = String::from(templates::PREAMBLE_HEADER);

    if !graph.externals.is_empty() {
        out.push('\n');
        for external in &graph.externals {
            out.push_str(&external.import_statement());
            out.push('\n');
        }
    }

    if !graph.filesystem_aliases.is_empty() {
        out.push_str("\n\n");
        out.push_str(templates::FILESYSTEM_SHIM);
        out.push_str("\n\n");
        for alias in &graph.filesystem_aliases {
            out.push_str(&format!("{} = _FarcallFs()\n", alias));
        }
    }

    let early: Vec<&str> = graph
        .bindings
        .iter()
        .filter_map(|b| match &b.value {
            BindingValue::Source { text, late: false } => Some(text.as_str()),
            _ => None,
        })
        .collect();
    if !early.is_empty() {
        out.push('\n');
        for text in early {
            out.push_str(text.trim_end());
            out.push('\n');
        }
    }
    out
}

fn render_block(graph: &DependencyGraph, block: &[usize]) -> String {
    block
        .iter()
        .map(|&i| {
            let node = &graph.nodes[i];
            format!("# {}\n{}\n", node.qualified_name, node.rendered.trim_end())
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn render_late_globals(graph: &DependencyGraph) -> Option<String> {
    let late: Vec<&str> = graph
        .bindings
        .iter()
        .filter_map(|b| match &b.value {
            BindingValue::Source { text, late: true } => Some(text.trim_end()),
            _ => None,
        })
        .collect();
    if late.is_empty() {
        return None;
    }
    Some(late.join("\n") + "\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::models::{
        Arguments, Binding, CodeNode, DeclaringScope, DependencyEdge, EdgeKind, ExternalRef,
    };
    use serde_json::json;

    fn node(qn: &str, symbol: &str, index: usize, rendered: &str) -> CodeNode {
        CodeNode {
            qualified_name: qn.to_string(),
            module: "main".to_string(),
            symbol: symbol.to_string(),
            scope: DeclaringScope::Module,
            line: 1,
            source: rendered.to_string(),
            rendered: rendered.to_string(),
            captures: Vec::new(),
            callees: Vec::new(),
            externals: Vec::new(),
            discovery_index: index,
        }
    }

    fn graph() -> DependencyGraph {
        DependencyGraph {
            entry: "main.f".to_string(),
            nodes: vec![
                node("main.f", "f", 0, "def f(x):\n    return g(x)"),
                node("main.g", "g", 1, "def g(x):\n    return x + y"),
            ],
            edges: vec![DependencyEdge {
                from: "main.f".to_string(),
                to: "main.g".to_string(),
                kind: EdgeKind::Calls,
                circular: false,
            }],
            externals: vec![ExternalRef {
                alias: "np".to_string(),
                module: "numpy".to_string(),
                symbol: None,
            }],
            bindings: vec![Binding {
                name: "y".to_string(),
                extra_names: Vec::new(),
                module: "main".to_string(),
                value: BindingValue::Data { value: json!(10) },
            }],
            file_refs: Vec::new(),
            unresolved: Vec::new(),
            filesystem_aliases: Vec::new(),
            module_cycles: Vec::new(),
            arguments: Arguments {
                args: vec![json!(5)],
                kwargs: Default::default(),
            },
            data_files: Vec::new(),
        }
    }

    #[test]
    fn test_unit_layout() {
        let artifact = BundleBuilder::default().build(&graph()).unwrap();
        let names: Vec<&str> = artifact.units().iter().map(|u| u.name.as_str()).collect();
        assert_eq!(names, vec!["preamble", "g", "f", "bootstrap"]);
        assert!(artifact.units()[0].source.contains("import numpy as np\n"));
        assert!(!artifact.units()[0].source.contains("class _FarcallFs"));
        assert_eq!(artifact.manifest().entry_point, "f");
        assert_eq!(artifact.manifest().captured_state["y"], json!(10));
        assert_eq!(artifact.manifest().external_modules, vec!["numpy".to_string()]);
    }

    #[test]
    fn test_late_globals_follow_blocks() {
        let mut g = graph();
        g.bindings.push(Binding {
            name: "HANDLERS".to_string(),
            extra_names: Vec::new(),
            module: "main".to_string(),
            value: BindingValue::Source {
                text: "HANDLERS = {'g': g}".to_string(),
                late: true,
            },
        });
        let artifact = BundleBuilder::default().build(&g).unwrap();
        let source = artifact.bundle_source();
        let block = source.find("def g(x)").unwrap();
        let late = source.find("HANDLERS = {'g': g}").unwrap();
        let bootstrap = source.find("def _farcall_main").unwrap();
        assert!(block < late && late < bootstrap);
    }

    #[test]
    fn test_filesystem_shim_is_bound_to_aliases() {
        let mut g = graph();
        g.filesystem_aliases.push("fs".to_string());
        let artifact = BundleBuilder::default().build(&g).unwrap();
        let preamble = &artifact.units()[0].source;
        assert!(preamble.contains("class _FarcallFs"));
        assert!(preamble.contains("fs = _FarcallFs()\n"));
        assert!(artifact.manifest().needs_filesystem);
    }

    #[test]
    fn test_name_collision_is_rejected() {
        let mut g = graph();
        g.externals.push(ExternalRef {
            alias: "g".to_string(),
            module: "gzip".to_string(),
            symbol: None,
        });
        let err = BundleBuilder::default().build(&g).unwrap_err();
        match err {
            BuildError::NameCollision { symbol, .. } => assert_eq!(symbol, "g"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_oversized_data_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("weights.bin");
        fs::write(&path, vec![0u8; 32]).unwrap();

        let mut g = graph();
        g.data_files.push(path);
        let builder = BundleBuilder::new(BundleConfig {
            max_data_file_bytes: 16,
        });
        assert!(matches!(
            builder.build(&g),
            Err(BuildError::DataFileTooLarge { size: 32, limit: 16, .. })
        ));
    }

    #[test]
    fn test_identical_input_gives_identical_id() {
        let a = BundleBuilder::default().build(&graph()).unwrap();
        let b = BundleBuilder::default().build(&graph()).unwrap();
        assert_eq!(a.id(), b.id());
        assert_eq!(a.id().len(), 64);

        let mut changed = graph();
        changed.arguments.args[0] = json!(6);
        let c = BundleBuilder::default().build(&changed).unwrap();
        assert_ne!(a.id(), c.id());
    }
}
