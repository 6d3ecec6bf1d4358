//! Tree-sitter parser for work-unit modules
//!
//! This is where the tree-sitter dependency lives.

use rayon::prelude::*;
use tree_sitter::{Node, Parser as TSParser, Tree};

use crate::errors::AnalysisError;
use crate::shared::models::SourceModule;

/// A parsed module; the tree stays alive for index extraction
pub struct ParsedModule {
    pub name: String,
    pub source: String,
    pub tree: Tree,
}

impl ParsedModule {
    pub fn root(&self) -> Node<'_> {
        self.tree.root_node()
    }
}

/// Parse one module, rejecting any syntax error
pub fn parse_module(module: &SourceModule) -> Result<ParsedModule, AnalysisError> {
    let mut parser = TSParser::new();
    parser
        .set_language(&tree_sitter_python::language())
        .map_err(|e| AnalysisError::Parser(format!("Failed to set language: {}", e)))?;

    let tree = parser
        .parse(&module.source, None)
        .ok_or_else(|| AnalysisError::Parser("Failed to parse source code".to_string()))?;

    if tree.root_node().has_error() {
        let (line, message) = first_error(tree.root_node(), module.source.as_bytes())
            .unwrap_or((1, "invalid syntax".to_string()));
        return Err(AnalysisError::Syntax {
            module: module.name.clone(),
            line,
            message,
        });
    }

    Ok(ParsedModule {
        name: module.name.clone(),
        source: module.source.clone(),
        tree,
    })
}

/// Parse every module of a work unit in parallel
pub fn parse_modules(modules: &[SourceModule]) -> Result<Vec<ParsedModule>, AnalysisError> {
    modules.par_iter().map(parse_module).collect()
}

/// First ERROR or MISSING node in document order
fn first_error(node: Node<'_>, source: &[u8]) -> Option<(usize, String)> {
    if node.is_missing() {
        return Some((line_of(node), format!("missing '{}'", node.kind())));
    }
    if node.is_error() {
        let text = node.utf8_text(source).unwrap_or("").trim();
        let snippet: String = text.chars().take(40).collect();
        return Some((line_of(node), format!("unexpected '{}'", snippet)));
    }
    let mut cursor = node.walk();
    let children: Vec<Node<'_>> = node.children(&mut cursor).collect();
    children
        .into_iter()
        .filter(|c| c.has_error() || c.is_missing())
        .find_map(|c| first_error(c, source))
}

/// 1-based line of a node
pub fn line_of(node: Node<'_>) -> usize {
    node.start_position().row + 1
}

/// Source text of a node
pub fn text<'s>(node: Node<'_>, source: &'s str) -> &'s str {
    source.get(node.byte_range()).unwrap_or("")
}

/// Named children collected eagerly (avoids holding a cursor borrow)
pub fn named_children(node: Node<'_>) -> Vec<Node<'_>> {
    let mut cursor = node.walk();
    node.named_children(&mut cursor).collect()
}

/// All children (named and anonymous)
pub fn children(node: Node<'_>) -> Vec<Node<'_>> {
    let mut cursor = node.walk();
    node.children(&mut cursor).collect()
}
