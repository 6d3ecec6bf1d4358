//! Manifest - the JSON document shipped next to the bundle
//!
//! The bootstrap reads `entry_point`, `arguments` and `captured_state` from
//! it at run time; the rest describes the artifact for the orchestrator.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

use crate::shared::models::{Arguments, DependencyGraph, FileRef};

pub const MANIFEST_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub schema_version: u32,
    /// Top-level symbol the bootstrap calls
    pub entry_point: String,
    pub entry_qualified_name: String,
    /// Imported modules the remote environment must provide, sorted
    pub external_modules: Vec<String>,
    pub captured_state: BTreeMap<String, Value>,
    pub arguments: Arguments,
    /// Qualified names per emitted code block, in emission order
    pub blocks: Vec<Vec<String>>,
    pub file_refs: Vec<FileRef>,
    pub needs_filesystem: bool,
    /// File names under `data/`
    #[serde(default)]
    pub data_files: Vec<String>,
    #[serde(default)]
    pub module_cycles: Vec<Vec<String>>,
    /// Hex SHA-256 of the artifact; empty while the hash is being computed
    #[serde(default)]
    pub content_hash: String,
}

impl Manifest {
    /// Manifest for a graph and its block order, without a content hash
    pub(crate) fn describe(
        graph: &DependencyGraph,
        entry_point: &str,
        blocks: &[Vec<usize>],
        data_files: Vec<String>,
    ) -> Self {
        let external_modules: BTreeSet<String> =
            graph.externals.iter().map(|e| e.module.clone()).collect();

        Self {
            schema_version: MANIFEST_SCHEMA_VERSION,
            entry_point: entry_point.to_string(),
            entry_qualified_name: graph.entry.clone(),
            external_modules: external_modules.into_iter().collect(),
            captured_state: graph
                .captured_state()
                .map(|(name, value)| (name.to_string(), value.clone()))
                .collect(),
            arguments: graph.arguments.clone(),
            blocks: blocks
                .iter()
                .map(|block| {
                    block
                        .iter()
                        .map(|&i| graph.nodes[i].qualified_name.clone())
                        .collect()
                })
                .collect(),
            file_refs: graph.file_refs.clone(),
            needs_filesystem: graph.needs_filesystem() || !graph.filesystem_aliases.is_empty(),
            data_files,
            module_cycles: graph.module_cycles.clone(),
            content_hash: String::new(),
        }
    }

    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec_pretty(self)
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// Same manifest with the hash field cleared, as it is hashed
    pub(crate) fn unsealed(&self) -> Self {
        Self {
            content_hash: String::new(),
            ..self.clone()
        }
    }
}
