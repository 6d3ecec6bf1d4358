//! Analyzer and builder settings
//!
//! Both are plain values passed to the constructors; the orchestration crate
//! embeds them in its YAML schema.

use serde::{Deserialize, Serialize};

/// The six filesystem operations exposed to work-unit code
pub const FILESYSTEM_OPERATIONS: &[&str] =
    &["list", "find", "stat", "exists", "disk_usage", "count_files"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AnalyzerConfig {
    /// Names under which work-unit code reaches the filesystem abstraction
    /// (`fs.find(...)`)
    #[serde(default = "default_filesystem_aliases")]
    pub filesystem_aliases: Vec<String>,
}

fn default_filesystem_aliases() -> Vec<String> {
    vec!["fs".to_string()]
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            filesystem_aliases: default_filesystem_aliases(),
        }
    }
}

impl AnalyzerConfig {
    pub fn filesystem_aliases(mut self, aliases: &[&str]) -> Self {
        self.filesystem_aliases = aliases.iter().map(|a| a.to_string()).collect();
        self
    }

    pub fn is_filesystem_alias(&self, name: &str) -> bool {
        self.filesystem_aliases.iter().any(|a| a == name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BundleConfig {
    /// Upper bound for a single referenced data file
    #[serde(default = "default_max_data_file_bytes")]
    pub max_data_file_bytes: u64,
}

fn default_max_data_file_bytes() -> u64 {
    64 * 1024 * 1024
}

impl Default for BundleConfig {
    fn default() -> Self {
        Self {
            max_data_file_bytes: default_max_data_file_bytes(),
        }
    }
}
