//! WorkUnit - the callable to run plus its bound arguments

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Source text of one Python module
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceModule {
    /// Dotted module name (`jobs.train`)
    pub name: String,
    pub path: Option<PathBuf>,
    pub source: String,
}

impl SourceModule {
    pub fn new(name: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            path: None,
            source: source.into(),
        }
    }

    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Read a module from disk; the module name is the file stem
    pub fn from_file(path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let path = path.into();
        let source = std::fs::read_to_string(&path)?;
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(Self {
            name,
            path: Some(path),
            source,
        })
    }
}

/// Positional and keyword arguments for the entry point
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Arguments {
    pub args: Vec<Value>,
    pub kwargs: BTreeMap<String, Value>,
}

/// A top-level function selected for remote execution, with everything it
/// may need: its declaring module, sibling local modules, arguments and any
/// captured state that cannot be recovered from source.
///
/// Builder methods consume `self`; once handed to the analyzer a work unit is
/// never mutated.
///
/// # Examples
///
/// ```rust
/// use farcall_bundle::WorkUnit;
///
/// let unit = WorkUnit::new("main", "def f(x):\n    return x + 1\n", "f").arg(5);
/// assert_eq!(unit.entry, "f");
/// assert_eq!(unit.arguments.args.len(), 1);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkUnit {
    /// Function name inside `module`
    pub entry: String,
    /// Name of the declaring module
    pub module: String,
    /// Declaring module first, then local modules it may import
    pub modules: Vec<SourceModule>,
    pub arguments: Arguments,
    /// Explicit values for module-level names of the declaring module
    pub bindings: BTreeMap<String, Value>,
    /// Local data files shipped next to the bundle
    pub data_files: Vec<PathBuf>,
}

impl WorkUnit {
    pub fn new(module: impl Into<String>, source: impl Into<String>, entry: impl Into<String>) -> Self {
        let module = module.into();
        Self {
            entry: entry.into(),
            modules: vec![SourceModule::new(module.clone(), source)],
            module,
            arguments: Arguments::default(),
            bindings: BTreeMap::new(),
            data_files: Vec::new(),
        }
    }

    pub fn from_module(module: SourceModule, entry: impl Into<String>) -> Self {
        Self {
            entry: entry.into(),
            module: module.name.clone(),
            modules: vec![module],
            arguments: Arguments::default(),
            bindings: BTreeMap::new(),
            data_files: Vec::new(),
        }
    }

    pub fn with_module(mut self, module: SourceModule) -> Self {
        self.modules.push(module);
        self
    }

    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.arguments.args.push(value.into());
        self
    }

    pub fn kwarg(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.arguments.kwargs.insert(name.into(), value.into());
        self
    }

    pub fn bind(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.bindings.insert(name.into(), value.into());
        self
    }

    pub fn with_data_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.data_files.push(path.into());
        self
    }

    /// `module.entry`
    pub fn qualified_entry(&self) -> String {
        format!("{}.{}", self.module, self.entry)
    }

    pub fn module_source(&self, name: &str) -> Option<&SourceModule> {
        self.modules.iter().find(|m| m.name == name)
    }
}
