//! Dependency analyzer
//!
//! Computes the dependency closure of a work unit's entry function:
//! 1. Parse every module of the work unit (parallel) and index it
//! 2. Walk the entry function depth-first, classifying each free name as
//!    callee, capture, global state, external import, builtin or unresolved
//! 3. Propagate captures through callers until a fixed point is reached
//! 4. Render every node as a relocatable top-level definition

use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::time::Instant;
use tracing::{debug, info, warn};

use super::builtins::is_builtin;
use super::module_index::{resolve_relative, FunctionInfo, ModuleIndex, ProgramIndex};
use super::rewrite::{apply_edits, dedent, Edit};
use super::scope::{AttrUse, CallShape, NameUse, StringLiteral};
use crate::config::AnalyzerConfig;
use crate::errors::AnalysisError;
use crate::features::parsing::parse_modules;
use crate::shared::models::{
    Binding, BindingValue, CodeNode, DeclaringScope, DependencyEdge, DependencyGraph, EdgeKind,
    ExternalRef, FileRef, FileRefKind, UnresolvedSymbol, WorkUnit,
};

/// What a free name refers to
#[derive(Debug, Clone, PartialEq, Eq)]
enum Resolved {
    /// Top-level or nested function (qualified name)
    Function(String),
    /// Local of the enclosing function `owner`
    Capture { owner: String },
    Local,
    /// Module-level statement binding
    Global { module: String, name: String },
    /// Value supplied with the work unit
    Explicit(String),
    External(ExternalRef),
    LocalModule(String),
    /// Filesystem abstraction alias
    Shim(String),
    Builtin,
    Unresolved,
}

#[derive(Debug, Clone, Copy)]
enum Scope<'a> {
    Function { info: &'a FunctionInfo, header: bool },
    Module { module: &'a str },
}

impl Scope<'_> {
    fn is_header(&self) -> bool {
        matches!(self, Scope::Function { header: true, .. })
    }

    fn is_function(&self) -> bool {
        matches!(self, Scope::Function { .. })
    }
}

#[derive(Debug, Clone)]
enum Rewrite {
    /// Reference to a function; capture arguments are only known after
    /// propagation, so the edit is produced at render time
    Function {
        range: std::ops::Range<usize>,
        target: String,
        call: Option<CallShape>,
        line: usize,
        /// Bound by an inner scope at the reference; capture arguments
        /// inserted there would read these instead
        shadowed: BTreeSet<String>,
    },
    Text(Edit),
}

#[derive(Debug, Default)]
struct NodeState {
    callees: Vec<String>,
    /// Captured name → owning function
    captures: BTreeMap<String, String>,
    externals: BTreeSet<String>,
    rewrites: Vec<Rewrite>,
    /// References local code (statements only)
    late: bool,
}

/// Dependency analyzer
///
/// Stateless between runs; every call to [`analyze`](Self::analyze) parses
/// the work unit's modules from scratch.
///
/// # Examples
///
/// ```rust
/// use farcall_bundle::{AnalyzerConfig, DependencyAnalyzer, WorkUnit};
///
/// let source = "def f(x):\n    y = 10\n    def g(z):\n        return z + y\n    return g(x) + 1\n";
/// let unit = WorkUnit::new("main", source, "f").arg(5);
///
/// let graph = DependencyAnalyzer::new(AnalyzerConfig::default())
///     .analyze(&unit)
///     .unwrap();
/// assert_eq!(graph.len(), 2);
/// assert!(graph.entry_node().unwrap().rendered.contains("f__g(y, x)"));
/// ```
#[derive(Debug, Clone, Default)]
pub struct DependencyAnalyzer {
    config: AnalyzerConfig,
}

impl DependencyAnalyzer {
    pub fn new(config: AnalyzerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &AnalyzerConfig {
        &self.config
    }

    pub fn analyze(&self, unit: &WorkUnit) -> Result<DependencyGraph, AnalysisError> {
        let started = Instant::now();
        if unit.module_source(&unit.module).is_none() {
            return Err(AnalysisError::ModuleNotFound(unit.module.clone()));
        }

        let parsed = parse_modules(&unit.modules)?;
        let index = ProgramIndex::build(&parsed);
        drop(parsed);

        let entry = entry_function(&index, unit)?;
        debug!("Analyzing {} ({} modules)", entry, index.modules.len());

        let mut session = Session::new(&self.config, &index, unit);
        session.visit(&entry)?;
        let graph = session.finish(entry)?;

        info!(
            "Analyzed {}: {} nodes, {} edges, {} externals, {} bindings, {} file refs, {} unresolved ({:?})",
            graph.entry,
            graph.nodes.len(),
            graph.edges.len(),
            graph.externals.len(),
            graph.bindings.len(),
            graph.file_refs.len(),
            graph.unresolved.len(),
            started.elapsed()
        );
        Ok(graph)
    }
}

fn entry_function(index: &ProgramIndex, unit: &WorkUnit) -> Result<String, AnalysisError> {
    let module = index.module(&unit.module)?;
    if let Some(qn) = module.functions.get(&unit.entry) {
        return Ok(qn.clone());
    }
    let reason = if let Some(target) = module.imports.get(&unit.entry) {
        format!(
            "it is imported from '{}'; submit it from its declaring module",
            target.module
        )
    } else if module.globals.contains_key(&unit.entry) {
        "it is bound by an assignment (lambda, partial or alias), not a def".to_string()
    } else if is_builtin(&unit.entry) {
        "it is a Python builtin".to_string()
    } else {
        format!("module '{}' has no top-level def with that name", unit.module)
    };
    Err(AnalysisError::Opaque {
        entry: unit.qualified_entry(),
        reason,
    })
}

fn unsupported(qualified_name: &str, line: usize, construct: String) -> AnalysisError {
    AnalysisError::UnsupportedConstruct {
        qualified_name: qualified_name.to_string(),
        line,
        construct,
    }
}

/// Path-shaped string literal
pub fn is_path_like(value: &str) -> bool {
    if value.len() < 2 || value.len() > 4096 || value.chars().any(char::is_whitespace) {
        return false;
    }
    if value.contains("://") {
        return false;
    }
    if value.starts_with('/')
        || value.starts_with("./")
        || value.starts_with("../")
        || value.starts_with("~/")
    {
        return true;
    }
    let Some((_, file_name)) = value.rsplit_once('/') else {
        return false;
    };
    match file_name.rsplit_once('.') {
        Some((stem, ext)) => {
            !stem.is_empty()
                && (1..=8).contains(&ext.len())
                && ext.chars().all(|c| c.is_ascii_alphanumeric())
        }
        None => false,
    }
}

struct Session<'a> {
    config: &'a AnalyzerConfig,
    index: &'a ProgramIndex,
    unit: &'a WorkUnit,
    visited: HashSet<String>,
    on_path: HashSet<String>,
    order: Vec<String>,
    states: HashMap<String, NodeState>,
    edges: Vec<DependencyEdge>,
    edge_keys: HashSet<(String, String, EdgeKind)>,
    externals: BTreeMap<String, ExternalRef>,
    bindings: Vec<Binding>,
    /// Visited statements (module, position) → late
    statements: HashMap<(String, usize), bool>,
    explicit_used: BTreeSet<String>,
    file_refs: Vec<FileRef>,
    unresolved: BTreeSet<UnresolvedSymbol>,
    fs_aliases: BTreeSet<String>,
}

impl<'a> Session<'a> {
    fn new(config: &'a AnalyzerConfig, index: &'a ProgramIndex, unit: &'a WorkUnit) -> Self {
        Self {
            config,
            index,
            unit,
            visited: HashSet::new(),
            on_path: HashSet::new(),
            order: Vec::new(),
            states: HashMap::new(),
            edges: Vec::new(),
            edge_keys: HashSet::new(),
            externals: BTreeMap::new(),
            bindings: Vec::new(),
            statements: HashMap::new(),
            explicit_used: BTreeSet::new(),
            file_refs: Vec::new(),
            unresolved: BTreeSet::new(),
            fs_aliases: BTreeSet::new(),
        }
    }

    // ------------------------------------------------------------------
    // Traversal
    // ------------------------------------------------------------------

    fn visit(&mut self, qualified_name: &str) -> Result<(), AnalysisError> {
        if !self.visited.insert(qualified_name.to_string()) {
            return Ok(());
        }
        let index = self.index;
        let info = index
            .function(qualified_name)
            .ok_or_else(|| AnalysisError::Opaque {
                entry: qualified_name.to_string(),
                reason: "definition is not indexed".to_string(),
            })?;

        self.order.push(qualified_name.to_string());
        self.on_path.insert(qualified_name.to_string());
        debug!("Visiting {} (line {})", qualified_name, info.line);

        if let Some((name, line)) = info.body.nonlocals.first() {
            return Err(unsupported(
                qualified_name,
                *line,
                format!("nonlocal rebinding of '{}'", name),
            ));
        }
        for (module, line) in &info.body.imports {
            let module = if module.starts_with('.') {
                resolve_relative(&info.module, module)
            } else {
                module.clone()
            };
            if index.is_local_module(&module) {
                return Err(unsupported(
                    qualified_name,
                    *line,
                    format!("import of local module '{}' inside a function", module),
                ));
            }
        }

        let mut state = NodeState::default();
        for (scan, header) in [(&info.header, true), (&info.body, false)] {
            let scope = Scope::Function { info, header };
            for name_use in &scan.uses {
                let resolved = self.resolve(scope, &name_use.name);
                self.apply_resolution(scope, qualified_name, &mut state, name_use, resolved)?;
            }
            for attr in &scan.attr_uses {
                self.attr_use(scope, qualified_name, &mut state, attr)?;
            }
            self.literal_refs(qualified_name, &scan.strings);
        }
        self.states.insert(qualified_name.to_string(), state);

        for (_, child) in &info.children {
            self.visit(child)?;
        }
        self.on_path.remove(qualified_name);
        Ok(())
    }

    /// Visit every statement binding `name` in `module`; returns the bundle
    /// symbol and whether the binding is late
    fn visit_global(&mut self, module: &str, name: &str) -> Result<(String, bool), AnalysisError> {
        let index = self.index;
        let module_index = index.module(module)?;
        let mut late = false;
        if let Some(positions) = module_index.globals.get(name) {
            for &position in positions {
                late |= self.visit_statement(module_index, position)?;
            }
        }
        Ok((self.global_symbol(module, name), late))
    }

    fn visit_statement(&mut self, module: &'a ModuleIndex, position: usize) -> Result<bool, AnalysisError> {
        let key = (module.name.clone(), position);
        if let Some(late) = self.statements.get(&key) {
            return Ok(*late);
        }
        // provisional entry guards self-references
        self.statements.insert(key.clone(), false);

        let stmt = &module.statements[position];
        let label = format!("{}.{}", module.name, stmt.names.join(","));
        let symbols: Vec<String> = stmt
            .names
            .iter()
            .map(|n| self.global_symbol(&module.name, n))
            .collect();
        self.literal_refs(&label, &stmt.scan.strings);

        let bound_once = stmt.names.len() == 1
            && module
                .globals
                .get(&stmt.names[0])
                .map(|p| p.len() == 1)
                .unwrap_or(false);
        if let (Some(value), true) = (&stmt.literal, bound_once) {
            debug!("Captured {} as data", label);
            self.bindings.push(Binding {
                name: symbols[0].clone(),
                extra_names: Vec::new(),
                module: module.name.clone(),
                value: BindingValue::Data {
                    value: value.clone(),
                },
            });
            return Ok(false);
        }

        let scope = Scope::Module {
            module: &module.name,
        };
        let mut state = NodeState::default();
        for name_use in &stmt.scan.uses {
            let resolved = self.resolve(scope, &name_use.name);
            self.apply_resolution(scope, &label, &mut state, name_use, resolved)?;
        }
        for attr in &stmt.scan.attr_uses {
            self.attr_use(scope, &label, &mut state, attr)?;
        }

        let mut edits: Vec<Edit> = stmt
            .scan
            .stores
            .iter()
            .filter_map(|store| {
                let symbol = self.global_symbol(&module.name, &store.name);
                (symbol != store.name).then(|| Edit::replace(store.range.clone(), symbol))
            })
            .collect();
        for rewrite in &state.rewrites {
            edits.extend(self.render_rewrite(&module.source, rewrite));
        }
        let text = apply_edits(&module.source, stmt.range.clone(), edits);

        debug!("Captured {} as source (late: {})", label, state.late);
        self.statements.insert(key, state.late);
        self.bindings.push(Binding {
            name: symbols[0].clone(),
            extra_names: symbols[1..].to_vec(),
            module: module.name.clone(),
            value: BindingValue::Source {
                text,
                late: state.late,
            },
        });
        Ok(state.late)
    }

    // ------------------------------------------------------------------
    // Resolution
    // ------------------------------------------------------------------

    fn resolve(&self, scope: Scope<'a>, name: &str) -> Resolved {
        match scope {
            Scope::Module { module } => self.resolve_global(module, name, &mut HashSet::new()),
            Scope::Function { info, header } => self.resolve_in_function(info, name, header),
        }
    }

    /// Header names (decorators, defaults) are evaluated in the enclosing
    /// scope, so the function's own names are skipped for them
    fn resolve_in_function(&self, info: &FunctionInfo, name: &str, header: bool) -> Resolved {
        if !header {
            if info.body.globals.contains(name) {
                return self.resolve_global(&info.module, name, &mut HashSet::new());
            }
            if let Some(child) = info.child(name) {
                return Resolved::Function(child.to_string());
            }
            if info.body.locals.contains(name) {
                return Resolved::Local;
            }
        }

        let mut parent = info.parent.as_deref();
        while let Some(parent_qn) = parent {
            let Some(enclosing) = self.index.function(parent_qn) else {
                break;
            };
            if enclosing.body.globals.contains(name) {
                break;
            }
            if let Some(child) = enclosing.child(name) {
                return Resolved::Function(child.to_string());
            }
            if enclosing.body.locals.contains(name) {
                return Resolved::Capture {
                    owner: parent_qn.to_string(),
                };
            }
            parent = enclosing.parent.as_deref();
        }
        self.resolve_global(&info.module, name, &mut HashSet::new())
    }

    fn resolve_global(&self, module: &str, name: &str, guard: &mut HashSet<(String, String)>) -> Resolved {
        if !guard.insert((module.to_string(), name.to_string())) {
            return Resolved::Unresolved;
        }
        let Some(module_index) = self.index.modules.get(module) else {
            return Resolved::Unresolved;
        };

        if let Some(qn) = module_index.functions.get(name) {
            return Resolved::Function(qn.clone());
        }
        if module == self.unit.module && self.unit.bindings.contains_key(name) {
            return Resolved::Explicit(name.to_string());
        }
        if self.config.is_filesystem_alias(name) && !module_index.globals.contains_key(name) {
            return Resolved::Shim(name.to_string());
        }
        if let Some(target) = module_index.imports.get(name) {
            return match &target.symbol {
                None if self.index.is_local_module(&target.bound) => {
                    Resolved::LocalModule(target.bound.clone())
                }
                None => Resolved::External(ExternalRef {
                    alias: name.to_string(),
                    module: target.module.clone(),
                    symbol: None,
                }),
                Some(symbol) => {
                    let submodule = format!("{}.{}", target.module, symbol);
                    if self.index.is_local_module(&submodule) {
                        Resolved::LocalModule(submodule)
                    } else if self.index.is_local_module(&target.module) {
                        match self.resolve_global(&target.module, symbol, guard) {
                            Resolved::External(mut external) => {
                                external.alias = name.to_string();
                                Resolved::External(external)
                            }
                            Resolved::Shim(_) => Resolved::Shim(name.to_string()),
                            other => other,
                        }
                    } else {
                        Resolved::External(ExternalRef {
                            alias: name.to_string(),
                            module: target.module.clone(),
                            symbol: Some(symbol.clone()),
                        })
                    }
                }
            };
        }
        if module_index.globals.contains_key(name) {
            return Resolved::Global {
                module: module.to_string(),
                name: name.to_string(),
            };
        }
        if is_builtin(name) {
            Resolved::Builtin
        } else {
            Resolved::Unresolved
        }
    }

    fn apply_resolution(
        &mut self,
        scope: Scope<'a>,
        from: &str,
        state: &mut NodeState,
        name_use: &NameUse,
        resolved: Resolved,
    ) -> Result<(), AnalysisError> {
        match resolved {
            Resolved::Function(target) => {
                let nested = self
                    .index
                    .function(&target)
                    .map(|t| t.parent.is_some())
                    .unwrap_or(false);
                if scope.is_header() && nested {
                    return Err(unsupported(
                        from,
                        name_use.line,
                        format!(
                            "decorator or default value refers to nested function '{}'",
                            name_use.name
                        ),
                    ));
                }
                if scope.is_function() {
                    self.add_edge(from, &target, EdgeKind::Calls);
                }
                if !state.callees.contains(&target) {
                    state.callees.push(target.clone());
                }
                state.late = true;
                state.rewrites.push(Rewrite::Function {
                    range: name_use.range.clone(),
                    target: target.clone(),
                    call: name_use.call.clone(),
                    line: name_use.line,
                    shadowed: name_use.shadowed.clone(),
                });
                self.visit(&target)?;
            }
            Resolved::Capture { owner } => {
                if scope.is_header() {
                    return Err(unsupported(
                        from,
                        name_use.line,
                        format!(
                            "decorator or default value reads enclosing local '{}'",
                            name_use.name
                        ),
                    ));
                }
                self.add_edge(from, &owner, EdgeKind::Captures);
                state.captures.insert(name_use.name.clone(), owner);
            }
            Resolved::Local => {}
            Resolved::Global { module, name } => {
                let (symbol, late) = self.visit_global(&module, &name)?;
                state.late |= late;
                if symbol != name_use.name {
                    state
                        .rewrites
                        .push(Rewrite::Text(Edit::replace(name_use.range.clone(), symbol)));
                }
            }
            Resolved::Explicit(name) => self.use_explicit(&name),
            Resolved::External(external) => {
                state.externals.insert(external.alias.clone());
                self.add_external(external)?;
            }
            Resolved::LocalModule(module) => {
                return Err(unsupported(
                    from,
                    name_use.line,
                    format!("module object '{}' used as a value", module),
                ));
            }
            Resolved::Shim(alias) => {
                self.fs_aliases.insert(alias);
            }
            Resolved::Builtin => {
                if name_use.name == "open" && name_use.call.is_some() {
                    self.add_file_ref(FileRef {
                        kind: FileRefKind::Open,
                        path: name_use.first_literal_arg.clone(),
                        line: name_use.line,
                        qualified_name: from.to_string(),
                    });
                }
            }
            Resolved::Unresolved => {
                self.unresolved.insert(UnresolvedSymbol {
                    name: name_use.name.clone(),
                    referenced_from: from.to_string(),
                    line: name_use.line,
                });
            }
        }
        Ok(())
    }

    fn attr_use(
        &mut self,
        scope: Scope<'a>,
        from: &str,
        state: &mut NodeState,
        attr: &AttrUse,
    ) -> Result<(), AnalysisError> {
        let module = match self.resolve(scope, &attr.object) {
            Resolved::LocalModule(module) => module,
            resolved => {
                if let (Resolved::Shim(_), true) = (&resolved, attr.is_call) {
                    if let Some(kind) = FileRefKind::from_operation(&attr.attr) {
                        self.add_file_ref(FileRef {
                            kind,
                            path: attr.first_literal_arg.clone(),
                            line: attr.line,
                            qualified_name: from.to_string(),
                        });
                    }
                }
                return self.apply_resolution(scope, from, state, &attr.object_use(), resolved);
            }
        };

        // `helpers.g` is rewritten as a whole to the member's bundle symbol
        let member = NameUse {
            name: format!("{}.{}", attr.object, attr.attr),
            range: attr.range.clone(),
            line: attr.line,
            call: None,
            first_literal_arg: None,
            shadowed: attr.shadowed.clone(),
        };
        match self.resolve_global(&module, &attr.attr, &mut HashSet::new()) {
            Resolved::Unresolved | Resolved::Builtin => {
                self.unresolved.insert(UnresolvedSymbol {
                    name: member.name,
                    referenced_from: from.to_string(),
                    line: attr.line,
                });
                Ok(())
            }
            Resolved::LocalModule(nested) => Err(unsupported(
                from,
                attr.line,
                format!("attribute access into package module '{}'", nested),
            )),
            Resolved::External(external) => {
                state.rewrites.push(Rewrite::Text(Edit::replace(
                    attr.range.clone(),
                    external.alias.clone(),
                )));
                self.apply_resolution(scope, from, state, &member, Resolved::External(external))
            }
            Resolved::Shim(alias) => {
                state
                    .rewrites
                    .push(Rewrite::Text(Edit::replace(attr.range.clone(), alias.clone())));
                self.fs_aliases.insert(alias);
                Ok(())
            }
            Resolved::Explicit(name) => {
                state
                    .rewrites
                    .push(Rewrite::Text(Edit::replace(attr.range.clone(), name.clone())));
                self.use_explicit(&name);
                Ok(())
            }
            resolved => self.apply_resolution(scope, from, state, &member, resolved),
        }
    }

    // ------------------------------------------------------------------
    // Bookkeeping
    // ------------------------------------------------------------------

    fn add_edge(&mut self, from: &str, to: &str, kind: EdgeKind) {
        if !self
            .edge_keys
            .insert((from.to_string(), to.to_string(), kind))
        {
            return;
        }
        let circular = kind == EdgeKind::Calls && self.on_path.contains(to);
        if circular {
            debug!("Circular reference {} -> {}", from, to);
        }
        self.edges.push(DependencyEdge {
            from: from.to_string(),
            to: to.to_string(),
            kind,
            circular,
        });
    }

    fn add_external(&mut self, external: ExternalRef) -> Result<(), AnalysisError> {
        match self.externals.get(&external.alias) {
            Some(existing) if *existing != external => Err(AnalysisError::ImportConflict {
                alias: external.alias.clone(),
                first: existing.target(),
                second: external.target(),
            }),
            Some(_) => Ok(()),
            None => {
                self.externals.insert(external.alias.clone(), external);
                Ok(())
            }
        }
    }

    fn use_explicit(&mut self, name: &str) {
        if !self.explicit_used.insert(name.to_string()) {
            return;
        }
        if let Some(value) = self.unit.bindings.get(name) {
            self.bindings.push(Binding {
                name: name.to_string(),
                extra_names: Vec::new(),
                module: self.unit.module.clone(),
                value: BindingValue::Data {
                    value: value.clone(),
                },
            });
        }
    }

    fn add_file_ref(&mut self, file_ref: FileRef) {
        if !self.file_refs.contains(&file_ref) {
            self.file_refs.push(file_ref);
        }
    }

    fn literal_refs(&mut self, from: &str, strings: &[StringLiteral]) {
        for literal in strings.iter().filter(|s| is_path_like(&s.value)) {
            self.add_file_ref(FileRef {
                kind: FileRefKind::Literal,
                path: Some(literal.value.clone()),
                line: literal.line,
                qualified_name: from.to_string(),
            });
        }
    }

    // ------------------------------------------------------------------
    // Symbols and rendering
    // ------------------------------------------------------------------

    fn module_prefix(&self, module: &str) -> Option<String> {
        (module != self.unit.module).then(|| module.replace('.', "_"))
    }

    fn global_symbol(&self, module: &str, name: &str) -> String {
        match self.module_prefix(module) {
            Some(prefix) => format!("{}__{}", prefix, name),
            None => name.to_string(),
        }
    }

    fn function_symbol(&self, info: &FunctionInfo) -> String {
        let base = info.path.join("__");
        match self.module_prefix(&info.module) {
            Some(prefix) => format!("{}__{}", prefix, base),
            None => base,
        }
    }

    fn captures_of(&self, qualified_name: &str) -> Vec<String> {
        self.states
            .get(qualified_name)
            .map(|s| s.captures.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn render_rewrite(&self, source: &str, rewrite: &Rewrite) -> Vec<Edit> {
        let (range, target, call) = match rewrite {
            Rewrite::Text(edit) => return vec![edit.clone()],
            Rewrite::Function {
                range,
                target,
                call,
                ..
            } => (range, target, call),
        };
        let Some(info) = self.index.function(target) else {
            return Vec::new();
        };
        let symbol = self.function_symbol(info);
        let captures = self.captures_of(target);

        if captures.is_empty() {
            if source.get(range.clone()) == Some(symbol.as_str()) {
                return Vec::new();
            }
            return vec![Edit::replace(range.clone(), symbol)];
        }

        let passed = captures.join(", ");
        match call {
            Some(CallShape::Args { open_paren, empty }) => vec![
                Edit::replace(range.clone(), symbol),
                Edit::insert(
                    open_paren + 1,
                    if *empty { passed } else { format!("{}, ", passed) },
                ),
            ],
            Some(CallShape::Generator { range: generator }) => vec![
                Edit::replace(range.clone(), symbol),
                Edit::replace(generator.start..generator.start + 1, format!("({}, (", passed)),
                Edit::insert(generator.end, ")"),
            ],
            None => vec![Edit::replace(
                range.clone(),
                format!("(lambda *_a, **_k: {}({}, *_a, **_k))", symbol, passed),
            )],
        }
    }

    fn is_inside(&self, qualified_name: &str, ancestor: &str) -> bool {
        let mut current = self
            .index
            .function(qualified_name)
            .and_then(|f| f.parent.as_deref());
        while let Some(parent) = current {
            if parent == ancestor {
                return true;
            }
            current = self.index.function(parent).and_then(|f| f.parent.as_deref());
        }
        false
    }

    /// A caller of a capturing function must have the captured names in
    /// scope: either it owns them or it captures them too
    fn propagate_captures(&mut self) -> Result<(), AnalysisError> {
        let calls: Vec<(String, String)> = self
            .edges
            .iter()
            .filter(|e| e.kind == EdgeKind::Calls)
            .map(|e| (e.from.clone(), e.to.clone()))
            .collect();

        loop {
            let mut added = Vec::new();
            for (from, to) in &calls {
                let Some(callee) = self.states.get(to) else {
                    continue;
                };
                let Some(caller) = self.states.get(from) else {
                    continue;
                };
                for (name, owner) in &callee.captures {
                    if from == owner || !self.is_inside(from, owner) {
                        continue;
                    }
                    match caller.captures.get(name) {
                        Some(existing) if existing == owner => continue,
                        Some(_) => {
                            return Err(unsupported(
                                from,
                                self.index.function(from).map(|f| f.line).unwrap_or(0),
                                format!("'{}' is captured from two different scopes", name),
                            ))
                        }
                        None => {}
                    }
                    let shadowed = self
                        .index
                        .function(from)
                        .map(|f| f.body.locals.contains(name))
                        .unwrap_or(false);
                    if shadowed {
                        return Err(unsupported(
                            from,
                            self.index.function(from).map(|f| f.line).unwrap_or(0),
                            format!("local '{}' shadows a name captured by {}", name, to),
                        ));
                    }
                    added.push((from.clone(), name.clone(), owner.clone()));
                }
            }
            if added.is_empty() {
                return Ok(());
            }
            for (from, name, owner) in added {
                self.add_edge(&from, &owner, EdgeKind::Captures);
                if let Some(state) = self.states.get_mut(&from) {
                    state.captures.insert(name, owner);
                }
            }
        }
    }

    /// Capture arguments are inserted as bare names at each reference, so a
    /// lambda or comprehension around the reference must not rebind them
    fn check_capture_arguments(&self) -> Result<(), AnalysisError> {
        for from in &self.order {
            let Some(state) = self.states.get(from) else {
                continue;
            };
            for rewrite in &state.rewrites {
                let Rewrite::Function {
                    target,
                    line,
                    shadowed,
                    ..
                } = rewrite
                else {
                    continue;
                };
                if let Some(name) = self
                    .captures_of(target)
                    .into_iter()
                    .find(|c| shadowed.contains(c))
                {
                    return Err(unsupported(
                        from,
                        *line,
                        format!(
                            "'{}' is rebound by a lambda or comprehension around the reference to {}",
                            name, target
                        ),
                    ));
                }
            }
        }
        Ok(())
    }

    fn render_node(&self, qualified_name: &str, discovery_index: usize) -> Option<CodeNode> {
        let info = self.index.function(qualified_name)?;
        let module = self.index.modules.get(&info.module)?;
        let state = self.states.get(qualified_name)?;

        let symbol = self.function_symbol(info);
        let captures = self.captures_of(qualified_name);

        let mut edits = Vec::new();
        if symbol != info.name() {
            edits.push(Edit::replace(info.name_range.clone(), symbol.clone()));
        }
        if !captures.is_empty() {
            let mut params = captures.join(", ");
            if !info.params_empty {
                params.push_str(", ");
            }
            edits.push(Edit::insert(info.params_open + 1, params));
        }
        for rewrite in &state.rewrites {
            edits.extend(self.render_rewrite(&module.source, rewrite));
        }
        for range in &info.nested_stmt_ranges {
            edits.push(Edit::replace(range.clone(), "pass"));
        }

        let rendered = dedent(
            &apply_edits(&module.source, info.stmt_range.clone(), edits),
            info.indent,
        );
        let scope = match &info.parent {
            Some(parent) => DeclaringScope::Nested {
                parent: parent.clone(),
            },
            None => DeclaringScope::Module,
        };

        Some(CodeNode {
            qualified_name: qualified_name.to_string(),
            module: info.module.clone(),
            symbol,
            scope,
            line: info.line,
            source: module
                .source
                .get(info.stmt_range.clone())
                .unwrap_or("")
                .to_string(),
            rendered,
            captures,
            callees: state.callees.clone(),
            externals: state.externals.iter().cloned().collect(),
            discovery_index,
        })
    }

    fn finish(mut self, entry: String) -> Result<DependencyGraph, AnalysisError> {
        self.propagate_captures()?;
        self.check_capture_arguments()?;

        let nodes: Vec<CodeNode> = self
            .order
            .iter()
            .enumerate()
            .filter_map(|(i, qn)| self.render_node(qn, i))
            .collect();

        let module_cycles = module_cycles(self.index);
        for cycle in &module_cycles {
            warn!("Local modules import each other: {}", cycle.join(" <-> "));
        }
        if !self.unresolved.is_empty() {
            debug!(
                "{} unresolved names left for the remote environment",
                self.unresolved.len()
            );
        }

        Ok(DependencyGraph {
            entry,
            nodes,
            edges: self.edges,
            externals: self.externals.into_values().collect(),
            bindings: self.bindings,
            file_refs: self.file_refs,
            unresolved: self.unresolved.into_iter().collect(),
            filesystem_aliases: self.fs_aliases.into_iter().collect(),
            module_cycles,
            arguments: self.unit.arguments.clone(),
            data_files: self.unit.data_files.clone(),
        })
    }
}

/// Strongly connected components of the local import graph
fn module_cycles(index: &ProgramIndex) -> Vec<Vec<String>> {
    let mut graph: DiGraph<&str, ()> = DiGraph::new();
    let nodes: HashMap<&str, NodeIndex> = index
        .modules
        .keys()
        .map(|name| (name.as_str(), graph.add_node(name.as_str())))
        .collect();

    for (name, module) in &index.modules {
        for imported in module.imported_modules(index) {
            if let (Some(&from), Some(&to)) = (nodes.get(name.as_str()), nodes.get(imported)) {
                graph.update_edge(from, to, ());
            }
        }
    }

    let mut cycles: Vec<Vec<String>> = tarjan_scc(&graph)
        .into_iter()
        .filter(|scc| scc.len() > 1 || graph.contains_edge(scc[0], scc[0]))
        .map(|scc| {
            let mut members: Vec<String> = scc.iter().map(|i| graph[*i].to_string()).collect();
            members.sort();
            members
        })
        .collect();
    cycles.sort();
    cycles
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::models::SourceModule;
    use serde_json::json;

    fn analyze(unit: &WorkUnit) -> Result<DependencyGraph, AnalysisError> {
        DependencyAnalyzer::new(AnalyzerConfig::default()).analyze(unit)
    }

    #[test]
    fn test_single_function_is_one_node() {
        let unit = WorkUnit::new("main", "import math\n\ndef area(r):\n    return math.pi * r ** 2\n", "area");
        let graph = analyze(&unit).unwrap();

        assert_eq!(graph.len(), 1);
        assert_eq!(graph.entry, "main.area");
        assert_eq!(graph.externals.len(), 1);
        assert_eq!(graph.externals[0].import_statement(), "import math");
        assert!(graph.edges.is_empty());
    }

    #[test]
    fn test_nested_capture_is_hoisted() {
        let source = "def f(x):\n    y = 10\n    def g(z):\n        return z + y\n    return g(x) + 1\n";
        let graph = analyze(&WorkUnit::new("main", source, "f")).unwrap();

        assert_eq!(graph.len(), 2);
        let g = graph.node("main.f.g").unwrap();
        assert_eq!(g.symbol, "f__g");
        assert_eq!(g.captures, vec!["y".to_string()]);
        assert_eq!(g.scope.parent(), Some("main.f"));
        assert_eq!(g.rendered, "def f__g(y, z):\n    return z + y");

        let f = graph.entry_node().unwrap();
        assert!(f.rendered.contains("return f__g(y, x) + 1"));
        assert!(f.rendered.contains("    pass\n"));
        assert!(graph
            .edges
            .iter()
            .any(|e| e.from == "main.f.g" && e.to == "main.f" && e.kind == EdgeKind::Captures));
    }

    #[test]
    fn test_non_call_reference_is_wrapped() {
        let source = "def f(xs):\n    k = 3\n    def scale(v):\n        return v * k\n    return list(map(scale, xs))\n";
        let graph = analyze(&WorkUnit::new("main", source, "f")).unwrap();
        let f = graph.entry_node().unwrap();
        assert!(f
            .rendered
            .contains("map((lambda *_a, **_k: f__scale(k, *_a, **_k)), xs)"));
    }

    #[test]
    fn test_captures_propagate_to_sibling_callers() {
        let source = "def f(x):\n    y = 2\n    def inner(v):\n        return v * y\n    def outer(v):\n        return inner(v) + 1\n    return outer(x)\n";
        let graph = analyze(&WorkUnit::new("main", source, "f")).unwrap();

        assert_eq!(graph.len(), 3);
        let outer = graph.node("main.f.outer").unwrap();
        assert_eq!(outer.captures, vec!["y".to_string()]);
        assert!(outer.rendered.contains("return f__inner(y, v) + 1"));
        assert!(graph.entry_node().unwrap().rendered.contains("return f__outer(y, x)"));
    }

    #[test]
    fn test_mutual_recursion_is_reported() {
        let source = "def is_even(n):\n    return True if n == 0 else is_odd(n - 1)\n\ndef is_odd(n):\n    return False if n == 0 else is_even(n - 1)\n";
        let graph = analyze(&WorkUnit::new("main", source, "is_even")).unwrap();

        assert_eq!(graph.len(), 2);
        assert_eq!(
            graph.cycles(),
            vec![vec!["main.is_even".to_string(), "main.is_odd".to_string()]]
        );
        assert!(graph.edges.iter().any(|e| e.circular && e.to == "main.is_even"));
    }

    #[test]
    fn test_globals_become_bindings() {
        let source = "SCALE = 3\nNAMES = [n.upper() for n in ('a', 'b')]\n\ndef helper(v):\n    return v * SCALE\n\nHANDLER = helper\n\ndef run(x):\n    return HANDLER(x), NAMES, THRESHOLD\n";
        let unit = WorkUnit::new("main", source, "run").bind("THRESHOLD", 0.5);
        let graph = analyze(&unit).unwrap();

        let state: BTreeMap<&str, &serde_json::Value> = graph.captured_state().collect();
        assert_eq!(state.get("SCALE"), Some(&&json!(3)));
        assert_eq!(state.get("THRESHOLD"), Some(&&json!(0.5)));

        let handler = graph.bindings.iter().find(|b| b.name == "HANDLER").unwrap();
        assert!(handler.is_late());
        let names = graph.bindings.iter().find(|b| b.name == "NAMES").unwrap();
        assert!(!names.is_late());

        // dependencies come first
        let position = |name: &str| graph.bindings.iter().position(|b| b.name == name).unwrap();
        assert!(position("SCALE") < position("HANDLER"));
        assert!(graph.node("main.helper").is_some());
    }

    #[test]
    fn test_cross_module_symbols_are_prefixed() {
        let helpers = SourceModule::new(
            "helpers",
            "import numpy as np\n\nFACTOR = 4\n\ndef g(v):\n    return np.sqrt(v) * FACTOR\n",
        );
        let main = "import helpers\nfrom helpers import g as root\n\ndef f(x):\n    return helpers.g(x) + root(x)\n";
        let unit = WorkUnit::new("main", main, "f").with_module(helpers);
        let graph = analyze(&unit).unwrap();

        let g = graph.node("helpers.g").unwrap();
        assert_eq!(g.symbol, "helpers__g");
        assert!(g.rendered.starts_with("def helpers__g(v):"));
        assert!(g.rendered.contains("* helpers__FACTOR"));
        assert!(graph.entry_node().unwrap().rendered.contains("helpers__g(x) + helpers__g(x)"));
        assert_eq!(graph.externals[0].alias, "np");
        assert!(graph.captured_state().any(|(name, _)| name == "helpers__FACTOR"));
    }

    #[test]
    fn test_module_cycles_are_reported_not_fatal() {
        let a = SourceModule::new("a", "import b\n\ndef fa():\n    return b.fb()\n");
        let b = SourceModule::new("b", "import a\n\ndef fb():\n    return 1\n");
        let unit = WorkUnit::from_module(a, "fa").with_module(b);
        let graph = analyze(&unit).unwrap();

        assert_eq!(graph.module_cycles, vec![vec!["a".to_string(), "b".to_string()]]);
        assert_eq!(graph.len(), 2);
    }

    #[test]
    fn test_comprehension_rebinding_a_forwarded_capture_is_rejected() {
        let source = "def f(xs):\n    y = 1\n    def g(v):\n        return v + y\n    return [g(y) for y in xs]\n";
        let err = analyze(&WorkUnit::new("main", source, "f").arg(json!([5]))).unwrap_err();
        match err {
            AnalysisError::UnsupportedConstruct {
                qualified_name,
                line,
                construct,
            } => {
                assert_eq!(qualified_name, "main.f");
                assert_eq!(line, 5);
                assert!(construct.contains("'y'"));
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_lambda_rebinding_a_forwarded_capture_is_rejected() {
        let source = "def f(xs):\n    y = 1\n    def g(v):\n        return v + y\n    return list(map(lambda y: g(y), xs))\n";
        assert!(matches!(
            analyze(&WorkUnit::new("main", source, "f")),
            Err(AnalysisError::UnsupportedConstruct { .. })
        ));
    }

    #[test]
    fn test_comprehension_without_rebinding_forwards_captures() {
        let source = "def f(xs):\n    y = 1\n    def g(v):\n        return v + y\n    return [g(v) for v in xs], list(map(lambda w: g(w), xs))\n";
        let graph = analyze(&WorkUnit::new("main", source, "f")).unwrap();
        let rendered = &graph.entry_node().unwrap().rendered;
        assert!(rendered.contains("[f__g(y, v) for v in xs]"));
        assert!(rendered.contains("lambda w: f__g(y, w)"));
    }

    #[test]
    fn test_nonlocal_is_unsupported() {
        let source = "def counter():\n    n = 0\n    def bump():\n        nonlocal n\n        n += 1\n        return n\n    return bump()\n";
        let err = analyze(&WorkUnit::new("main", source, "counter")).unwrap_err();
        match err {
            AnalysisError::UnsupportedConstruct {
                qualified_name,
                line,
                ..
            } => {
                assert_eq!(qualified_name, "main.counter.bump");
                assert_eq!(line, 4);
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_enclosing_local_default_is_unsupported() {
        let source = "def f():\n    y = 1\n    def g(v=y):\n        return v\n    return g()\n";
        let err = analyze(&WorkUnit::new("main", source, "f")).unwrap_err();
        assert!(matches!(err, AnalysisError::UnsupportedConstruct { .. }));
    }

    #[test]
    fn test_opaque_entries() {
        let source = "from numpy import sum as total\nsquare = lambda v: v * v\n";
        for entry in ["total", "square", "print", "missing"] {
            let err = analyze(&WorkUnit::new("main", source, entry)).unwrap_err();
            assert!(matches!(err, AnalysisError::Opaque { .. }), "{} should be opaque", entry);
        }
    }

    #[test]
    fn test_file_references() {
        let source = "def f():\n    files = fs.find(\"/data/in\", \"**/*.csv\")\n    with open(\"./out/report.txt\", \"w\") as out:\n        out.write(str(fs.count_files(\"/data/in\")))\n    return load(\"models/weights.bin\"), \"not a path\"\n";
        let graph = analyze(&WorkUnit::new("main", source, "f")).unwrap();

        let kinds: BTreeSet<FileRefKind> = graph.file_refs.iter().map(|r| r.kind).collect();
        assert!(kinds.contains(&FileRefKind::Find));
        assert!(kinds.contains(&FileRefKind::CountFiles));
        assert!(kinds.contains(&FileRefKind::Open));
        assert!(kinds.contains(&FileRefKind::Literal));
        assert!(graph.needs_filesystem());
        assert_eq!(graph.filesystem_aliases, vec!["fs".to_string()]);
        assert!(graph.unresolved.iter().any(|u| u.name == "load"));
        assert!(!graph
            .file_refs
            .iter()
            .any(|r| r.path.as_deref() == Some("not a path")));
    }

    #[test]
    fn test_import_alias_conflict() {
        let helpers = SourceModule::new("helpers", "import jax.numpy as np\n\ndef g(v):\n    return np.abs(v)\n");
        let main = "import numpy as np\nfrom helpers import g\n\ndef f(x):\n    return np.sum(g(x))\n";
        let unit = WorkUnit::new("main", main, "f").with_module(helpers);
        let err = analyze(&unit).unwrap_err();
        assert!(matches!(err, AnalysisError::ImportConflict { ref alias, .. } if alias == "np"));
    }

    #[test]
    fn test_path_heuristic() {
        assert!(is_path_like("/etc/hosts"));
        assert!(is_path_like("./data"));
        assert!(is_path_like("~/runs/out.json"));
        assert!(is_path_like("models/weights.bin"));
        assert!(!is_path_like("a/b"));
        assert!(!is_path_like("https://example.com/x.json"));
        assert!(!is_path_like("hello world/x.txt"));
        assert!(!is_path_like("/"));
    }
}
