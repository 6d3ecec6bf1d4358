//! Per-module index: top-level functions, imports and global statements
//!
//! Built once per analysis run from the parsed modules. Everything here is
//! owned data (names, byte ranges, scans) so the syntax trees can be dropped
//! before resolution starts.

use serde_json::{Map, Number, Value};
use std::collections::{BTreeMap, HashMap};
use std::ops::Range;
use tracing::debug;
use tree_sitter::Node;

use super::scope::{scan_function, scan_statement, string_literal, ScopeScan};
use crate::errors::AnalysisError;
use crate::features::parsing::node_kinds as kinds;
use crate::features::parsing::parser::{children, line_of, named_children, text};
use crate::features::parsing::ParsedModule;

/// What a module-level import alias is bound to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportTarget {
    /// Imported module, relative imports resolved (`pkg.helpers`)
    pub module: String,
    /// Member for `from module import symbol`
    pub symbol: Option<String>,
    /// Module object the alias refers to for `import a.b.c` (that is `a`)
    pub bound: String,
    pub line: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    Assignment,
    Class,
    Other,
}

/// Module-level statement that binds names
#[derive(Debug, Clone)]
pub struct GlobalStatement {
    pub names: Vec<String>,
    pub range: Range<usize>,
    pub line: usize,
    pub kind: StatementKind,
    /// JSON value of `NAME = <literal>`
    pub literal: Option<Value>,
    pub scan: ScopeScan,
}

#[derive(Debug, Clone)]
pub struct FunctionInfo {
    pub qualified_name: String,
    pub module: String,
    /// Name path inside the module (`["f", "g"]` for `f.g`)
    pub path: Vec<String>,
    pub parent: Option<String>,
    /// Definition including decorators
    pub stmt_range: Range<usize>,
    pub name_range: Range<usize>,
    /// Byte offset of the parameter list's `(`
    pub params_open: usize,
    pub params_empty: bool,
    pub line: usize,
    /// Column of the definition, removed from every line when hoisted
    pub indent: usize,
    pub header: ScopeScan,
    pub body: ScopeScan,
    /// Nested definitions in source order: (name, qualified name)
    pub children: Vec<(String, String)>,
    pub nested_stmt_ranges: Vec<Range<usize>>,
}

impl FunctionInfo {
    pub fn name(&self) -> &str {
        self.path.last().map(String::as_str).unwrap_or("")
    }

    pub fn child(&self, name: &str) -> Option<&str> {
        self.children
            .iter()
            .rev()
            .find(|(n, _)| n == name)
            .map(|(_, qn)| qn.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct ModuleIndex {
    pub name: String,
    pub source: String,
    /// Top-level function name → qualified name
    pub functions: BTreeMap<String, String>,
    pub imports: BTreeMap<String, ImportTarget>,
    pub statements: Vec<GlobalStatement>,
    /// Global name → indices of the statements binding it
    pub globals: BTreeMap<String, Vec<usize>>,
}

impl ModuleIndex {
    /// Local modules this module imports
    pub fn imported_modules<'a>(&'a self, program: &'a ProgramIndex) -> impl Iterator<Item = &'a str> + 'a {
        self.imports.values().filter_map(move |target| {
            let candidates = [
                target
                    .symbol
                    .as_ref()
                    .map(|s| format!("{}.{}", target.module, s)),
                Some(target.module.clone()),
            ];
            candidates
                .into_iter()
                .flatten()
                .find_map(|m| program.modules.get_key_value(&m).map(|(k, _)| k.as_str()))
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct ProgramIndex {
    pub modules: BTreeMap<String, ModuleIndex>,
    pub functions: HashMap<String, FunctionInfo>,
}

impl ProgramIndex {
    pub fn build(parsed: &[ParsedModule]) -> Self {
        let mut index = ProgramIndex::default();
        for module in parsed {
            let module_index = index_module(module, &mut index.functions);
            debug!(
                "Indexed module {}: {} functions, {} imports, {} globals",
                module.name,
                module_index.functions.len(),
                module_index.imports.len(),
                module_index.globals.len()
            );
            index.modules.insert(module.name.clone(), module_index);
        }
        index
    }

    pub fn module(&self, name: &str) -> Result<&ModuleIndex, AnalysisError> {
        self.modules
            .get(name)
            .ok_or_else(|| AnalysisError::ModuleNotFound(name.to_string()))
    }

    pub fn function(&self, qualified_name: &str) -> Option<&FunctionInfo> {
        self.functions.get(qualified_name)
    }

    pub fn is_local_module(&self, name: &str) -> bool {
        self.modules.contains_key(name)
    }
}

fn index_module(parsed: &ParsedModule, functions: &mut HashMap<String, FunctionInfo>) -> ModuleIndex {
    let src = parsed.source.as_str();
    let mut index = ModuleIndex {
        name: parsed.name.clone(),
        source: parsed.source.clone(),
        functions: BTreeMap::new(),
        imports: BTreeMap::new(),
        statements: Vec::new(),
        globals: BTreeMap::new(),
    };

    for stmt in named_children(parsed.root()) {
        match stmt.kind() {
            kinds::FUNCTION_DEF => {
                let qn = index_function(stmt, stmt, &parsed.name, src, None, &[], functions);
                index.functions.insert(text_of_name(stmt, src), qn);
            }
            kinds::DECORATED_DEF => match stmt.child_by_field_name("definition") {
                Some(def) if def.kind() == kinds::FUNCTION_DEF => {
                    let qn = index_function(def, stmt, &parsed.name, src, None, &[], functions);
                    index.functions.insert(text_of_name(def, src), qn);
                }
                _ => push_statement(&mut index, stmt, StatementKind::Class, src),
            },
            kinds::CLASS_DEF => push_statement(&mut index, stmt, StatementKind::Class, src),
            kinds::IMPORT_STATEMENT => index_import(&mut index, stmt, src),
            kinds::IMPORT_FROM_STATEMENT => index_import_from(&mut index, stmt, src),
            kinds::FUTURE_IMPORT_STATEMENT => {}
            kinds::IF_STATEMENT if is_main_guard(stmt, src) => {}
            kinds::EXPRESSION_STATEMENT
                if named_children(stmt).first().map(|c| c.kind())
                    == Some(kinds::ASSIGNMENT) =>
            {
                push_statement(&mut index, stmt, StatementKind::Assignment, src)
            }
            _ => push_statement(&mut index, stmt, StatementKind::Other, src),
        }
    }
    index
}

fn text_of_name(def: Node<'_>, src: &str) -> String {
    def.child_by_field_name("name")
        .map(|n| text(n, src).to_string())
        .unwrap_or_default()
}

fn push_statement(index: &mut ModuleIndex, stmt: Node<'_>, kind: StatementKind, src: &str) {
    let scan = scan_statement(stmt, src);
    let names = scan.bound_names();
    if names.is_empty() {
        return;
    }
    let literal = match kind {
        StatementKind::Assignment => simple_assignment_literal(stmt, src),
        _ => None,
    };
    let position = index.statements.len();
    for name in &names {
        index.globals.entry(name.clone()).or_default().push(position);
    }
    index.statements.push(GlobalStatement {
        names,
        range: stmt.byte_range(),
        line: line_of(stmt),
        kind,
        literal,
        scan,
    });
}

/// `NAME = <literal>` (one plain target, no chaining)
fn simple_assignment_literal(stmt: Node<'_>, src: &str) -> Option<Value> {
    let assignment = named_children(stmt).into_iter().next()?;
    let left = assignment.child_by_field_name("left")?;
    let right = assignment.child_by_field_name("right")?;
    if left.kind() != kinds::IDENTIFIER {
        return None;
    }
    literal_value(right, src)
}

/// JSON value of a literal expression; tuples and sets are left as source so
/// their Python type survives
pub fn literal_value(node: Node<'_>, src: &str) -> Option<Value> {
    match node.kind() {
        kinds::INTEGER => parse_integer(text(node, src)).map(Value::from),
        kinds::FLOAT => text(node, src)
            .replace('_', "")
            .parse::<f64>()
            .ok()
            .and_then(Number::from_f64)
            .map(Value::Number),
        kinds::TRUE => Some(Value::Bool(true)),
        kinds::FALSE => Some(Value::Bool(false)),
        kinds::NONE => Some(Value::Null),
        kinds::STRING => {
            let value = string_literal(node, src)?;
            let raw_prefix = children(node)
                .first()
                .map(|start| text(*start, src).contains(|c: char| c == 'r' || c == 'R'))
                .unwrap_or(false);
            (!value.contains('\\') || raw_prefix).then_some(Value::String(value))
        }
        kinds::UNARY_OPERATOR => {
            let operator = node.child_by_field_name("operator")?;
            let argument = node.child_by_field_name("argument")?;
            if text(operator, src) != "-" {
                return None;
            }
            match literal_value(argument, src)? {
                Value::Number(n) => {
                    if let Some(i) = n.as_i64() {
                        Some(Value::from(-i))
                    } else {
                        n.as_f64()
                            .and_then(|f| Number::from_f64(-f))
                            .map(Value::Number)
                    }
                }
                _ => None,
            }
        }
        kinds::LIST => named_children(node)
            .into_iter()
            .map(|item| literal_value(item, src))
            .collect::<Option<Vec<_>>>()
            .map(Value::Array),
        kinds::DICTIONARY => {
            let mut object = Map::new();
            for pair in named_children(node) {
                if pair.kind() != kinds::PAIR {
                    return None;
                }
                let key = pair.child_by_field_name("key")?;
                let value = pair.child_by_field_name("value")?;
                let Some(Value::String(key)) = literal_value(key, src) else {
                    return None;
                };
                object.insert(key, literal_value(value, src)?);
            }
            Some(Value::Object(object))
        }
        "parenthesized_expression" => literal_value(named_children(node).into_iter().next()?, src),
        _ => None,
    }
}

fn parse_integer(raw: &str) -> Option<i64> {
    let digits = raw.replace('_', "");
    let lower = digits.to_ascii_lowercase();
    if let Some(hex) = lower.strip_prefix("0x") {
        i64::from_str_radix(hex, 16).ok()
    } else if let Some(oct) = lower.strip_prefix("0o") {
        i64::from_str_radix(oct, 8).ok()
    } else if let Some(bin) = lower.strip_prefix("0b") {
        i64::from_str_radix(bin, 2).ok()
    } else {
        lower.parse().ok()
    }
}

fn is_main_guard(stmt: Node<'_>, src: &str) -> bool {
    stmt.child_by_field_name("condition")
        .map(|c| {
            let condition: String = text(c, src).chars().filter(|ch| !ch.is_whitespace()).collect();
            condition == "__name__==\"__main__\"" || condition == "__name__=='__main__'"
        })
        .unwrap_or(false)
}

fn index_import(index: &mut ModuleIndex, stmt: Node<'_>, src: &str) {
    for child in named_children(stmt) {
        let (module, alias, bound) = match child.kind() {
            kinds::DOTTED_NAME => {
                let module = text(child, src).to_string();
                let first = module.split('.').next().unwrap_or_default().to_string();
                (module, first.clone(), first)
            }
            kinds::ALIASED_IMPORT => {
                let (Some(name), Some(alias)) = (
                    child.child_by_field_name("name"),
                    child.child_by_field_name("alias"),
                ) else {
                    continue;
                };
                let module = text(name, src).to_string();
                (module.clone(), text(alias, src).to_string(), module)
            }
            _ => continue,
        };
        index.imports.insert(
            alias,
            ImportTarget {
                module,
                symbol: None,
                bound,
                line: line_of(stmt),
            },
        );
    }
}

fn index_import_from(index: &mut ModuleIndex, stmt: Node<'_>, src: &str) {
    let Some(module_node) = stmt.child_by_field_name("module_name") else {
        return;
    };
    let module = match module_node.kind() {
        kinds::RELATIVE_IMPORT => resolve_relative(&index.name, text(module_node, src)),
        _ => text(module_node, src).to_string(),
    };

    for child in named_children(stmt) {
        if child.id() == module_node.id() {
            continue;
        }
        let (symbol, alias) = match child.kind() {
            kinds::DOTTED_NAME => {
                let name = text(child, src).to_string();
                (name.clone(), name)
            }
            kinds::ALIASED_IMPORT => {
                let (Some(name), Some(alias)) = (
                    child.child_by_field_name("name"),
                    child.child_by_field_name("alias"),
                ) else {
                    continue;
                };
                (text(name, src).to_string(), text(alias, src).to_string())
            }
            _ => continue,
        };
        index.imports.insert(
            alias,
            ImportTarget {
                module: module.clone(),
                symbol: Some(symbol),
                bound: module.clone(),
                line: line_of(stmt),
            },
        );
    }
}

/// `.helpers` inside `pkg.main` → `pkg.helpers`; `..` climbs one package more
pub fn resolve_relative(current: &str, relative: &str) -> String {
    let level = relative.chars().take_while(|c| *c == '.').count();
    let rest = &relative[level..];
    let mut parts: Vec<&str> = current.split('.').collect();
    for _ in 0..level {
        parts.pop();
    }
    if !rest.is_empty() {
        parts.push(rest);
    }
    parts.join(".")
}

fn index_function(
    def: Node<'_>,
    stmt: Node<'_>,
    module: &str,
    src: &str,
    parent: Option<&str>,
    parent_path: &[String],
    functions: &mut HashMap<String, FunctionInfo>,
) -> String {
    let name_node = def.child_by_field_name("name");
    let name = name_node.map(|n| text(n, src).to_string()).unwrap_or_default();
    let mut path = parent_path.to_vec();
    path.push(name);
    let qualified_name = format!("{}.{}", module, path.join("."));

    let scan = scan_function(def, stmt, src);
    let mut children = Vec::with_capacity(scan.nested.len());
    let mut nested_stmt_ranges = Vec::with_capacity(scan.nested.len());
    for nested in &scan.nested {
        let child_qn = index_function(
            nested.def,
            nested.stmt,
            module,
            src,
            Some(&qualified_name),
            &path,
            functions,
        );
        children.push((text_of_name(nested.def, src), child_qn));
        nested_stmt_ranges.push(nested.stmt.byte_range());
    }

    let params = def.child_by_field_name("parameters");
    let info = FunctionInfo {
        qualified_name: qualified_name.clone(),
        module: module.to_string(),
        path,
        parent: parent.map(str::to_string),
        stmt_range: stmt.byte_range(),
        name_range: name_node.map(|n| n.byte_range()).unwrap_or(0..0),
        params_open: params.map(|p| p.start_byte()).unwrap_or(0),
        params_empty: params.map(|p| p.named_child_count() == 0).unwrap_or(true),
        line: line_of(stmt),
        indent: stmt.start_position().column,
        header: scan.header,
        body: scan.body,
        children,
        nested_stmt_ranges,
    };
    functions.insert(qualified_name.clone(), info);
    qualified_name
}
