//! Scope scanning
//!
//! A `Scanner` walks the statements of one Python scope and records what the
//! analyzer needs to classify names: the locals the scope binds, every
//! identifier read in load position, `object.attr` accesses, string literals
//! and `global` / `nonlocal` declarations. Byte ranges are absolute offsets
//! into the module source so that rewrites can be applied later.
//!
//! Two modes:
//! - nested (`flat == false`): a `def` inside the scope is recorded as a
//!   nested definition and not descended into; it becomes its own CodeNode.
//! - flat (`flat == true`): a `def` is descended into and its free names are
//!   merged into the enclosing scan. Used for module-level statements and
//!   class bodies, whose methods travel as part of the statement.

use std::collections::BTreeSet;
use std::ops::Range;
use tree_sitter::Node;

use crate::features::parsing::node_kinds as kinds;
use crate::features::parsing::parser::{children, line_of, named_children, text};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallShape {
    /// `name(...)`; `open_paren` is the byte offset of `(`
    Args { open_paren: usize, empty: bool },
    /// `name(x for x in xs)`; range of the parenthesised generator
    Generator { range: Range<usize> },
}

/// Identifier read in load position
#[derive(Debug, Clone)]
pub struct NameUse {
    pub name: String,
    pub range: Range<usize>,
    pub line: usize,
    pub call: Option<CallShape>,
    /// First positional argument when it is a plain string literal
    pub first_literal_arg: Option<String>,
    /// Names bound by lambda, comprehension or class scopes around the use
    pub shadowed: BTreeSet<String>,
}

/// `object.attr` where `object` is a bare identifier
#[derive(Debug, Clone)]
pub struct AttrUse {
    pub object: String,
    pub attr: String,
    /// The whole `object.attr` expression
    pub range: Range<usize>,
    pub object_range: Range<usize>,
    pub line: usize,
    pub is_call: bool,
    pub first_literal_arg: Option<String>,
    pub shadowed: BTreeSet<String>,
}

impl AttrUse {
    /// The object identifier as a plain (non-call) name use
    pub fn object_use(&self) -> NameUse {
        NameUse {
            name: self.object.clone(),
            range: self.object_range.clone(),
            line: self.line,
            call: None,
            first_literal_arg: None,
            shadowed: self.shadowed.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StringLiteral {
    pub value: String,
    pub line: usize,
}

#[derive(Debug, Clone, Default)]
pub struct ScopeScan {
    pub locals: BTreeSet<String>,
    pub globals: BTreeSet<String>,
    pub nonlocals: Vec<(String, usize)>,
    pub uses: Vec<NameUse>,
    pub attr_uses: Vec<AttrUse>,
    pub strings: Vec<StringLiteral>,
    /// Identifier targets bound directly in this scope
    pub stores: Vec<NameUse>,
    /// Modules imported inside the scope, with their line
    pub imports: Vec<(String, usize)>,
}

impl ScopeScan {
    /// Distinct stored names in first-binding order
    pub fn bound_names(&self) -> Vec<String> {
        let mut seen = BTreeSet::new();
        self.stores
            .iter()
            .filter(|s| seen.insert(s.name.clone()))
            .map(|s| s.name.clone())
            .collect()
    }
}

/// A `def` found inside a nested-mode scope
#[derive(Debug, Clone, Copy)]
pub struct NestedDef<'t> {
    pub def: Node<'t>,
    /// The decorated definition when there are decorators, else `def`
    pub stmt: Node<'t>,
}

pub struct Scanner<'s, 't> {
    src: &'s str,
    flat: bool,
    scan: ScopeScan,
    nested: Vec<NestedDef<'t>>,
}

/// Header and body of one function definition
pub struct FunctionScan<'t> {
    /// Decorators, defaults, annotations: evaluated in the enclosing scope
    pub header: ScopeScan,
    /// Parameters and body
    pub body: ScopeScan,
    pub nested: Vec<NestedDef<'t>>,
}

/// Scan a function definition in nested mode
pub fn scan_function<'t>(def: Node<'t>, stmt: Node<'t>, src: &str) -> FunctionScan<'t> {
    let mut header = Scanner::new(src, false);
    let mut body = Scanner::new(src, false);

    if stmt.id() != def.id() {
        for decorator in named_children(stmt)
            .into_iter()
            .filter(|c| c.kind() == kinds::DECORATOR)
        {
            header.walk(decorator);
        }
    }
    if let Some(params) = def.child_by_field_name("parameters") {
        header.parameters(params, &mut body);
    }
    if let Some(return_type) = def.child_by_field_name("return_type") {
        header.walk(return_type);
    }
    if let Some(block) = def.child_by_field_name("body") {
        body.walk(block);
    }

    let (header, _) = header.finish();
    let (body, nested) = body.finish();
    FunctionScan {
        header,
        body,
        nested,
    }
}

/// Scan one module-level statement in flat mode
pub fn scan_statement(stmt: Node<'_>, src: &str) -> ScopeScan {
    let mut scanner = Scanner::new(src, true);
    scanner.walk(stmt);
    scanner.finish().0
}

impl<'s, 't> Scanner<'s, 't> {
    pub fn new(src: &'s str, flat: bool) -> Self {
        Self {
            src,
            flat,
            scan: ScopeScan::default(),
            nested: Vec::new(),
        }
    }

    pub fn finish(mut self) -> (ScopeScan, Vec<NestedDef<'t>>) {
        for name in &self.scan.globals {
            self.scan.locals.remove(name);
        }
        (self.scan, self.nested)
    }

    pub fn walk(&mut self, node: Node<'t>) {
        match node.kind() {
            kinds::IDENTIFIER => self.use_name(node, None, None),
            kinds::ATTRIBUTE => self.attribute(node, None),
            kinds::CALL => self.call(node),
            kinds::FUNCTION_DEF => self.function_def(node, node),
            kinds::DECORATED_DEF => self.decorated(node),
            kinds::CLASS_DEF => self.class_def(node),
            kinds::LAMBDA => self.lambda(node),
            kinds::LIST_COMPREHENSION
            | kinds::SET_COMPREHENSION
            | kinds::DICT_COMPREHENSION
            | kinds::GENERATOR_EXPRESSION => self.comprehension(node),
            kinds::ASSIGNMENT => {
                if let Some(left) = node.child_by_field_name("left") {
                    self.declare_targets(left);
                }
                if let Some(ty) = node.child_by_field_name("type") {
                    self.walk(ty);
                }
                if let Some(right) = node.child_by_field_name("right") {
                    self.walk(right);
                }
            }
            kinds::AUGMENTED_ASSIGNMENT => {
                if let Some(left) = node.child_by_field_name("left") {
                    self.declare_targets(left);
                }
                if let Some(right) = node.child_by_field_name("right") {
                    self.walk(right);
                }
            }
            kinds::FOR_STATEMENT | kinds::FOR_IN_CLAUSE => {
                let left = node.child_by_field_name("left");
                if let Some(left) = left {
                    self.declare_targets(left);
                }
                for child in named_children(node) {
                    if Some(child.id()) != left.map(|l| l.id()) {
                        self.walk(child);
                    }
                }
            }
            kinds::NAMED_EXPRESSION => {
                if let Some(name) = node.child_by_field_name("name") {
                    self.declare_targets(name);
                }
                if let Some(value) = node.child_by_field_name("value") {
                    self.walk(value);
                }
            }
            kinds::AS_PATTERN => {
                let alias = node.child_by_field_name("alias");
                for child in named_children(node) {
                    if Some(child.id()) != alias.map(|a| a.id()) {
                        self.walk(child);
                    } else if child.named_child_count() == 0 {
                        // aliased identifier leaf
                        self.declare(child);
                    } else {
                        self.declare_targets(child);
                    }
                }
            }
            kinds::EXCEPT_CLAUSE => {
                let mut after_as = false;
                for child in children(node) {
                    if !child.is_named() {
                        after_as = child.kind() == "as";
                        continue;
                    }
                    if after_as {
                        self.declare_targets(child);
                        after_as = false;
                    } else {
                        self.walk(child);
                    }
                }
            }
            kinds::GLOBAL_STATEMENT => {
                for child in named_children(node) {
                    if child.kind() == kinds::IDENTIFIER {
                        self.scan.globals.insert(text(child, self.src).to_string());
                    }
                }
            }
            kinds::NONLOCAL_STATEMENT => {
                for child in named_children(node) {
                    if child.kind() == kinds::IDENTIFIER {
                        self.scan
                            .nonlocals
                            .push((text(child, self.src).to_string(), line_of(child)));
                    }
                }
            }
            kinds::IMPORT_STATEMENT => self.import(node),
            kinds::IMPORT_FROM_STATEMENT => self.import_from(node),
            kinds::FUTURE_IMPORT_STATEMENT => {}
            kinds::KEYWORD_ARGUMENT => {
                if let Some(value) = node.child_by_field_name("value") {
                    self.walk(value);
                }
            }
            kinds::STRING => match string_literal(node, self.src) {
                Some(value) => self.scan.strings.push(StringLiteral {
                    value,
                    line: line_of(node),
                }),
                None => {
                    for child in named_children(node)
                        .into_iter()
                        .filter(|c| c.kind() == kinds::INTERPOLATION)
                    {
                        self.walk(child);
                    }
                }
            },
            _ => {
                for child in named_children(node) {
                    self.walk(child);
                }
            }
        }
    }

    fn use_name(&mut self, node: Node<'t>, call: Option<CallShape>, first_literal_arg: Option<String>) {
        self.scan.uses.push(NameUse {
            name: text(node, self.src).to_string(),
            range: node.byte_range(),
            line: line_of(node),
            call,
            first_literal_arg,
            shadowed: BTreeSet::new(),
        });
    }

    fn declare(&mut self, node: Node<'t>) {
        let name = text(node, self.src).to_string();
        self.scan.locals.insert(name.clone());
        self.scan.stores.push(NameUse {
            name,
            range: node.byte_range(),
            line: line_of(node),
            call: None,
            first_literal_arg: None,
            shadowed: BTreeSet::new(),
        });
    }

    fn declare_targets(&mut self, node: Node<'t>) {
        match node.kind() {
            kinds::IDENTIFIER => self.declare(node),
            kind if kinds::is_target_container(kind) => {
                for child in named_children(node) {
                    self.declare_targets(child);
                }
            }
            // attribute / subscript targets read their object
            _ => self.walk(node),
        }
    }

    fn call(&mut self, node: Node<'t>) {
        let arguments = node.child_by_field_name("arguments");
        let shape = arguments.map(|args| match args.kind() {
            kinds::GENERATOR_EXPRESSION => CallShape::Generator {
                range: args.byte_range(),
            },
            _ => CallShape::Args {
                open_paren: args.start_byte(),
                empty: named_children(args).is_empty(),
            },
        });
        let first_literal_arg = arguments
            .filter(|args| args.kind() == kinds::ARGUMENT_LIST)
            .and_then(|args| named_children(args).into_iter().next())
            .filter(|first| first.kind() == kinds::STRING)
            .and_then(|first| string_literal(first, self.src));

        if let Some(function) = node.child_by_field_name("function") {
            match function.kind() {
                kinds::IDENTIFIER => self.use_name(function, shape, first_literal_arg),
                kinds::ATTRIBUTE => self.attribute(function, Some(first_literal_arg)),
                _ => self.walk(function),
            }
        }
        if let Some(args) = arguments {
            self.walk(args);
        }
    }

    /// `call` is `Some(first literal argument)` when the attribute is called
    fn attribute(&mut self, node: Node<'t>, call: Option<Option<String>>) {
        let Some(object) = node.child_by_field_name("object") else {
            return;
        };
        if object.kind() != kinds::IDENTIFIER {
            self.walk(object);
            return;
        }
        let attr = node
            .child_by_field_name("attribute")
            .map(|a| text(a, self.src).to_string())
            .unwrap_or_default();
        self.scan.attr_uses.push(AttrUse {
            object: text(object, self.src).to_string(),
            attr,
            range: node.byte_range(),
            object_range: object.byte_range(),
            line: line_of(node),
            is_call: call.is_some(),
            first_literal_arg: call.flatten(),
            shadowed: BTreeSet::new(),
        });
    }

    fn decorated(&mut self, node: Node<'t>) {
        let Some(definition) = node.child_by_field_name("definition") else {
            return;
        };
        if definition.kind() == kinds::FUNCTION_DEF && !self.flat {
            self.function_def(definition, node);
            return;
        }
        for decorator in named_children(node)
            .into_iter()
            .filter(|c| c.kind() == kinds::DECORATOR)
        {
            self.walk(decorator);
        }
        self.walk(definition);
    }

    fn function_def(&mut self, def: Node<'t>, stmt: Node<'t>) {
        if let Some(name) = def.child_by_field_name("name") {
            self.declare(name);
        }
        if !self.flat {
            self.nested.push(NestedDef { def, stmt });
            return;
        }

        let mut inner = Scanner::new(self.src, true);
        if let Some(params) = def.child_by_field_name("parameters") {
            self.parameters(params, &mut inner);
        }
        if let Some(return_type) = def.child_by_field_name("return_type") {
            self.walk(return_type);
        }
        if let Some(body) = def.child_by_field_name("body") {
            inner.walk(body);
        }
        self.absorb(inner.finish().0);
    }

    fn class_def(&mut self, node: Node<'t>) {
        if let Some(name) = node.child_by_field_name("name") {
            self.declare(name);
        }
        if let Some(bases) = node.child_by_field_name("superclasses") {
            self.walk(bases);
        }
        let mut inner = Scanner::new(self.src, true);
        if let Some(body) = node.child_by_field_name("body") {
            inner.walk(body);
        }
        self.absorb(inner.finish().0);
    }

    fn lambda(&mut self, node: Node<'t>) {
        let mut inner = Scanner::new(self.src, true);
        if let Some(params) = node.child_by_field_name("parameters") {
            self.parameters(params, &mut inner);
        }
        if let Some(body) = node.child_by_field_name("body") {
            inner.walk(body);
        }
        self.absorb(inner.finish().0);
    }

    /// Comprehension variables live in their own scope
    fn comprehension(&mut self, node: Node<'t>) {
        let mut inner = Scanner::new(self.src, self.flat);
        for child in named_children(node) {
            inner.walk(child);
        }
        let (scan, nested) = inner.finish();
        self.nested.extend(nested);
        self.absorb(scan);
    }

    /// Declare parameter names in `inner`; defaults and annotations are
    /// evaluated here
    fn parameters(&mut self, params: Node<'t>, inner: &mut Scanner<'_, 't>) {
        for param in named_children(params) {
            match param.kind() {
                kinds::IDENTIFIER => inner.declare(param),
                kinds::LIST_SPLAT_PATTERN | kinds::DICT_SPLAT_PATTERN => {
                    if let Some(name) = first_identifier(param) {
                        inner.declare(name);
                    }
                }
                kinds::TYPED_PARAMETER => {
                    if let Some(name) = first_identifier(param) {
                        inner.declare(name);
                    }
                    if let Some(ty) = param.child_by_field_name("type") {
                        self.walk(ty);
                    }
                }
                kinds::DEFAULT_PARAMETER | kinds::TYPED_DEFAULT_PARAMETER => {
                    if let Some(name) = param.child_by_field_name("name") {
                        inner.declare(name);
                    }
                    if let Some(ty) = param.child_by_field_name("type") {
                        self.walk(ty);
                    }
                    if let Some(value) = param.child_by_field_name("value") {
                        self.walk(value);
                    }
                }
                _ => {}
            }
        }
    }

    fn import(&mut self, node: Node<'t>) {
        for child in named_children(node) {
            match child.kind() {
                kinds::DOTTED_NAME => {
                    let module = text(child, self.src).to_string();
                    if let Some(first) = named_children(child).into_iter().next() {
                        self.declare(first);
                    }
                    self.scan.imports.push((module, line_of(node)));
                }
                kinds::ALIASED_IMPORT => {
                    if let Some(alias) = child.child_by_field_name("alias") {
                        self.declare(alias);
                    }
                    if let Some(name) = child.child_by_field_name("name") {
                        self.scan
                            .imports
                            .push((text(name, self.src).to_string(), line_of(node)));
                    }
                }
                _ => {}
            }
        }
    }

    fn import_from(&mut self, node: Node<'t>) {
        let module_node = node.child_by_field_name("module_name");
        let module = module_node
            .map(|m| text(m, self.src).to_string())
            .unwrap_or_default();
        self.scan.imports.push((module.clone(), line_of(node)));

        for child in named_children(node) {
            if Some(child.id()) == module_node.map(|m| m.id()) {
                continue;
            }
            let (name, alias) = match child.kind() {
                kinds::DOTTED_NAME => (child, child),
                kinds::ALIASED_IMPORT => match (
                    child.child_by_field_name("name"),
                    child.child_by_field_name("alias"),
                ) {
                    (Some(name), Some(alias)) => (name, alias),
                    _ => continue,
                },
                _ => continue,
            };
            self.declare(alias);
            self.scan.imports.push((
                format!("{}.{}", module, text(name, self.src)),
                line_of(node),
            ));
        }
    }

    /// Merge the free names of an inner flat scope. Uses that escape it
    /// remember what the inner scope bound around them.
    fn absorb(&mut self, inner: ScopeScan) {
        let ScopeScan {
            locals,
            nonlocals,
            uses,
            attr_uses,
            strings,
            imports,
            ..
        } = inner;
        self.scan.uses.extend(
            uses.into_iter()
                .filter(|u| !locals.contains(&u.name))
                .map(|mut u| {
                    u.shadowed.extend(locals.iter().cloned());
                    u
                }),
        );
        self.scan.attr_uses.extend(
            attr_uses
                .into_iter()
                .filter(|a| !locals.contains(&a.object))
                .map(|mut a| {
                    a.shadowed.extend(locals.iter().cloned());
                    a
                }),
        );
        self.scan.strings.extend(strings);
        self.scan.imports.extend(imports);
        self.scan.nonlocals.extend(nonlocals);
    }
}

fn first_identifier(node: Node<'_>) -> Option<Node<'_>> {
    if node.kind() == kinds::IDENTIFIER {
        return Some(node);
    }
    named_children(node).into_iter().find_map(first_identifier)
}

/// Raw content of a plain string literal; `None` for f-strings, bytes and
/// interpolated strings
pub fn string_literal(node: Node<'_>, src: &str) -> Option<String> {
    let mut value = String::new();
    for child in children(node) {
        match child.kind() {
            kinds::STRING_START => {
                let prefix = text(child, src).trim_end_matches(|c: char| c == '"' || c == '\'');
                if prefix.chars().any(|c| matches!(c, 'f' | 'F' | 'b' | 'B')) {
                    return None;
                }
            }
            kinds::STRING_CONTENT | kinds::ESCAPE_SEQUENCE => value.push_str(text(child, src)),
            kinds::INTERPOLATION => return None,
            _ => {}
        }
    }
    Some(value)
}
