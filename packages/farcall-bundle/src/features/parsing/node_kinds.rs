//! Python node kinds (tree-sitter-python grammar)

pub const MODULE: &str = "module";
pub const FUNCTION_DEF: &str = "function_definition";
pub const CLASS_DEF: &str = "class_definition";
pub const DECORATED_DEF: &str = "decorated_definition";
pub const DECORATOR: &str = "decorator";
pub const LAMBDA: &str = "lambda";
pub const PARAMETERS: &str = "parameters";
pub const LAMBDA_PARAMETERS: &str = "lambda_parameters";
pub const DEFAULT_PARAMETER: &str = "default_parameter";
pub const TYPED_PARAMETER: &str = "typed_parameter";
pub const TYPED_DEFAULT_PARAMETER: &str = "typed_default_parameter";
pub const LIST_SPLAT_PATTERN: &str = "list_splat_pattern";
pub const DICT_SPLAT_PATTERN: &str = "dictionary_splat_pattern";
pub const IDENTIFIER: &str = "identifier";
pub const ATTRIBUTE: &str = "attribute";
pub const CALL: &str = "call";
pub const ARGUMENT_LIST: &str = "argument_list";
pub const GENERATOR_EXPRESSION: &str = "generator_expression";
pub const LIST_COMPREHENSION: &str = "list_comprehension";
pub const SET_COMPREHENSION: &str = "set_comprehension";
pub const DICT_COMPREHENSION: &str = "dictionary_comprehension";
pub const KEYWORD_ARGUMENT: &str = "keyword_argument";
pub const EXPRESSION_STATEMENT: &str = "expression_statement";
pub const ASSIGNMENT: &str = "assignment";
pub const AUGMENTED_ASSIGNMENT: &str = "augmented_assignment";
pub const NAMED_EXPRESSION: &str = "named_expression";
pub const FOR_STATEMENT: &str = "for_statement";
pub const FOR_IN_CLAUSE: &str = "for_in_clause";
pub const AS_PATTERN: &str = "as_pattern";
pub const EXCEPT_CLAUSE: &str = "except_clause";
pub const GLOBAL_STATEMENT: &str = "global_statement";
pub const NONLOCAL_STATEMENT: &str = "nonlocal_statement";
pub const IMPORT_STATEMENT: &str = "import_statement";
pub const IMPORT_FROM_STATEMENT: &str = "import_from_statement";
pub const FUTURE_IMPORT_STATEMENT: &str = "future_import_statement";
pub const ALIASED_IMPORT: &str = "aliased_import";
pub const DOTTED_NAME: &str = "dotted_name";
pub const RELATIVE_IMPORT: &str = "relative_import";
pub const IMPORT_PREFIX: &str = "import_prefix";
pub const WILDCARD_IMPORT: &str = "wildcard_import";
pub const IF_STATEMENT: &str = "if_statement";
pub const STRING: &str = "string";
pub const STRING_START: &str = "string_start";
pub const STRING_CONTENT: &str = "string_content";
pub const INTERPOLATION: &str = "interpolation";
pub const ESCAPE_SEQUENCE: &str = "escape_sequence";
pub const INTEGER: &str = "integer";
pub const FLOAT: &str = "float";
pub const TRUE: &str = "true";
pub const FALSE: &str = "false";
pub const NONE: &str = "none";
pub const LIST: &str = "list";
pub const DICTIONARY: &str = "dictionary";
pub const PAIR: &str = "pair";
pub const UNARY_OPERATOR: &str = "unary_operator";

/// Target shapes that bind every identifier inside them
pub fn is_target_container(kind: &str) -> bool {
    matches!(
        kind,
        "pattern_list"
            | "tuple_pattern"
            | "list_pattern"
            | "tuple"
            | "list"
            | "parenthesized_expression"
            | "list_splat_pattern"
            | "list_splat"
            | "as_pattern_target"
    )
}
