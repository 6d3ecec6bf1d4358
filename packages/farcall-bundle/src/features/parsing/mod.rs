//! Parsing feature - tree-sitter Python front end

pub mod node_kinds;
pub mod parser;

pub use parser::{parse_module, parse_modules, ParsedModule};
