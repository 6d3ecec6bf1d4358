//! Byte-range source edits

use std::ops::Range;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Edit {
    pub start: usize,
    pub end: usize,
    pub text: String,
}

impl Edit {
    pub fn replace(range: Range<usize>, text: impl Into<String>) -> Self {
        Self {
            start: range.start,
            end: range.end,
            text: text.into(),
        }
    }

    pub fn insert(at: usize, text: impl Into<String>) -> Self {
        Self {
            start: at,
            end: at,
            text: text.into(),
        }
    }
}

/// Apply edits to `source[range]`. Edit offsets are absolute; edits outside
/// the range or overlapping an already applied edit are skipped.
///
/// Edits are applied back to front. At equal start a replacement goes
/// before an insertion, so the inserted text lands in front of it.
pub fn apply_edits(source: &str, range: Range<usize>, mut edits: Vec<Edit>) -> String {
    let base = range.start;
    let mut out = source.get(range.clone()).unwrap_or("").to_string();
    edits.sort_by(|a, b| (b.start, b.end).cmp(&(a.start, a.end)));
    edits.dedup();

    let mut applied_from = range.end;
    for edit in edits {
        if edit.start < range.start || edit.end > range.end {
            continue;
        }
        if edit.end > applied_from {
            warn!(
                "Skipping overlapping edit at {}..{} ({:?})",
                edit.start, edit.end, edit.text
            );
            continue;
        }
        out.replace_range(edit.start - base..edit.end - base, &edit.text);
        applied_from = edit.start;
    }
    out
}

/// Remove up to `indent` columns of leading whitespace from every line but
/// the first (which starts at the definition itself)
pub fn dedent(text: &str, indent: usize) -> String {
    if indent == 0 {
        return text.to_string();
    }
    text.split('\n')
        .enumerate()
        .map(|(i, line)| {
            if i == 0 {
                return line;
            }
            let strip = line
                .bytes()
                .take(indent)
                .take_while(|b| *b == b' ' || *b == b'\t')
                .count();
            &line[strip..]
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_edits_apply_back_to_front() {
        let source = "x = g(a)";
        let edits = vec![
            Edit::replace(4..5, "f__g"),
            Edit::insert(6, "y, "),
            Edit::replace(6..7, "b"),
        ];
        assert_eq!(apply_edits(source, 0..source.len(), edits), "x = f__g(y, b)");
    }

    #[test]
    fn test_edits_are_relative_to_range() {
        let source = "pad\ndef g(z):\n    return z\n";
        let start = 4;
        let edits = vec![Edit::replace(8..9, "f__g"), Edit::insert(10, "y, ")];
        assert_eq!(
            apply_edits(source, start..source.len(), edits),
            "def f__g(y, z):\n    return z\n"
        );
    }

    #[test]
    fn test_overlapping_edit_is_skipped() {
        let source = "abcdef";
        let edits = vec![Edit::replace(1..4, "X"), Edit::replace(2..5, "Y")];
        assert_eq!(apply_edits(source, 0..6, edits), "abYf");
    }

    #[test]
    fn test_dedent_keeps_relative_indentation() {
        let text = "def g(z):\n        if z:\n            return z\n        return 0";
        assert_eq!(
            dedent(text, 4),
            "def g(z):\n    if z:\n        return z\n    return 0"
        );
    }
}
