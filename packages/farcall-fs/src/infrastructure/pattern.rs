//! Glob patterns shared by the local and remote implementations
//!
//! Remote listings are filtered locally with the same matcher, so both code
//! paths agree on what a pattern selects.

use regex::Regex;

use crate::{FsError, Result};

/// Compiled glob
#[derive(Debug, Clone)]
pub struct GlobPattern {
    source: String,
    regex: Regex,
    match_full_path: bool,
}

impl GlobPattern {
    pub fn new(pattern: &str) -> Result<Self> {
        if pattern.is_empty() {
            return Err(FsError::InvalidPattern {
                pattern: pattern.to_string(),
                reason: "empty pattern".to_string(),
            });
        }

        let mut rx = String::from("^");
        let mut rest = pattern;
        while !rest.is_empty() {
            if let Some(tail) = rest.strip_prefix("**/") {
                rx.push_str("(?:.*/)?");
                rest = tail;
            } else if let Some(tail) = rest.strip_prefix("**") {
                rx.push_str(".*");
                rest = tail;
            } else {
                let mut chars = rest.chars();
                let c = chars.next().unwrap_or_default();
                match c {
                    '*' => rx.push_str("[^/]*"),
                    '?' => rx.push_str("[^/]"),
                    other => rx.push_str(&regex::escape(&other.to_string())),
                }
                rest = chars.as_str();
            }
        }
        rx.push('$');

        let regex = Regex::new(&rx).map_err(|e| FsError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })?;

        Ok(Self {
            source: pattern.to_string(),
            regex,
            match_full_path: pattern.contains('/'),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Match a `/`-separated path relative to the search root
    pub fn matches(&self, relative: &str) -> bool {
        if self.match_full_path {
            self.regex.is_match(relative)
        } else {
            let name = relative.rsplit('/').next().unwrap_or(relative);
            self.regex.is_match(name)
        }
    }
}
