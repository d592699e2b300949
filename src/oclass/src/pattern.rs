//! Wildcard pattern matching over class names
//!
//! Three pattern modes, chosen by inspecting the caller's string:
//! - empty: match everything (full listing)
//! - no wildcards: exact, case-sensitive equality (served by the fast path,
//!   never by a cache scan)
//! - `*`/`?` present: glob, case-insensitive against the full name
//!
//! Module (dylib) filters always match glob-style and unanchored, so
//! `*Foundation*` and plain `Foundation` both hit
//! `/System/Library/Frameworks/Foundation.framework/Foundation`.

use regex::Regex;

use crate::query::QueryError;

/// Compiled class-name pattern.
#[derive(Debug, Clone)]
pub enum NamePattern {
    /// Empty pattern: every class matches.
    Any,
    /// No wildcards: exact case-sensitive equality.
    Exact(String),
    /// `*`/`?` glob, case-insensitive, anchored to the whole name.
    Glob(Regex),
}

impl NamePattern {
    pub fn parse(pattern: &str) -> Result<Self, QueryError> {
        if pattern.is_empty() {
            return Ok(NamePattern::Any);
        }
        if !pattern.contains('*') && !pattern.contains('?') {
            return Ok(NamePattern::Exact(pattern.to_string()));
        }
        Ok(NamePattern::Glob(glob_regex(pattern, true)?))
    }

    pub fn matches(&self, name: &str) -> bool {
        match self {
            NamePattern::Any => true,
            NamePattern::Exact(literal) => name == literal,
            NamePattern::Glob(re) => re.is_match(name),
        }
    }

    /// The literal name, when this pattern routes to the fast path.
    pub fn as_exact(&self) -> Option<&str> {
        match self {
            NamePattern::Exact(literal) => Some(literal),
            _ => None,
        }
    }
}

/// Filter over the image/dylib path a class was loaded from.
#[derive(Debug, Clone)]
pub struct ModuleFilter(Regex);

impl ModuleFilter {
    pub fn parse(pattern: &str) -> Result<Self, QueryError> {
        Ok(ModuleFilter(glob_regex(pattern, false)?))
    }

    /// An unresolved path never matches.
    pub fn matches(&self, path: Option<&str>) -> bool {
        path.is_some_and(|p| self.0.is_match(p))
    }
}

/// Translate a `*`/`?` glob into a case-insensitive regex: escape
/// everything, then rewrite the escaped wildcards.
fn glob_regex(pattern: &str, anchored: bool) -> Result<Regex, QueryError> {
    let translated = regex::escape(pattern)
        .replace(r"\*", ".*")
        .replace(r"\?", ".");
    let source = if anchored {
        format!("(?i)^{translated}$")
    } else {
        format!("(?i){translated}")
    };
    Regex::new(&source).map_err(|err| QueryError::InvalidPattern {
        pattern: pattern.to_string(),
        reason: err.to_string(),
    })
}
