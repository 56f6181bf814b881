//! Sub-path filters for `Snapshot::get_all_files`.
//!
//! Patterns use `glob` syntax with `/` as a hard separator: `*` stays within
//! one segment, `**` spans any number of whole segments (including none).
//! Alternation groups such as `{**/*,*}.{yaml,yml,json}` are expanded up
//! front into one `glob::Pattern` per alternative.

use glob::{MatchOptions, Pattern};

use crate::error::{Result, StoreError};

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

#[derive(Debug, Clone)]
pub(crate) struct PathMatcher {
    alternatives: Vec<Pattern>,
}

impl PathMatcher {
    pub fn compile(pattern: &str) -> Result<Self> {
        let invalid = |reason: String| StoreError::Glob {
            pattern: pattern.to_string(),
            reason,
        };

        let alternatives = expand_braces(pattern)
            .map_err(invalid)?
            .iter()
            .map(|alternative| Pattern::new(alternative).map_err(|e| invalid(e.to_string())))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { alternatives })
    }

    pub fn matches(&self, path: &str) -> bool {
        self.alternatives
            .iter()
            .any(|pattern| pattern.matches_with(path, MATCH_OPTIONS))
    }
}

/// Expands every `{a,b,...}` group, innermost alternatives included.
/// Character classes (`[...]`) are copied through untouched.
fn expand_braces(pattern: &str) -> std::result::Result<Vec<String>, String> {
    let Some((open, close)) = find_group(pattern)? else {
        return Ok(vec![pattern.to_string()]);
    };

    let prefix = &pattern[..open];
    let body = &pattern[open + 1..close];
    let suffix = &pattern[close + 1..];

    let mut expanded = Vec::new();
    for alternative in split_alternatives(body) {
        let candidate = format!("{prefix}{alternative}{suffix}");
        expanded.extend(expand_braces(&candidate)?);
    }
    Ok(expanded)
}

/// Byte offsets of the first top-level `{` and its matching `}`.
fn find_group(pattern: &str) -> std::result::Result<Option<(usize, usize)>, String> {
    let mut depth = 0usize;
    let mut open = None;
    let mut in_class = false;

    for (i, c) in pattern.char_indices() {
        match c {
            '[' if !in_class => in_class = true,
            ']' if in_class => in_class = false,
            _ if in_class => {}
            '{' => {
                if depth == 0 {
                    open = Some(i);
                }
                depth += 1;
            }
            '}' => {
                if depth == 0 {
                    return Err(format!("unmatched '}}' at offset {i}"));
                }
                depth -= 1;
                if depth == 0 {
                    if let Some(start) = open {
                        return Ok(Some((start, i)));
                    }
                }
            }
            _ => {}
        }
    }

    match open {
        Some(start) => Err(format!("unmatched '{{' at offset {start}")),
        None => Ok(None),
    }
}

/// Splits a group body on commas that are not nested in a deeper group.
fn split_alternatives(body: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;

    for (i, c) in body.char_indices() {
        match c {
            '{' => depth += 1,
            '}' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                parts.push(&body[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&body[start..]);
    parts
}
