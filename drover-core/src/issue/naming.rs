//! The on-disk naming grammar for issue files.
//!
//! A single regex is the grammar: `P<n>-<PREFIX>-<N>-<slug>.md` with the
//! leading `P<n>-` optional for backward compatibility. Files that do not
//! match are ignored by discovery, never rejected.

use std::sync::OnceLock;

use regex::Regex;

/// Pieces extracted from an issue file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedName {
    /// Priority from the optional `P<n>-` prefix.
    pub priority: Option<u8>,
    /// Category prefix, e.g. `BUG`.
    pub prefix: String,
    /// Issue number within the category.
    pub number: u64,
    /// Trailing slug, may be empty.
    pub slug: String,
}

impl ParsedName {
    /// The issue ID, e.g. `BUG-419`.
    pub fn id(&self) -> String {
        format!("{}-{}", self.prefix, self.number)
    }
}

fn file_name_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(?:P(\d+)-)?([A-Z][A-Z0-9]*)-(\d+)(?:-([A-Za-z0-9][A-Za-z0-9._-]*))?\.md$")
            .expect("issue file name regex is valid")
    })
}

/// Parse an issue file name. Returns `None` for anything outside the grammar.
pub fn parse_file_name(name: &str) -> Option<ParsedName> {
    let caps = file_name_regex().captures(name)?;
    let priority = caps.get(1).and_then(|m| m.as_str().parse::<u8>().ok());
    // A P-prefix that overflows u8 is outside the grammar.
    if caps.get(1).is_some() && priority.is_none() {
        return None;
    }
    let number = caps.get(3)?.as_str().parse::<u64>().ok()?;
    Some(ParsedName {
        priority,
        prefix: caps.get(2)?.as_str().to_string(),
        number,
        slug: caps.get(4).map(|m| m.as_str().to_string()).unwrap_or_default(),
    })
}

fn id_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b([A-Z][A-Z0-9]*-\d+)\b").expect("issue id regex is valid"))
}

/// Extract all issue IDs mentioned in a line of text.
pub fn ids_in(text: &str) -> Vec<String> {
    id_regex()
        .captures_iter(text)
        .map(|c| c[1].to_string())
        .collect()
}

/// Lowercase a string into a filesystem/branch-safe slug.
pub fn slugify(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut last_dash = true;
    for c in s.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
    }
    while out.ends_with('-') {
        out.pop();
    }
    out
}
