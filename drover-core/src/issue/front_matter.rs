//! YAML front matter handling for issue files.
//!
//! A proper YAML round trip, not line splitting: colon-bearing values like
//! URLs must survive parse → serialize → parse unchanged.

use std::collections::BTreeMap;

use anyhow::{Context, Result};

use super::naming::ids_in;

/// Parsed front matter: an ordered key/value map of YAML scalars and
/// structures.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrontMatter(pub BTreeMap<String, serde_yaml::Value>);

impl FrontMatter {
    pub fn parse(yaml: &str) -> Result<Self> {
        let map: BTreeMap<String, serde_yaml::Value> =
            serde_yaml::from_str(yaml).context("invalid YAML front matter")?;
        Ok(Self(map))
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(&self.0).context("front matter not serializable")
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|v| v.as_str())
    }

    /// Priority from a `priority: P2` (or bare `2`) entry.
    pub fn priority(&self) -> Option<u8> {
        match self.0.get("priority")? {
            serde_yaml::Value::Number(n) => n.as_u64().and_then(|v| u8::try_from(v).ok()),
            serde_yaml::Value::String(s) => {
                s.trim().trim_start_matches(['P', 'p']).parse::<u8>().ok()
            }
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Split a document into optional front matter block and body.
///
/// The front matter is a leading fenced block:
/// ```text
/// ---
/// key: value
/// ---
/// body…
/// ```
pub fn split_document(content: &str) -> (Option<&str>, &str) {
    let rest = match content.strip_prefix("---\n").or_else(|| content.strip_prefix("---\r\n")) {
        Some(rest) => rest,
        None => return (None, content),
    };
    for terminator in ["\n---\n", "\n---\r\n"] {
        if let Some(end) = rest.find(terminator) {
            return (Some(&rest[..end]), &rest[end + terminator.len()..]);
        }
    }
    if let Some(stripped) = rest.strip_suffix("\n---") {
        return (Some(stripped), "");
    }
    (None, content)
}

/// Reassemble a document from front matter and body.
pub fn join_document(front_matter: Option<&FrontMatter>, body: &str) -> Result<String> {
    match front_matter {
        Some(fm) if !fm.is_empty() => {
            let yaml = fm.to_yaml()?;
            Ok(format!("---\n{yaml}---\n{body}"))
        }
        _ => Ok(body.to_string()),
    }
}

/// First H1 near the top of the body.
pub fn extract_title(body: &str) -> Option<String> {
    body.lines()
        .take(10)
        .find_map(|l| l.strip_prefix("# "))
        .map(|t| t.trim().to_string())
}

/// Issue IDs listed under a `## Blocked By` (or `## Depends On`) section,
/// one bulleted line each.
pub fn extract_blocked_by(body: &str) -> Vec<String> {
    let mut ids = Vec::new();
    let mut in_section = false;
    for line in body.lines() {
        let trimmed = line.trim();
        if let Some(heading) = trimmed.strip_prefix("## ") {
            let heading = heading.trim().to_ascii_lowercase();
            in_section = heading == "blocked by" || heading == "depends on";
            continue;
        }
        if in_section && (trimmed.starts_with('-') || trimmed.starts_with('*')) {
            ids.extend(ids_in(trimmed));
        }
    }
    ids
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = "---\npriority: P1\nstatus: open\ngithub_issue: https://github.com/o/r/issues/9\n---\n# Fix the crash\n\nBody text.\n\n## Blocked By\n\n- BUG-3\n- ENH-12\n";

    #[test]
    fn split_extracts_block_and_body() {
        let (fm, body) = split_document(DOC);
        assert!(fm.unwrap().contains("priority: P1"));
        assert!(body.starts_with("# Fix the crash"));
    }

    #[test]
    fn split_without_front_matter_returns_whole_body() {
        let (fm, body) = split_document("# Title\n\nText\n");
        assert!(fm.is_none());
        assert_eq!(body, "# Title\n\nText\n");
    }

    #[test]
    fn colon_bearing_values_survive_round_trip() {
        let (fm_str, _) = split_document(DOC);
        let fm = FrontMatter::parse(fm_str.unwrap()).unwrap();
        assert_eq!(
            fm.get_str("github_issue"),
            Some("https://github.com/o/r/issues/9")
        );

        let reserialized = fm.to_yaml().unwrap();
        let reparsed = FrontMatter::parse(&reserialized).unwrap();
        assert_eq!(fm, reparsed);
    }

    #[test]
    fn priority_accepts_p_prefixed_and_bare_numbers() {
        let fm = FrontMatter::parse("priority: P2\n").unwrap();
        assert_eq!(fm.priority(), Some(2));
        let fm = FrontMatter::parse("priority: 0\n").unwrap();
        assert_eq!(fm.priority(), Some(0));
        let fm = FrontMatter::parse("priority: urgent\n").unwrap();
        assert_eq!(fm.priority(), None);
    }

    #[test]
    fn title_found_near_top() {
        let (_, body) = split_document(DOC);
        assert_eq!(extract_title(body).as_deref(), Some("Fix the crash"));
        assert!(extract_title("no heading\n").is_none());
    }

    #[test]
    fn blocked_by_section_yields_ids() {
        let (_, body) = split_document(DOC);
        assert_eq!(extract_blocked_by(body), vec!["BUG-3", "ENH-12"]);
    }

    #[test]
    fn depends_on_heading_also_recognized() {
        let body = "# T\n\n## Depends On\n\n* REF-1\n\n## Notes\n\n- BUG-9 unrelated bullet\n";
        assert_eq!(extract_blocked_by(body), vec!["REF-1"]);
    }

    #[test]
    fn join_round_trips_document() {
        let (fm_str, body) = split_document(DOC);
        let fm = FrontMatter::parse(fm_str.unwrap()).unwrap();
        let joined = join_document(Some(&fm), body).unwrap();
        let (fm2_str, body2) = split_document(&joined);
        let fm2 = FrontMatter::parse(fm2_str.unwrap()).unwrap();
        assert_eq!(fm, fm2);
        assert_eq!(body, body2);
    }
}
