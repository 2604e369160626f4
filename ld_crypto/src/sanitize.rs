//! ABOUTME: Guard rail between decrypted query strings and the storage back end
//! ABOUTME: Comment stripping, keyword allow-list, length cap, deny patterns

use ld_core::{Error, Result};
use regex::Regex;
use std::sync::OnceLock;

const MAX_QUERY_LENGTH: usize = 10_000;

const ALLOWED_LEADING_KEYWORDS: &[&str] = &[
    "SELECT", "INSERT", "UPDATE", "DELETE", "WITH", "CALL", "EXEC", "EXECUTE",
];

fn line_comments() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"--[^\r\n]*").expect("static regex"))
}

fn block_comments() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)/\*.*?\*/").expect("static regex"))
}

fn whitespace() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\s+").expect("static regex"))
}

fn deny_patterns() -> &'static [(Regex, &'static str)] {
    static PATTERNS: OnceLock<Vec<(Regex, &'static str)>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            (
                r"(?i);\s*(create|alter|drop|truncate|grant|revoke)\b",
                "chained DDL statement",
            ),
            (r"(?i)\bunion\b[\s\S]+\bselect\b", "union-chained select"),
            (r"--\s*$", "trailing comment"),
            (r"(?i)\binformation_schema\b", "system catalog reference"),
            (r"(?i)\bpg_[a-z_]+", "system catalog reference"),
            (r"(?i)\bmysql\s*\.", "system catalog reference"),
            (r"(?i)\b(xp|sp)_[a-z_]+", "extended procedure reference"),
        ]
        .into_iter()
        .map(|(pattern, label)| (Regex::new(pattern).expect("static regex"), label))
        .collect()
    })
}

/// Normalize and vet a query string before it reaches the storage back end.
///
/// Returns the collapsed, comment-free query, or a validation error naming
/// the class of rejection (never echoing the offending fragment).
pub fn sanitize_query(query: &str) -> Result<String> {
    let stripped = block_comments().replace_all(query, " ");
    let stripped = line_comments().replace_all(&stripped, " ");
    let collapsed = whitespace().replace_all(&stripped, " ").trim().to_string();

    if collapsed.is_empty() {
        return Err(Error::validation("query is empty"));
    }

    let leading = collapsed
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .to_uppercase();
    if !ALLOWED_LEADING_KEYWORDS.contains(&leading.as_str()) {
        return Err(Error::validation(format!(
            "query must start with one of: {}",
            ALLOWED_LEADING_KEYWORDS.join(", ")
        )));
    }

    if collapsed.len() > MAX_QUERY_LENGTH {
        return Err(Error::validation(format!(
            "query exceeds {MAX_QUERY_LENGTH} characters"
        )));
    }

    for (pattern, label) in deny_patterns() {
        if pattern.is_match(&collapsed) {
            return Err(Error::validation(format!("query rejected: {label}")));
        }
    }

    Ok(collapsed)
}
