//! Helpers for cleaning user-supplied names and keeping paths out of logs.

use std::path::Path;

/// Returns only the filename component of a path (no directory).
///
/// Used when logging so staging directories and storage roots stay private.
pub fn redact_path(path: &Path) -> String {
    path.file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("<unknown>")
        .to_string()
}

/// Reduces an uploaded file name to a single safe path segment.
///
/// - Directory components are dropped (`../../etc/passwd` → `passwd`)
/// - Control characters and separators are replaced with `_`
/// - Empty or dot-only names become `document`
pub fn sanitize_file_name(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or("");

    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_control() || matches!(c, ':' | '*' | '?' | '"' | '<' | '>' | '|') {
                '_'
            } else {
                c
            }
        })
        .collect();

    let trimmed = cleaned.trim();
    if trimmed.is_empty() || trimmed.chars().all(|c| c == '.') {
        return "document".to_string();
    }

    trimmed.to_string()
}

/// Returns the last segment of a storage key.
pub fn key_base_name(key: &str) -> &str {
    key.rsplit('/').next().unwrap_or(key)
}
