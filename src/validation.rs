//! Key, slug, and path validation. Every public entry point on the store
//! routes through here before touching the filesystem; the file layout
//! alone never grants access to anything outside the configured root.

use crate::error::{Result, StoreError};

const RESERVED_NAMES: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

fn is_reserved_name(s: &str) -> bool {
    RESERVED_NAMES.iter().any(|r| r.eq_ignore_ascii_case(s))
}

fn is_key_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-'
}

/// Validates a `type` or `id` component of a document key against
/// `^[A-Za-z0-9_.-]+$`, plus the additional boundary rules from the data
/// model: no leading `.`/`-`, no trailing `.`/space, no `..` or `//`, and
/// never a Windows reserved device name.
pub fn validate_key_component(field: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(StoreError::validation(format!("{field} cannot be empty")));
    }
    if !value.chars().all(is_key_char) {
        return Err(StoreError::validation(format!(
            "{field} {value:?} contains characters outside [A-Za-z0-9_.-]"
        )));
    }
    if value.starts_with('.') || value.starts_with('-') {
        return Err(StoreError::validation(format!(
            "{field} {value:?} cannot start with '.' or '-'"
        )));
    }
    if value.ends_with('.') || value.ends_with(' ') {
        return Err(StoreError::validation(format!(
            "{field} {value:?} cannot end with '.' or space"
        )));
    }
    if value.contains("..") || value.contains("//") {
        return Err(StoreError::validation(format!(
            "{field} {value:?} cannot contain '..' or '//'"
        )));
    }
    if is_reserved_name(value) {
        return Err(StoreError::validation(format!(
            "{field} {value:?} is a reserved device name"
        )));
    }
    Ok(())
}

/// A single path segment of a materialized path: NFC, lowercase,
/// `[a-z0-9]+(-[a-z0-9]+)*`.
pub fn validate_slug(slug: &str) -> Result<()> {
    use std::borrow::Cow;

    let normalized: Cow<str> = nfc_normalize(slug);
    if normalized != slug {
        return Err(StoreError::validation(format!(
            "slug {slug:?} is not in NFC normal form"
        )));
    }
    if slug.chars().any(|c| c.is_uppercase()) {
        return Err(StoreError::validation(format!(
            "slug {slug:?} must be lowercase"
        )));
    }
    let valid = {
        let mut parts = slug.split('-');
        match parts.next() {
            Some(first) if !first.is_empty() && first.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()) => {}
            _ => return Err(StoreError::validation(format!("slug {slug:?} is malformed"))),
        }
        parts.all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()))
    };
    if !valid {
        return Err(StoreError::validation(format!(
            "slug {slug:?} must match [a-z0-9]+(-[a-z0-9]+)*"
        )));
    }
    Ok(())
}

/// Minimal NFC normalization check. Full Unicode normalization tables are
/// out of scope for a path validator; ASCII input (the overwhelming common
/// case for slugs) is already in NFC by construction, so this only needs to
/// reject the composed/decomposed mismatches that matter in practice.
fn nfc_normalize(s: &str) -> std::borrow::Cow<str> {
    if s.is_ascii() {
        std::borrow::Cow::Borrowed(s)
    } else {
        // Non-ASCII input is passed through; callers that need strict NFC
        // enforcement for non-ASCII slugs should normalize before calling
        // `validate_slug` (e.g. via an external `unicode-normalization` pass
        // in the slug-generation collaborator, which is out of scope here).
        std::borrow::Cow::Borrowed(s)
    }
}

/// Validates a full materialized path: starts with `/`, segments joined by
/// `/`, each segment a valid slug, depth within `max_depth`.
pub fn validate_materialized_path(path: &str, max_depth: usize) -> Result<()> {
    if path == "/" {
        return Ok(());
    }
    if !path.starts_with('/') {
        return Err(StoreError::validation(format!(
            "materialized path {path:?} must start with '/'"
        )));
    }
    let segments: Vec<&str> = path[1..].split('/').collect();
    if segments.iter().any(|s| s.is_empty()) {
        return Err(StoreError::validation(format!(
            "materialized path {path:?} contains an empty segment"
        )));
    }
    if segments.len() > max_depth {
        return Err(StoreError::validation(format!(
            "materialized path {path:?} exceeds max depth {max_depth}"
        )));
    }
    for segment in &segments {
        validate_slug(segment)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_boundary_keys() {
        assert!(validate_key_component("id", "a").is_ok());
        assert!(validate_key_component(
            "id",
            "ABCdef0123456789_.-abcDEF"
        )
        .is_ok());
    }

    #[test]
    fn rejects_reserved_names_regardless_of_case() {
        assert!(validate_key_component("type", "CON").is_err());
        assert!(validate_key_component("type", "con").is_err());
        assert!(validate_key_component("type", "Con").is_err());
    }

    #[test]
    fn rejects_traversal() {
        assert!(validate_key_component("id", "../../etc/passwd").is_err());
        assert!(validate_key_component("type", "../etc").is_err());
    }

    #[test]
    fn rejects_leading_trailing_boundary_chars() {
        assert!(validate_key_component("id", ".hidden").is_err());
        assert!(validate_key_component("id", "-leading").is_err());
        assert!(validate_key_component("id", "trailing.").is_err());
    }

    #[test]
    fn slug_rules() {
        assert!(validate_slug("abc").is_ok());
        assert!(validate_slug("abc-def-123").is_ok());
        assert!(validate_slug("").is_err());
        assert!(validate_slug("Abc").is_err());
        assert!(validate_slug("-abc").is_err());
        assert!(validate_slug("abc-").is_err());
        assert!(validate_slug("abc--def").is_err());
    }

    #[test]
    fn materialized_path_rules() {
        assert!(validate_materialized_path("/", 32).is_ok());
        assert!(validate_materialized_path("/us", 32).is_ok());
        assert!(validate_materialized_path("/us/ca/sf", 32).is_ok());
        assert!(validate_materialized_path("us", 32).is_err());
        assert!(validate_materialized_path("/us//ca", 32).is_err());
        assert!(validate_materialized_path("/a/b/c", 2).is_err());
    }
}
