//! Infra-safe identifiers for attendee resources.
//!
//! Raw usernames arrive from CSV imports and operator input. Cloud providers
//! only accept a narrow alphabet in resource names and logins, so every
//! username is mapped through [`sanitize_identifier`] before it reaches a
//! provisioning template.

use regex::Regex;
use std::sync::OnceLock;

use crate::error::{LabsError, Result};

/// Longest identifier accepted by the provider naming policy.
pub const MAX_IDENTIFIER_LEN: usize = 63;

/// Used when nothing usable survives sanitization.
pub const FALLBACK_IDENTIFIER: &str = "attendee";

static DISALLOWED_RE: OnceLock<Regex> = OnceLock::new();
static SEPARATOR_RUN_RE: OnceLock<Regex> = OnceLock::new();
static POLICY_RE: OnceLock<Regex> = OnceLock::new();

fn disallowed_regex() -> &'static Regex {
    DISALLOWED_RE.get_or_init(|| {
        Regex::new(r"[^a-z0-9_-]").expect("disallowed-character regex is a static pattern")
    })
}

fn separator_run_regex() -> &'static Regex {
    SEPARATOR_RUN_RE
        .get_or_init(|| Regex::new(r"-{2,}").expect("separator regex is a static pattern"))
}

fn policy_regex() -> &'static Regex {
    POLICY_RE.get_or_init(|| {
        Regex::new(r"^[a-z0-9](?:[a-z0-9_-]*[a-z0-9])?$")
            .expect("naming policy regex is a static pattern")
    })
}

/// Map a raw username to an identifier that satisfies the naming policy.
///
/// Lowercases the input, replaces every character outside `[a-z0-9_-]`
/// (dots, spaces, `@`, non-ASCII letters, ...) with `-`, collapses repeated
/// separators and trims separators from both ends. The function is total:
/// any input yields a valid identifier.
///
/// ```
/// use labs_core::naming::sanitize_identifier;
/// assert_eq!(sanitize_identifier("Max.Mustermann"), "max-mustermann");
/// ```
pub fn sanitize_identifier(raw: &str) -> String {
    let lowered = raw.trim().to_lowercase();
    let replaced = disallowed_regex().replace_all(&lowered, "-");
    let collapsed = separator_run_regex().replace_all(&replaced, "-");

    let mut identifier: String = collapsed
        .trim_matches(|c| c == '-' || c == '_')
        .chars()
        .take(MAX_IDENTIFIER_LEN)
        .collect();
    // Truncation can expose a trailing separator again.
    while identifier.ends_with('-') || identifier.ends_with('_') {
        identifier.pop();
    }

    if identifier.is_empty() {
        FALLBACK_IDENTIFIER.to_string()
    } else {
        identifier
    }
}

/// Check an identifier against the provider naming policy.
pub fn validate_identifier(identifier: &str) -> Result<()> {
    if identifier.is_empty() || identifier.len() > MAX_IDENTIFIER_LEN {
        return Err(LabsError::Validation(format!(
            "identifier must be between 1 and {} characters: '{}'",
            MAX_IDENTIFIER_LEN, identifier
        )));
    }

    if !policy_regex().is_match(identifier) {
        return Err(LabsError::Validation(format!(
            "identifier '{}' may only contain a-z, 0-9, '-' and '_' and must start and end alphanumerically",
            identifier
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_dotted_name() {
        assert_eq!(sanitize_identifier("Max.Mustermann"), "max-mustermann");
    }

    #[test]
    fn test_sanitize_email_and_spaces() {
        assert_eq!(
            sanitize_identifier("john.doe@example.com"),
            "john-doe-example-com"
        );
        assert_eq!(sanitize_identifier("Jane  Q Public"), "jane-q-public");
        assert_eq!(sanitize_identifier("  padded  "), "padded");
    }

    #[test]
    fn test_sanitize_keeps_allowed_characters() {
        assert_eq!(sanitize_identifier("user_01-b"), "user_01-b");
    }

    #[test]
    fn test_sanitize_non_ascii() {
        assert_eq!(sanitize_identifier("Jürgen Müller"), "j-rgen-m-ller");
    }

    #[test]
    fn test_sanitize_degenerate_inputs() {
        assert_eq!(sanitize_identifier(""), FALLBACK_IDENTIFIER);
        assert_eq!(sanitize_identifier("@@@"), FALLBACK_IDENTIFIER);
        assert_eq!(sanitize_identifier("..."), FALLBACK_IDENTIFIER);
    }

    #[test]
    fn test_sanitize_truncates() {
        let long = "a".repeat(200);
        assert_eq!(sanitize_identifier(&long).len(), MAX_IDENTIFIER_LEN);

        // A separator landing on the cut point is trimmed as well.
        let mut edge = "b".repeat(MAX_IDENTIFIER_LEN - 1);
        edge.push_str(".tail");
        let sanitized = sanitize_identifier(&edge);
        assert!(!sanitized.ends_with('-'));
        assert!(validate_identifier(&sanitized).is_ok());
    }

    #[test]
    fn test_sanitize_is_deterministic_and_total() {
        let samples = [
            "Max.Mustermann",
            "a.b@c d",
            "~!#$%^&*()",
            "MiXeD_Case-99",
            "tab\tseparated",
            "ünïcödé",
            "-leading-and-trailing-",
            "__under__",
        ];
        for sample in samples {
            let first = sanitize_identifier(sample);
            let second = sanitize_identifier(sample);
            assert_eq!(first, second);
            assert!(
                validate_identifier(&first).is_ok(),
                "{sample:?} produced invalid {first:?}"
            );
        }

        for byte in 0x20u8..0x7f {
            let input = format!("x{}y", byte as char);
            assert!(validate_identifier(&sanitize_identifier(&input)).is_ok());
        }
    }

    #[test]
    fn test_validate_identifier_rejects() {
        assert!(validate_identifier("").is_err());
        assert!(validate_identifier("Upper").is_err());
        assert!(validate_identifier("has.dot").is_err());
        assert!(validate_identifier("-leading").is_err());
        assert!(validate_identifier("trailing_").is_err());
        assert!(validate_identifier(&"a".repeat(MAX_IDENTIFIER_LEN + 1)).is_err());
        assert!(validate_identifier("ok-name_1").is_ok());
    }
}
