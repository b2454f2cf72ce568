//! Secret redaction for captured engine output.
//!
//! Compose prints interpolated environment values on some errors, and env files carry
//! passwords from install forms. Anything headed for a log line or `last_error` passes
//! through [`redact_string`] first.

use regex::Regex;
use std::sync::LazyLock;

/// Longest engine output tail kept in `last_error`.
pub const MAX_ERROR_CHARS: usize = 2_000;

static SECRET_PATTERNS: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    vec![
        // GitHub tokens (ghp_, gho_, ghu_, ghs_, ghr_)
        (
            Regex::new(r"(ghp|gho|ghu|ghs|ghr)_[a-zA-Z0-9_]{36,255}").unwrap(),
            "[GITHUB_TOKEN_REDACTED]",
        ),
        // Bearer tokens
        (
            Regex::new(r"(?i)bearer\s+[a-zA-Z0-9_\-\.]{20,}").unwrap(),
            "[BEARER_REDACTED]",
        ),
        // Connection strings with inline credentials
        (
            Regex::new(r#"(?i)(postgres|postgresql|mysql|mariadb|mongodb|redis)://[^\s'"]+:[^\s'"]+@[^\s'"]+"#)
                .unwrap(),
            "[CONNECTION_STRING_REDACTED]",
        ),
        // KEY=value assignments whose key names a secret
        (
            Regex::new(
                r#"(?i)([A-Z0-9_]*(PASSWORD|PASSWD|SECRET|TOKEN|API_?KEY)[A-Z0-9_]*)\s*[:=]\s*['"]?[^\s'"]+['"]?"#,
            )
            .unwrap(),
            "$1=[REDACTED]",
        ),
    ]
});

/// Redact secrets from a plain string value.
pub fn redact_string(input: &str) -> String {
    let mut result = input.to_string();
    for (pattern, replacement) in SECRET_PATTERNS.iter() {
        result = pattern.replace_all(&result, *replacement).to_string();
    }
    result
}

/// Redact and keep only the last [`MAX_ERROR_CHARS`] characters.
pub fn error_tail(input: &str) -> String {
    let redacted = redact_string(input.trim());
    let count = redacted.chars().count();
    if count <= MAX_ERROR_CHARS {
        return redacted;
    }
    redacted.chars().skip(count - MAX_ERROR_CHARS).collect()
}
