//! PII redaction.
//!
//! Two mechanisms, applied when redaction is enabled on the logger:
//!
//! - **Pattern redaction**: email, phone, SSN, and card-number shapes inside
//!   any string value are replaced with [`REDACTED`].
//! - **Field redaction**: any map key whose lowercased name contains one of
//!   the sensitive markers has its entire value replaced, regardless of
//!   content.
//!
//! Recursion stops at [`MAX_DEPTH`] nested levels; deeper values are
//! replaced with [`DEPTH_LIMIT`].

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

/// Sentinel substituted for redacted content.
pub const REDACTED: &str = "[REDACTED]";

/// Sentinel substituted for values past the recursion limit.
pub const DEPTH_LIMIT: &str = "[DEPTH_LIMIT]";

/// Maximum nesting depth the redactor walks.
pub const MAX_DEPTH: usize = 5;

static EMAIL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}").unwrap());

static CARD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b\d{4}[ -]?\d{4}[ -]?\d{4}[ -]?\d{4}\b").unwrap());

static SSN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b\d{3}-\d{2}-\d{4}\b").unwrap());

static PHONE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\+?\d{1,3}[-. ]?\(?\d{3}\)?[-. ]?\d{3}[-. ]?\d{4}\b").unwrap());

/// Key-name markers that trigger whole-value replacement.
const SENSITIVE_MARKERS: [&str; 5] = ["password", "secret", "token", "key", "authorization"];

/// Whether a field name is sensitive by name alone.
pub fn is_sensitive_key(key: &str) -> bool {
    let lower = key.to_lowercase();
    SENSITIVE_MARKERS.iter().any(|m| lower.contains(m))
}

/// Replace PII patterns inside a string. Card and SSN shapes are matched
/// before the looser phone shape so a partial overlap cannot leak digits.
pub fn redact_str(input: &str) -> String {
    let pass = CARD.replace_all(input, REDACTED);
    let pass = SSN.replace_all(&pass, REDACTED);
    let pass = EMAIL.replace_all(&pass, REDACTED);
    let pass = PHONE.replace_all(&pass, REDACTED);
    pass.into_owned()
}

/// Recursively redact a JSON value.
pub fn redact_value(value: &Value, depth: usize) -> Value {
    if depth > MAX_DEPTH {
        return Value::String(DEPTH_LIMIT.to_string());
    }
    match value {
        Value::String(s) => Value::String(redact_str(s)),
        Value::Array(items) => Value::Array(
            items.iter().map(|v| redact_value(v, depth + 1)).collect(),
        ),
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (key, val) in map {
                if is_sensitive_key(key) {
                    out.insert(key.clone(), Value::String(REDACTED.to_string()));
                } else {
                    out.insert(key.clone(), redact_value(val, depth + 1));
                }
            }
            Value::Object(out)
        }
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn emails_are_masked() {
        assert_eq!(
            redact_str("contact alice@example.com today"),
            format!("contact {} today", REDACTED)
        );
    }

    #[test]
    fn cards_and_ssns_are_masked() {
        assert_eq!(redact_str("card 4111 1111 1111 1111"), format!("card {}", REDACTED));
        assert_eq!(redact_str("ssn 123-45-6789 on file"), format!("ssn {} on file", REDACTED));
    }

    #[test]
    fn phones_are_masked() {
        assert_eq!(redact_str("call +1 415-555-2671"), format!("call {}", REDACTED));
    }

    #[test]
    fn plain_text_is_untouched() {
        assert_eq!(redact_str("nothing to hide here"), "nothing to hide here");
    }

    #[test]
    fn sensitive_keys_lose_their_values() {
        let input = json!({
            "apiToken": "abc123",
            "Password": "hunter2",
            "note": "ok",
            "nested": {"client_secret": "shh", "plain": "fine"}
        });
        let out = redact_value(&input, 0);
        assert_eq!(out["apiToken"], REDACTED);
        assert_eq!(out["Password"], REDACTED);
        assert_eq!(out["note"], "ok");
        assert_eq!(out["nested"]["client_secret"], REDACTED);
        assert_eq!(out["nested"]["plain"], "fine");
    }

    #[test]
    fn depth_limit_applies() {
        let deep = json!({"a": {"b": {"c": {"d": {"e": {"f": {"g": "too deep"}}}}}}});
        let out = redact_value(&deep, 0);
        assert_eq!(out["a"]["b"]["c"]["d"]["e"]["f"], DEPTH_LIMIT);
    }

    #[test]
    fn non_strings_pass_through() {
        let input = json!({"count": 7, "ratio": 0.5, "on": true, "none": null});
        assert_eq!(redact_value(&input, 0), input);
    }
}
