//! Structured extraction of JSON from knowledge-source text
//!
//! Responses arrive wrapped in code fences, surrounded by prose, or with
//! junk in front of the payload. Malformed text is an expected input, so
//! only the final "nothing parses" case is an error.
//!
//! Known limitation: bracket depth is counted character by character and
//! does not skip string literals. A string value holding an unbalanced
//! brace can end the span early; the fallback scan then moves on to the
//! next opening bracket.

use crate::error::HedgeError;
use crate::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

/// What to do when no JSON can be recovered
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionPolicy {
    /// Fail with `ExtractionError`
    #[default]
    Strict,
    /// Substitute an empty object (opt-in; hides upstream corruption)
    EmptyOnFailure,
}

/// Recover the first well-formed JSON object or array from `text`.
pub fn extract(text: &str) -> Result<Value> {
    let clean = strip_fences(text);

    if let Some(value) = extract_primary(clean) {
        return Ok(value);
    }

    if let Some(value) = scan_all(clean) {
        debug!("Recovered JSON through fallback scan");
        return Ok(value);
    }

    Err(HedgeError::ExtractionError(format!(
        "No valid JSON object or array found | raw={}",
        preview(text)
    )))
}

/// `extract`, with the caller's failure policy applied.
pub fn extract_with_policy(text: &str, policy: ExtractionPolicy) -> Result<Value> {
    match (extract(text), policy) {
        (Ok(value), _) => Ok(value),
        (Err(_), ExtractionPolicy::EmptyOnFailure) => {
            debug!("Extraction failed, substituting empty object");
            Ok(Value::Object(serde_json::Map::new()))
        }
        (Err(e), ExtractionPolicy::Strict) => Err(e),
    }
}

/// Drop one leading ```/```json fence and one trailing ``` fence.
fn strip_fences(text: &str) -> &str {
    let mut s = text.trim();

    if let Some(rest) = s.strip_prefix("```") {
        s = match rest.get(..4) {
            Some(tag) if tag.eq_ignore_ascii_case("json") => &rest[4..],
            _ => rest,
        };
    }

    if let Some(rest) = s.trim_end().strip_suffix("```") {
        s = rest;
    }

    s.trim()
}

/// Steps 2-3: start at whichever of `{` / `[` comes first.
fn extract_primary(text: &str) -> Option<Value> {
    let first_obj = text.find('{');
    let first_arr = text.find('[');

    let (start, open, close) = match (first_obj, first_arr) {
        (Some(o), Some(a)) if a < o => (a, b'[', b']'),
        (Some(o), _) => (o, b'{', b'}'),
        (None, Some(a)) => (a, b'[', b']'),
        (None, None) => return None,
    };

    parse_span(text, start, open, close)
}

/// Step 4: try every opening bracket in order.
fn scan_all(text: &str) -> Option<Value> {
    text.bytes().enumerate().find_map(|(i, b)| match b {
        b'{' => parse_span(text, i, b'{', b'}'),
        b'[' => parse_span(text, i, b'[', b']'),
        _ => None,
    })
}

fn parse_span(text: &str, start: usize, open: u8, close: u8) -> Option<Value> {
    let end = find_matching_bracket(text.as_bytes(), start, open, close)?;
    serde_json::from_str(&text[start..=end]).ok()
}

/// Index where depth of `open`/`close` returns to zero, counting from `start`.
fn find_matching_bracket(bytes: &[u8], start: usize, open: u8, close: u8) -> Option<usize> {
    let mut depth = 0usize;
    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if b == open {
            depth += 1;
        } else if b == close {
            depth = depth.checked_sub(1)?;
            if depth == 0 {
                return Some(i);
            }
        }
    }
    None
}

fn preview(text: &str) -> String {
    const MAX: usize = 200;
    match text.char_indices().nth(MAX) {
        Some((idx, _)) => format!("{}…", &text[..idx]),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_plain_object() {
        assert_eq!(extract(r#"{"a": 1}"#).unwrap(), json!({"a": 1}));
    }

    #[test]
    fn test_fenced_json_block() {
        let text = "```json\n{\"factors\": [{\"id\": \"f_001\"}]}\n```";
        assert_eq!(
            extract(text).unwrap(),
            json!({"factors": [{"id": "f_001"}]})
        );

        let upper = "```JSON\n[1, 2]\n```";
        assert_eq!(extract(upper).unwrap(), json!([1, 2]));
    }

    #[test]
    fn test_array_before_object_is_preferred() {
        let text = r#"Here you go: ["chip export ban", {"x": 1}] trailing"#;
        assert_eq!(extract(text).unwrap(), json!(["chip export ban", {"x": 1}]));
    }

    #[test]
    fn test_object_before_array_is_preferred() {
        let text = r#"Result: {"scores": [1, 2]} and [3]"#;
        assert_eq!(extract(text).unwrap(), json!({"scores": [1, 2]}));
    }

    #[test]
    fn test_prose_around_payload() {
        let text = "Sure! Based on my research:\n{\"ticker\": \"AAPL\"}\nLet me know if you need more.";
        assert_eq!(extract(text).unwrap(), json!({"ticker": "AAPL"}));
    }

    #[test]
    fn test_no_json_fails() {
        let err = extract("no json here at all").unwrap_err();
        assert!(matches!(err, HedgeError::ExtractionError(_)));
    }

    #[test]
    fn test_fallback_scan_skips_malformed_span() {
        let value = extract("blah {bad json} then {\"a\":1}").unwrap();
        assert_eq!(value, json!({"a": 1}));
    }

    #[test]
    fn test_unbalanced_span_fails() {
        assert!(extract("{\"a\": [1, 2}").is_err());
        assert!(extract("}]").is_err());
    }

    #[test]
    fn test_balanced_braces_inside_strings_survive() {
        let text = r#"{"template": "{ticker} drivers"}"#;
        assert_eq!(extract(text).unwrap(), json!({"template": "{ticker} drivers"}));
    }

    #[test]
    fn test_unbalanced_brace_in_string_is_known_limitation() {
        // The depth scan closes at the quoted brace, so the first object is lost.
        let text = r#"{"note": "x}"} then {"b": 2}"#;
        assert_eq!(extract(text).unwrap(), json!({"b": 2}));

        assert!(extract(r#"{"note": "x}"}"#).is_err());
    }

    #[test]
    fn test_policy_empty_on_failure() {
        let value = extract_with_policy("nothing", ExtractionPolicy::EmptyOnFailure).unwrap();
        assert_eq!(value, json!({}));

        let err = extract_with_policy("nothing", ExtractionPolicy::Strict);
        assert!(err.is_err());
    }

    #[test]
    fn test_preview_truncates_long_text() {
        let long = "x".repeat(500);
        let err = extract(&long).unwrap_err().to_string();
        assert!(err.len() < 300);
    }
}
