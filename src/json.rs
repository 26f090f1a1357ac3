//! Recovery of JSON values from raw model output.
//!
//! Structured clients are expected to hand the orchestrator a parsed JSON
//! value. Models routinely wrap their answer in markdown fences or add a
//! sentence of commentary, so client implementations run the raw text
//! through [`recover_json`] before returning.

use crate::client::ClientError;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

static OPENING_FENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\A\s*```(?:json)?[ \t]*\r?\n").expect("valid fence regex"));

static CLOSING_FENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\r?\n\s*```\s*\z").expect("valid fence regex"));

/// Removes a leading ```` ```json ```` (or bare ```` ``` ````) fence and a
/// trailing ```` ``` ```` fence, then trims surrounding whitespace.
#[must_use]
pub fn strip_code_fences(text: &str) -> &str {
    let start = OPENING_FENCE.find(text).map_or(0, |m| m.end());
    let rest = &text[start..];
    let end = CLOSING_FENCE.find(rest).map_or(rest.len(), |m| m.start());
    rest[..end].trim()
}

/// Returns the first balanced JSON object or array in `text` that parses.
///
/// The whole (trimmed) text is tried first. Otherwise every `{` or `[` is
/// tried as a start position; the scan tracks string literals and escapes
/// so braces inside strings do not count.
#[must_use]
pub fn extract_first_json(text: &str) -> Option<Value> {
    let text = text.trim();
    if let Ok(value) = serde_json::from_str::<Value>(text) {
        return Some(value);
    }

    let bytes = text.as_bytes();
    bytes
        .iter()
        .enumerate()
        .filter(|(_, b)| matches!(b, b'{' | b'['))
        .find_map(|(start, _)| {
            let end = balanced_end(bytes, start)?;
            serde_json::from_str::<Value>(&text[start..=end]).ok()
        })
}

/// Finds the index of the bracket closing the one at `start`.
///
/// Returns `None` on a mismatched closer or when the input ends first.
fn balanced_end(bytes: &[u8], start: usize) -> Option<usize> {
    let mut stack: Vec<u8> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for (offset, &byte) in bytes[start..].iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if byte == b'\\' {
                escaped = true;
            } else if byte == b'"' {
                in_string = false;
            }
            continue;
        }

        match byte {
            b'"' => in_string = true,
            b'{' | b'[' => stack.push(byte),
            b'}' | b']' => {
                let opener = stack.pop()?;
                if !matches!((opener, byte), (b'{', b'}') | (b'[', b']')) {
                    return None;
                }
                if stack.is_empty() {
                    return Some(start + offset);
                }
            }
            _ => {}
        }
    }

    None
}

/// Strips fences and extracts the first JSON value from a raw response.
///
/// # Errors
///
/// Returns [`ClientError::InvalidResponse`] carrying the raw text when no
/// parseable JSON value is found.
pub fn recover_json(raw: &str) -> Result<Value, ClientError> {
    let cleaned = strip_code_fences(raw);
    extract_first_json(cleaned).ok_or_else(|| {
        ClientError::InvalidResponse(format!("could not parse JSON from response: {raw}"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_strip_code_fences() {
        assert_eq!(strip_code_fences("```json\n{\"a\": 1}\n```"), "{\"a\": 1}");
        assert_eq!(strip_code_fences("```JSON\n[1]\n```  "), "[1]");
        assert_eq!(strip_code_fences("```\n{}\n```"), "{}");
        assert_eq!(strip_code_fences("  {\"plain\": true}  "), "{\"plain\": true}");
    }

    #[test]
    fn test_extract_whole_text() {
        assert_eq!(extract_first_json(" {\"a\": 1} "), Some(json!({"a": 1})));
    }

    #[test]
    fn test_extract_with_commentary() {
        let raw = "Here is the budget you asked for:\n{\"total\": 10, \"items\": []}\nLet me know!";
        assert_eq!(
            extract_first_json(raw),
            Some(json!({"total": 10, "items": []}))
        );
    }

    #[test]
    fn test_extract_ignores_braces_in_strings() {
        let raw = r#"note {"text": "a } tricky \" { value", "n": 2} trailing"#;
        assert_eq!(
            extract_first_json(raw),
            Some(json!({"text": "a } tricky \" { value", "n": 2}))
        );
    }

    #[test]
    fn test_extract_skips_unparseable_candidate() {
        let raw = "{not json} then [1, 2, 3]";
        assert_eq!(extract_first_json(raw), Some(json!([1, 2, 3])));
    }

    #[test]
    fn test_extract_mismatched_brackets() {
        assert_eq!(extract_first_json("{ ] "), None);
        assert_eq!(extract_first_json("{\"open\": 1"), None);
    }

    #[test]
    fn test_extract_non_ascii_content() {
        let raw = "Presupuesto: {\"descripción\": \"capacitación\"}";
        assert_eq!(
            extract_first_json(raw),
            Some(json!({"descripción": "capacitación"}))
        );
    }

    #[test]
    fn test_recover_json() {
        let value = recover_json("```json\n{\"currency\": \"USD\"}\n```").unwrap();
        assert_eq!(value["currency"], "USD");

        let err = recover_json("no json here").unwrap_err();
        assert!(matches!(err, ClientError::InvalidResponse(_)));
        assert!(err.to_string().contains("no json here"));
    }
}
