//! Payload cleanup helpers shared by the worker and planning agents.
//!
//! Model output routinely arrives wrapped in markdown fences or with prose
//! around a JSON object; everything here normalizes that before the payload
//! touches the ledger or the repository.

use serde_json::Value;

/// Strip a surrounding markdown code fence from a model payload.
///
/// Handles an optional language tag on the opening fence and leading/trailing
/// prose outside the fence. Payloads without a fence pass through unchanged.
pub fn strip_code_fences(payload: &str) -> String {
    let trimmed = payload.trim();
    let Some(open) = trimmed.find("```") else {
        return trimmed.to_string();
    };
    let after_open = &trimmed[open + 3..];
    let Some(close) = after_open.rfind("```") else {
        return trimmed.to_string();
    };
    let inner = &after_open[..close];
    // Drop the language tag line, if any
    let inner = match inner.split_once('\n') {
        Some((first, rest)) if !first.trim().contains(' ') => {
            if first.trim().is_empty() || first.trim().chars().all(|c| c.is_alphanumeric()) {
                rest
            } else {
                inner
            }
        }
        _ => inner,
    };
    inner.trim_matches('\n').to_string()
}

/// Extract the first JSON object embedded in a model response.
///
/// Fences are stripped first, then the outermost `{ .. }` span is parsed.
pub fn extract_json_object(payload: &str) -> Option<Value> {
    let cleaned = strip_code_fences(payload);
    if let Ok(value) = serde_json::from_str::<Value>(&cleaned) {
        if value.is_object() {
            return Some(value);
        }
    }
    let start = cleaned.find('{')?;
    let end = cleaned.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str::<Value>(&cleaned[start..=end])
        .ok()
        .filter(|v| v.is_object())
}

/// Whether a payload looks binary rather than text.
///
/// JSON transport already guarantees valid UTF-8, so embedded NUL bytes are
/// the remaining signal worth checking.
pub fn looks_binary(payload: &str) -> bool {
    payload.contains('\0')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_payload_untouched() {
        assert_eq!(strip_code_fences("def add(a, b):\n    return a + b"), "def add(a, b):\n    return a + b");
    }

    #[test]
    fn test_fence_with_language_tag() {
        let payload = "```python\ndef add(a, b):\n    return a + b\n```";
        assert_eq!(strip_code_fences(payload), "def add(a, b):\n    return a + b");
    }

    #[test]
    fn test_fence_without_language_tag() {
        let payload = "```\nhello\n```";
        assert_eq!(strip_code_fences(payload), "hello");
    }

    #[test]
    fn test_fence_with_surrounding_prose() {
        let payload = "Here is the file:\n```rust\nfn main() {}\n```\nLet me know!";
        assert_eq!(strip_code_fences(payload), "fn main() {}");
    }

    #[test]
    fn test_extract_json_from_prose() {
        let payload = "Sure, the metrics are:\n{\"tests_passed\": 0.9, \"coverage\": 0.7}\nHope that helps.";
        let value = extract_json_object(payload).unwrap();
        assert_eq!(value["tests_passed"], 0.9);
    }

    #[test]
    fn test_extract_json_from_fenced_block() {
        let payload = "```json\n{\"src\": {\"main.py\": null}}\n```";
        let value = extract_json_object(payload).unwrap();
        assert!(value["src"].is_object());
    }

    #[test]
    fn test_extract_json_rejects_non_object() {
        assert!(extract_json_object("[1, 2, 3]").is_none());
        assert!(extract_json_object("no json here").is_none());
    }

    #[test]
    fn test_binary_probe() {
        assert!(looks_binary("PNG\0\0header"));
        assert!(!looks_binary("plain text"));
    }
}
