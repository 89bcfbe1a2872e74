//! Structured-output extraction from assistant text.
//!
//! LLM responses wrap JSON in markdown fences, prose, or nothing at all.
//! The helpers here locate the payload without panicking: fenced code
//! blocks first, then the first balanced JSON object in free text.

/// Extracts the body of the first fenced code block carrying `language` as
/// its info string (e.g. ```` ```json ````). Returns the block content
/// without the fences.
pub fn extract_fenced_block(text: &str, language: &str) -> Option<String> {
    let mut body: Vec<&str> = Vec::new();
    let mut in_block = false;

    for line in text.lines() {
        let trimmed = line.trim_start();
        if !in_block {
            if let Some(info) = trimmed.strip_prefix("```") {
                if info.trim() == language {
                    in_block = true;
                }
            }
        } else if trimmed.starts_with("```") {
            return Some(body.join("\n"));
        } else {
            body.push(line);
        }
    }
    // Unterminated fence: treat the remainder as the block body.
    if in_block && !body.is_empty() {
        return Some(body.join("\n"));
    }
    None
}

/// Finds the first balanced JSON object in `text`, skipping brackets inside
/// string literals and honoring escapes.
pub fn extract_first_json_object(text: &str) -> Option<&str> {
    let mut depth = 0usize;
    let mut start = None;
    let mut in_string = false;
    let mut escape_next = false;

    for (i, ch) in text.char_indices() {
        if escape_next {
            escape_next = false;
            continue;
        }
        match ch {
            '\\' if in_string => escape_next = true,
            '"' => in_string = !in_string,
            '{' if !in_string => {
                if depth == 0 {
                    start = Some(i);
                }
                depth += 1;
            }
            '}' if !in_string => {
                if depth == 0 {
                    continue;
                }
                depth -= 1;
                if depth == 0 {
                    if let Some(s) = start {
                        return Some(&text[s..=i]);
                    }
                }
            }
            _ => {}
        }
    }
    None
}

/// Extracts a structured output value from assistant text: a ```json fenced
/// block wins, then the first balanced object anywhere in the text. Only
/// values that parse as JSON objects qualify.
pub fn extract_structured_output(text: &str) -> Option<serde_json::Value> {
    let candidate = extract_fenced_block(text, "json")
        .or_else(|| extract_first_json_object(text).map(str::to_string))?;
    match serde_json::from_str::<serde_json::Value>(&candidate) {
        Ok(value) if value.is_object() => Some(value),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_fenced_block_with_language_tag() {
        let text = "before\n```json\n{\"a\": 1}\n```\nafter";
        assert_eq!(extract_fenced_block(text, "json").unwrap(), "{\"a\": 1}");
    }

    #[test]
    fn test_fenced_block_wrong_language_is_skipped() {
        let text = "```yaml\nkey: value\n```";
        assert!(extract_fenced_block(text, "json").is_none());
    }

    #[test]
    fn test_unterminated_fence_uses_remainder() {
        let text = "```json\n{\"a\": 1}";
        assert_eq!(extract_fenced_block(text, "json").unwrap(), "{\"a\": 1}");
    }

    #[test]
    fn test_first_json_object_in_prose() {
        let text = "The result is {\"status\": \"ok\"} as requested.";
        assert_eq!(
            extract_first_json_object(text).unwrap(),
            "{\"status\": \"ok\"}"
        );
    }

    #[test]
    fn test_braces_inside_strings_do_not_close_the_object() {
        let text = r#"{"msg": "literal } brace", "n": 1}"#;
        assert_eq!(extract_first_json_object(text).unwrap(), text);
    }

    #[test]
    fn test_escaped_quotes_inside_strings() {
        let text = r#"{"msg": "quote \" and } brace"}"#;
        assert_eq!(extract_first_json_object(text).unwrap(), text);
    }

    #[test]
    fn test_structured_output_prefers_fenced_block() {
        let text = "intro {\"loose\": true}\n```json\n{\"fenced\": true}\n```";
        assert_eq!(
            extract_structured_output(text).unwrap(),
            json!({"fenced": true})
        );
    }

    #[test]
    fn test_structured_output_rejects_non_objects() {
        assert!(extract_structured_output("```json\n[1, 2]\n```").is_none());
        assert!(extract_structured_output("no json here").is_none());
    }
}
