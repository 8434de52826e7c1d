//! Message content sanitization before it is fed back into any prompt
//! (spec §3, Message invariant c): strip chain-of-thought `<think>...</think>`
//! blocks and any trailing tool-call JSON object.

use once_cell::sync::Lazy;
use regex::Regex;

static THINK_BLOCK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<think>.*?</think>").expect("valid regex"));

/// Strip `<think>...</think>` reasoning blocks and a trailing tool-call JSON
/// object (a `{...}` object that is the entire remaining tail of the
/// message after trimming), then trim surrounding whitespace.
pub fn sanitize_for_memory(content: &str) -> String {
    let without_think = THINK_BLOCK.replace_all(content, "");
    let trimmed = without_think.trim();
    let without_trailing_json = strip_trailing_tool_json(trimmed);
    without_trailing_json.trim().to_string()
}

/// If the trimmed text ends with a syntactically balanced `{...}` object
/// that parses as JSON, strip it (and the whitespace before it).
fn strip_trailing_tool_json(text: &str) -> &str {
    let bytes = text.as_bytes();
    if bytes.last() != Some(&b'}') {
        return text;
    }

    let mut depth = 0i32;
    let mut start = None;
    for (i, &b) in bytes.iter().enumerate().rev() {
        match b {
            b'}' => depth += 1,
            b'{' => {
                depth -= 1;
                if depth == 0 {
                    start = Some(i);
                    break;
                }
            }
            _ => {}
        }
    }

    match start {
        Some(start) if serde_json::from_str::<serde_json::Value>(&text[start..]).is_ok() => {
            text[..start].trim_end()
        }
        _ => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_think_block() {
        let input = "<think>reasoning here</think>The actual answer.";
        assert_eq!(sanitize_for_memory(input), "The actual answer.");
    }

    #[test]
    fn strips_trailing_tool_json() {
        let input = r#"Calling the tool now. {"name": "search", "args": {"q": "rust"}}"#;
        assert_eq!(sanitize_for_memory(input), "Calling the tool now.");
    }

    #[test]
    fn leaves_plain_text_untouched() {
        let input = "Just a normal reply with no markup.";
        assert_eq!(sanitize_for_memory(input), input);
    }

    #[test]
    fn does_not_strip_json_that_is_part_of_prose() {
        let input = "The schema looks like {\"a\": 1} in this example, right?";
        assert_eq!(sanitize_for_memory(input), input);
    }
}
