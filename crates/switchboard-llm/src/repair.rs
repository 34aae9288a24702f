//! Best-effort repair of slightly malformed tool-call JSON.
//!
//! Models under streaming pressure occasionally emit argument JSON with a
//! trailing comma or with the closing brackets cut off. Those two defect
//! families are mechanical to fix; anything else is left to the caller to
//! report as a tool-call error.

/// Try to parse `raw` as JSON, repairing trailing commas and truncated
/// closing brackets/braces first if the direct parse fails.
pub fn parse_or_repair(raw: &str) -> Option<serde_json::Value> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        // No arguments at all — a tool with no parameters.
        return Some(serde_json::json!({}));
    }
    if let Ok(v) = serde_json::from_str(trimmed) {
        return Some(v);
    }
    let repaired = repair(trimmed);
    serde_json::from_str(&repaired).ok()
}

fn repair(raw: &str) -> String {
    let mut out = strip_trailing_commas(raw);

    // Close any brackets left open, honouring string context.
    let mut stack: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;
    for c in out.chars() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => stack.push('}'),
            '[' if !in_string => stack.push(']'),
            '}' | ']' if !in_string => {
                stack.pop();
            }
            _ => {}
        }
    }
    if in_string {
        out.push('"');
    }
    while let Some(closer) = stack.pop() {
        // A value may have been cut right after a comma or colon.
        let trimmed = out.trim_end().to_string();
        out = trimmed;
        if out.ends_with(',') || out.ends_with(':') {
            out.pop();
        }
        out.push(closer);
    }
    out
}

/// Remove commas that directly precede a closing bracket.
fn strip_trailing_commas(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut in_string = false;
    let mut escaped = false;
    let chars: Vec<char> = raw.chars().collect();
    for (i, &c) in chars.iter().enumerate() {
        if escaped {
            escaped = false;
            out.push(c);
            continue;
        }
        match c {
            '\\' if in_string => {
                escaped = true;
                out.push(c);
            }
            '"' => {
                in_string = !in_string;
                out.push(c);
            }
            ',' if !in_string => {
                let next_meaningful = chars[i + 1..].iter().find(|c| !c.is_whitespace());
                if matches!(next_meaningful, Some('}') | Some(']')) {
                    continue;
                }
                out.push(c);
            }
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn valid_json_passes_through() {
        let v = parse_or_repair(r#"{"field": "policy_number", "value": "ABC123"}"#).unwrap();
        assert_eq!(v, json!({"field": "policy_number", "value": "ABC123"}));
    }

    #[test]
    fn trailing_comma_is_removed() {
        let v = parse_or_repair(r#"{ "field": "policy_number", "value": "ABC123",}"#).unwrap();
        assert_eq!(v["value"], "ABC123");
    }

    #[test]
    fn truncated_brackets_are_closed() {
        let v = parse_or_repair(r#"{"query": "water damage", "filters": ["home""#).unwrap();
        assert_eq!(v["query"], "water damage");
        assert_eq!(v["filters"], json!(["home"]));
    }

    #[test]
    fn unterminated_string_is_closed() {
        let v = parse_or_repair(r#"{"text": "see you tomo"#).unwrap();
        assert_eq!(v["text"], "see you tomo");
    }

    #[test]
    fn empty_arguments_mean_no_parameters() {
        assert_eq!(parse_or_repair("").unwrap(), json!({}));
        assert_eq!(parse_or_repair("  ").unwrap(), json!({}));
    }

    #[test]
    fn hopeless_input_is_rejected() {
        assert!(parse_or_repair("not json at all {{{]").is_none());
    }

    #[test]
    fn commas_inside_strings_survive() {
        let v = parse_or_repair(r#"{"text": "a, b, c",}"#).unwrap();
        assert_eq!(v["text"], "a, b, c");
    }
}
