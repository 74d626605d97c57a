//! Code blocks from tool calls
//!
//! Models with native tool calling send `execute(language, code)` calls
//! instead of fenced blocks. Some models print the call as JSON in the
//! reply text instead of using the tool-call field; those are recovered here
//! too.

use crate::model::{FunctionCall, ToolCall};
use crate::runtime::Language;

/// Tool names accepted as a request to run code
pub const EXECUTE_TOOL_NAMES: [&str; 3] = ["execute", "execute_code", "run_code"];

/// Extract `(language, code)` from an execute-style tool call
pub fn code_from_tool_call(call: &ToolCall) -> Result<(Language, String), String> {
    let name = call.function.name.as_str();
    if !EXECUTE_TOOL_NAMES.contains(&name) {
        return Err(format!("unknown tool '{name}'"));
    }

    // Some models send the arguments object as a JSON string
    let parsed;
    let arguments = match &call.function.arguments {
        serde_json::Value::String(raw) => {
            parsed = serde_json::from_str::<serde_json::Value>(raw)
                .map_err(|e| format!("arguments are not valid JSON: {e}"))?;
            &parsed
        }
        other => other,
    };

    let code = arguments
        .get("code")
        .and_then(|c| c.as_str())
        .ok_or_else(|| "missing 'code' argument".to_string())?;
    if code.trim().is_empty() {
        return Err("empty 'code' argument".to_string());
    }
    let language = arguments
        .get("language")
        .and_then(|l| l.as_str())
        .unwrap_or("python");

    Ok((Language::from_tag(language), code.to_string()))
}

/// Try to parse tool calls from the response content text
///
/// This handles models that output tool calls as JSON in the text
/// instead of using the native tool_calls field.
pub fn parse_tool_calls_from_text(content: &str) -> Vec<ToolCall> {
    let content = content.trim();

    if let Some(tool_call) = try_parse_tool_call(content) {
        return vec![tool_call];
    }

    // Scan for top-level {...} objects
    let mut tool_calls = Vec::new();
    let mut depth = 0usize;
    let mut start = None;

    for (i, c) in content.char_indices() {
        match c {
            '{' => {
                if depth == 0 {
                    start = Some(i);
                }
                depth += 1;
            }
            '}' if depth > 0 => {
                depth -= 1;
                if depth == 0 {
                    if let Some(s) = start.take() {
                        if let Some(tool_call) = try_parse_tool_call(&content[s..=i]) {
                            tool_calls.push(tool_call);
                        }
                    }
                }
            }
            _ => {}
        }
    }

    tool_calls
}

/// Try to parse a single tool call from a JSON string
fn try_parse_tool_call(json_str: &str) -> Option<ToolCall> {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(json_str) {
        return parse_tool_call_from_value(&value);
    }

    let fixed = try_fix_malformed_json(json_str)?;
    let value = serde_json::from_str::<serde_json::Value>(&fixed).ok()?;
    parse_tool_call_from_value(&value)
}

/// Escape the unescaped quotes models tend to leave in the code string
///
/// `{"name": "execute", "arguments": {"language": "shell", "code": "echo "hi""}}`
fn try_fix_malformed_json(json_str: &str) -> Option<String> {
    let code_marker = "\"code\": \"";
    let code_start = json_str.find(code_marker)?;
    let code_value_start = code_start + code_marker.len();

    let remaining = &json_str[code_value_start..];
    let end = remaining.rfind("\"}}")?;
    let code_content = &remaining[..end];

    let escaped_code = code_content
        .replace("\\\"", "\u{FFFF}")
        .replace('"', "\\\"")
        .replace('\u{FFFF}', "\\\"")
        .replace('\n', "\\n");

    Some(format!(
        "{}{}{}",
        &json_str[..code_value_start],
        escaped_code,
        &remaining[end..]
    ))
}

fn parse_tool_call_from_value(value: &serde_json::Value) -> Option<ToolCall> {
    // Accept both {"name", "arguments"} and {"function": {"name", "arguments"}}
    let value = value.get("function").unwrap_or(value);
    let name = value.get("name").and_then(|n| n.as_str())?;

    let arguments = if let Some(args) = value.get("arguments") {
        args.clone()
    } else if let Some(params) = value.get("parameters") {
        // Schema mixed with values: {"parameters": {"code": {"value": "..."}}}
        match params.get("code") {
            Some(code) if code.is_object() => {
                let code = code.get("value").and_then(|v| v.as_str()).unwrap_or("");
                let language = params
                    .get("language")
                    .and_then(|l| l.as_str().or_else(|| l.get("value").and_then(|v| v.as_str())))
                    .unwrap_or("python");
                serde_json::json!({ "language": language, "code": code })
            }
            _ => params.clone(),
        }
    } else {
        return None;
    };

    Some(ToolCall {
        function: FunctionCall {
            name: name.to_string(),
            arguments,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_code_from_tool_call() {
        let call = ToolCall::new("execute", json!({"language": "bash", "code": "ls"}));
        assert_eq!(code_from_tool_call(&call), Ok((Language::Shell, "ls".to_string())));

        let call = ToolCall::new("execute_code", json!(r#"{"language": "python", "code": "print(1)"}"#));
        assert_eq!(code_from_tool_call(&call), Ok((Language::Python, "print(1)".to_string())));
    }

    #[test]
    fn test_invalid_tool_calls() {
        let call = ToolCall::new("browse", json!({"url": "x"}));
        assert!(code_from_tool_call(&call).unwrap_err().contains("unknown tool"));

        let call = ToolCall::new("execute", json!({"language": "python"}));
        assert!(code_from_tool_call(&call).unwrap_err().contains("missing"));
    }

    #[test]
    fn test_parse_tool_calls_from_text() {
        let text = r#"Let me check. {"name": "execute", "arguments": {"language": "python", "code": "print(2+2)"}} Done."#;
        let calls = parse_tool_calls_from_text(text);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].function.arguments["code"], "print(2+2)");
    }

    #[test]
    fn test_malformed_quotes_are_repaired() {
        let text = r#"{"name": "execute", "arguments": {"language": "shell", "code": "echo "hello""}}"#;
        let calls = parse_tool_calls_from_text(text);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].function.arguments["code"], "echo \"hello\"");
    }

    #[test]
    fn test_parameters_with_value_objects() {
        let text = r#"{"name": "run_code", "parameters": {"language": {"value": "bash"}, "code": {"value": "pwd"}}}"#;
        let calls = parse_tool_calls_from_text(text);
        assert_eq!(calls[0].function.arguments, json!({"language": "bash", "code": "pwd"}));
    }

    #[test]
    fn test_plain_text_has_no_calls() {
        assert!(parse_tool_calls_from_text("Just a friendly answer {with braces}.").is_empty());
    }
}
