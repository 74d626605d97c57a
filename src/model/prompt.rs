//! System prompts and the `execute` tool schema

use crate::config::ModelConfig;
use crate::runtime::Language;

use super::backend::{Tool, ToolFunction};

/// Name of the native tool the model calls to run code
pub const EXECUTE_TOOL_NAME: &str = "execute";

/// Default system prompt for the agent path
pub const DEFAULT_AGENT_SYSTEM_PROMPT: &str = r#"You are a skilled programmer that completes tasks by writing and executing code on the user's machine.

Code you write in a fenced markdown block with a language tag is executed immediately, and you will see its output. Supported languages: {languages}.

Guidelines:
- Always put the language right after the opening ``` of every block
- Work in small steps: run something, print what you learned, then continue
- Interpreter state persists between blocks of the same language within this conversation
- If code fails, read the error and fix it
- Never use placeholder paths like "path/to/file"
- When the task is complete, answer in plain text without a code block and say "The task is done."

Current environment:
- User: {user}
- OS: {os}"#;

/// Build the agent system prompt from configuration
pub fn agent_system_prompt(config: &ModelConfig) -> String {
    let base = config
        .system_prompt
        .as_deref()
        .unwrap_or(DEFAULT_AGENT_SYSTEM_PROMPT);

    let languages = Language::SUPPORTED
        .iter()
        .map(Language::name)
        .collect::<Vec<_>>()
        .join(", ");
    let user = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string());

    let mut prompt = base
        .replace("{languages}", &languages)
        .replace("{user}", &user)
        .replace("{os}", std::env::consts::OS);

    if !config.custom_instructions.trim().is_empty() {
        prompt.push_str("\n\n");
        prompt.push_str(config.custom_instructions.trim());
    }
    prompt
}

/// Create the `execute` tool definition
pub fn execute_tool() -> Tool {
    let languages: Vec<&str> = Language::SUPPORTED.iter().map(Language::name).collect();
    Tool {
        tool_type: "function".to_string(),
        function: ToolFunction {
            name: EXECUTE_TOOL_NAME.to_string(),
            description: "Execute code on the user's machine and return its output. State persists between calls of the same language.".to_string(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "language": {
                        "type": "string",
                        "enum": languages,
                        "description": "The programming language to use"
                    },
                    "code": {
                        "type": "string",
                        "description": "The code to execute"
                    }
                },
                "required": ["language", "code"]
            }),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_prompt_is_filled_in() {
        let prompt = agent_system_prompt(&ModelConfig::default());
        assert!(prompt.contains("python, javascript, shell, powershell"));
        assert!(!prompt.contains("{user}"));
        assert!(!prompt.contains("{os}"));
    }

    #[test]
    fn test_custom_instructions_appended() {
        let config = ModelConfig {
            system_prompt: Some("Be brief.".to_string()),
            custom_instructions: "Prefer bash.".to_string(),
            ..ModelConfig::default()
        };
        assert_eq!(agent_system_prompt(&config), "Be brief.\n\nPrefer bash.");
    }

    #[test]
    fn test_execute_tool_schema() {
        let tool = execute_tool();
        assert_eq!(tool.function.name, "execute");
        let value = serde_json::to_value(&tool).unwrap();
        assert_eq!(value["type"], "function");
        assert_eq!(value["function"]["parameters"]["required"][1], "code");
    }
}
