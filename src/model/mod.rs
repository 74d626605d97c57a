//! Language model backends
//!
//! `backend` holds the chat types and the `ModelBackend` trait, `ollama`
//! the HTTP client for a local Ollama server.

pub mod backend;
pub mod ollama;
pub mod prompt;
pub mod scripted;

pub use backend::{
    ChatMessage, FunctionCall, GenerateRequest, ModelBackend, ModelSegment, SegmentStream, Tool,
    ToolCall, ToolFunction,
};
pub use ollama::OllamaBackend;
pub use prompt::{agent_system_prompt, execute_tool, EXECUTE_TOOL_NAME};
pub use scripted::{ScriptedBackend, ScriptedReply};
