//! Model backend abstraction
//!
//! The engine only needs one capability from a language model: given a
//! message list (and optionally the tool schema), stream back reply text and
//! native tool calls. `OllamaBackend` talks to a real server;
//! `ScriptedBackend` replays canned replies.

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::Stream;
use serde::{Deserialize, Serialize};

use crate::error::ModelError;

/// A message in a chat conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String, // "system", "user", "assistant", "tool"
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self::with_role("system", content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::with_role("user", content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::with_role("assistant", content)
    }

    pub fn tool(content: impl Into<String>) -> Self {
        Self::with_role("tool", content)
    }

    fn with_role(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: content.into(),
            tool_calls: None,
        }
    }
}

/// A tool call from the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub function: FunctionCall,
}

impl ToolCall {
    pub fn new(name: impl Into<String>, arguments: serde_json::Value) -> Self {
        Self {
            function: FunctionCall {
                name: name.into(),
                arguments,
            },
        }
    }
}

/// Function call details
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    pub arguments: serde_json::Value,
}

/// Tool definition for the model
#[derive(Debug, Clone, Serialize)]
pub struct Tool {
    #[serde(rename = "type")]
    pub tool_type: String, // Always "function"
    pub function: ToolFunction,
}

/// Function specification for a tool
#[derive(Debug, Clone, Serialize)]
pub struct ToolFunction {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value, // JSON Schema
}

/// One model call
#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    /// Tool schema; `None` disables native tool calling
    pub tools: Option<Vec<Tool>>,
    pub temperature: f32,
    /// Propagated as `X-Trace-Id` where the backend supports it
    pub trace_id: Option<String>,
}

/// Item streamed back by a backend
#[derive(Debug, Clone, PartialEq)]
pub enum ModelSegment {
    /// A fragment of reply text
    Text(String),
    /// A complete native tool call
    ToolCall(ToolCall),
}

pub type SegmentStream = Pin<Box<dyn Stream<Item = Result<ModelSegment, ModelError>> + Send>>;

#[async_trait]
pub trait ModelBackend: Send + Sync {
    /// Start a model call and stream its reply
    async fn generate(&self, request: GenerateRequest) -> Result<SegmentStream, ModelError>;

    /// Human-readable backend name for logs
    fn name(&self) -> &str;
}
