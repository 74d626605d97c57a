//! Ollama `/api/chat` backend with streaming and tool calling

use std::time::Duration;

use async_stream::try_stream;
use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use serde::Deserialize;
use tracing::debug;

use crate::config::ModelConfig;
use crate::error::ModelError;

use super::backend::{ChatMessage, GenerateRequest, ModelBackend, ModelSegment, SegmentStream};

/// One NDJSON line of a streamed `/api/chat` response
#[derive(Debug, Clone, Deserialize)]
pub struct ChatChunk {
    #[serde(default)]
    pub message: Option<ChatMessage>,
    #[serde(default)]
    pub done: bool,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub eval_count: u32,
    #[serde(default)]
    pub eval_duration: u64,
}

/// Client for Ollama's /api/chat endpoint
#[derive(Clone)]
pub struct OllamaBackend {
    base_url: String,
    client: reqwest::Client,
}

impl OllamaBackend {
    /// Create a backend for the server at `base_url` (e.g. "http://localhost:11434")
    pub fn new(base_url: impl Into<String>, request_timeout: Duration) -> Result<Self, ModelError> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    pub fn from_config(config: &ModelConfig) -> Result<Self, ModelError> {
        Self::new(
            config.base_url.clone(),
            Duration::from_secs(config.request_timeout_secs),
        )
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

/// Turn one NDJSON line into segments
fn decode_line(line: &[u8]) -> Result<(Vec<ModelSegment>, bool), ModelError> {
    let chunk: ChatChunk =
        serde_json::from_slice(line).map_err(|e| ModelError::Decode(e.to_string()))?;

    if let Some(error) = chunk.error {
        return Err(ModelError::Backend(error));
    }

    let mut segments = Vec::new();
    if let Some(message) = chunk.message {
        if !message.content.is_empty() {
            segments.push(ModelSegment::Text(message.content));
        }
        for call in message.tool_calls.unwrap_or_default() {
            segments.push(ModelSegment::ToolCall(call));
        }
    }
    if chunk.done {
        debug!(
            eval_count = chunk.eval_count,
            eval_duration_ms = chunk.eval_duration / 1_000_000,
            "Model stream finished"
        );
    }
    Ok((segments, chunk.done))
}

/// Decode a streamed NDJSON body into segments
///
/// Network chunks do not line up with NDJSON lines, so bytes are buffered
/// until a newline arrives.
fn ndjson_segments<S, B>(mut bytes_stream: S) -> impl Stream<Item = Result<ModelSegment, ModelError>> + Send
where
    S: Stream<Item = Result<B, reqwest::Error>> + Send + Unpin + 'static,
    B: AsRef<[u8]> + Send,
{
    try_stream! {
        let mut buffer: Vec<u8> = Vec::new();
        let mut done = false;

        while let Some(chunk) = bytes_stream.next().await {
            buffer.extend_from_slice(chunk?.as_ref());
            while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=pos).collect();
                if line.iter().all(u8::is_ascii_whitespace) {
                    continue;
                }
                let (items, finished) = decode_line(&line)?;
                for item in items {
                    yield item;
                }
                done |= finished;
            }
        }

        if !buffer.iter().all(u8::is_ascii_whitespace) {
            let (items, finished) = decode_line(&buffer)?;
            for item in items {
                yield item;
            }
            done |= finished;
        }

        if !done {
            Err::<(), _>(ModelError::Decode("stream ended before done".to_string()))?;
        }
    }
}

#[async_trait]
impl ModelBackend for OllamaBackend {
    async fn generate(&self, request: GenerateRequest) -> Result<SegmentStream, ModelError> {
        let endpoint = format!("{}/api/chat", self.base_url);

        let mut body = serde_json::json!({
            "model": request.model,
            "messages": request.messages,
            "stream": true,
            "options": {
                "temperature": request.temperature
            }
        });
        if let Some(tools) = &request.tools {
            body["tools"] = serde_json::to_value(tools).map_err(|e| ModelError::Decode(e.to_string()))?;
        }

        let mut http = self.client.post(&endpoint).json(&body);
        if let Some(tid) = &request.trace_id {
            http = http.header("X-Trace-Id", tid);
        }

        let response = http.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ModelError::Status {
                status: status.as_u16(),
                body,
            });
        }

        Ok(Box::pin(ndjson_segments(response.bytes_stream())))
    }

    fn name(&self) -> &str {
        "ollama"
    }
}
