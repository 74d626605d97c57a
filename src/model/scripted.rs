//! Backend that replays canned replies
//!
//! Used by tests and demos. Each call to `generate` pops the next reply;
//! text is streamed in small chunks so consumers see realistic fragments.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_stream::stream;
use async_trait::async_trait;

use crate::error::ModelError;

use super::backend::{GenerateRequest, ModelBackend, ModelSegment, SegmentStream, ToolCall};

/// One canned reply
#[derive(Debug, Clone)]
pub enum ScriptedReply {
    Segments(Vec<ModelSegment>),
    Fail(String),
}

impl ScriptedReply {
    pub fn text(text: impl Into<String>) -> Self {
        ScriptedReply::Segments(vec![ModelSegment::Text(text.into())])
    }

    pub fn tool_call(call: ToolCall) -> Self {
        ScriptedReply::Segments(vec![ModelSegment::ToolCall(call)])
    }
}

#[derive(Clone)]
pub struct ScriptedBackend {
    replies: Arc<Mutex<VecDeque<ScriptedReply>>>,
    /// Reply used once the queue is empty; `None` makes that an error
    fallback: Option<ScriptedReply>,
    requests: Arc<Mutex<Vec<GenerateRequest>>>,
    chunk_chars: usize,
    chunk_delay: Duration,
}

impl ScriptedBackend {
    pub fn new(replies: impl IntoIterator<Item = ScriptedReply>) -> Self {
        Self {
            replies: Arc::new(Mutex::new(replies.into_iter().collect())),
            fallback: None,
            requests: Arc::new(Mutex::new(Vec::new())),
            chunk_chars: 7,
            chunk_delay: Duration::ZERO,
        }
    }

    /// Replies consisting only of text
    pub fn with_texts<I, S>(texts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(texts.into_iter().map(ScriptedReply::text))
    }

    /// Reply with `reply` forever once the queue runs dry
    pub fn repeat_last(mut self, reply: ScriptedReply) -> Self {
        self.fallback = Some(reply);
        self
    }

    /// Stream text in chunks of `chars` characters
    pub fn chunked(mut self, chars: usize) -> Self {
        self.chunk_chars = chars.max(1);
        self
    }

    /// Pause between streamed chunks
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = delay;
        self
    }

    /// Requests received so far
    pub fn requests(&self) -> Vec<GenerateRequest> {
        self.requests
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    pub fn remaining(&self) -> usize {
        self.replies.lock().map(|r| r.len()).unwrap_or(0)
    }
}

fn split_chars(text: &str, size: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    chars.chunks(size).map(|c| c.iter().collect()).collect()
}

#[async_trait]
impl ModelBackend for ScriptedBackend {
    async fn generate(&self, request: GenerateRequest) -> Result<SegmentStream, ModelError> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request);
        }

        let next = self
            .replies
            .lock()
            .map_err(|_| ModelError::Backend("scripted backend poisoned".to_string()))?
            .pop_front()
            .or_else(|| self.fallback.clone());

        let segments = match next {
            Some(ScriptedReply::Segments(segments)) => segments,
            Some(ScriptedReply::Fail(message)) => return Err(ModelError::Backend(message)),
            None => return Err(ModelError::Backend("no scripted reply left".to_string())),
        };

        let size = self.chunk_chars;
        let delay = self.chunk_delay;
        let output = stream! {
            for segment in segments {
                match segment {
                    ModelSegment::Text(text) => {
                        for piece in split_chars(&text, size) {
                            if !delay.is_zero() {
                                tokio::time::sleep(delay).await;
                            }
                            yield Ok::<_, ModelError>(ModelSegment::Text(piece));
                        }
                    }
                    other => yield Ok::<_, ModelError>(other),
                }
            }
        };
        Ok(Box::pin(output))
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ChatMessage;
    use futures_util::StreamExt;

    fn request() -> GenerateRequest {
        GenerateRequest {
            model: "test".to_string(),
            messages: vec![ChatMessage::user("hi")],
            tools: None,
            temperature: 0.0,
            trace_id: None,
        }
    }

    #[tokio::test]
    async fn test_replays_in_order_then_fails() {
        let backend = ScriptedBackend::with_texts(["first reply", "second"]).chunked(4);
        let stream = backend.generate(request()).await.unwrap();
        let pieces: Vec<_> = stream.map(Result::unwrap).collect().await;
        assert_eq!(pieces.len(), 3);

        assert!(backend.generate(request()).await.is_ok());
        assert!(backend.generate(request()).await.is_err());
        assert_eq!(backend.requests().len(), 3);
    }

    #[tokio::test]
    async fn test_fallback_repeats() {
        let backend = ScriptedBackend::new([]).repeat_last(ScriptedReply::text("again"));
        for _ in 0..3 {
            assert!(backend.generate(request()).await.is_ok());
        }
        assert_eq!(backend.remaining(), 0);
    }
}
