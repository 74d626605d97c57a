//! Conversation transcript
//!
//! Ordered record of what the user said, what the assistant replied and
//! what each executed block produced. Execution entries are only accepted
//! right after an assistant reply or another execution entry, so the
//! transcript always reads in causal order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use tracing::debug;

use super::compact::{compact, Compacted};
use crate::config::{AgentConfig, OutputSender};
use crate::error::TranscriptError;
use crate::model::ChatMessage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    Execution,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// A conversation and its transcript
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    entries: Vec<TranscriptEntry>,
}

impl Conversation {
    pub fn new(id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            created_at: now,
            updated_at: now,
            entries: Vec::new(),
        }
    }

    /// A conversation with a fresh time-sortable id
    pub fn generate() -> Self {
        Self::new(uuid::Uuid::now_v7().to_string())
    }

    pub fn entries(&self) -> &[TranscriptEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn last(&self) -> Option<&TranscriptEntry> {
        self.entries.last()
    }

    pub fn push_user(&mut self, content: impl Into<String>) {
        self.push(Role::User, content.into());
    }

    pub fn push_assistant(&mut self, content: impl Into<String>) {
        self.push(Role::Assistant, content.into());
    }

    /// Append execution output; must follow an assistant or execution entry
    pub fn push_execution(&mut self, content: impl Into<String>) -> Result<(), TranscriptError> {
        match self.entries.last().map(|e| e.role) {
            Some(Role::Assistant) | Some(Role::Execution) => {
                self.push(Role::Execution, content.into());
                Ok(())
            }
            _ => Err(TranscriptError::OrphanExecution),
        }
    }

    /// Drop every entry
    pub fn clear(&mut self) {
        self.entries.clear();
        self.updated_at = Utc::now();
    }

    fn push(&mut self, role: Role, content: String) {
        let now = Utc::now();
        self.entries.push(TranscriptEntry {
            role,
            content,
            created_at: now,
        });
        self.updated_at = now;
    }

    /// Messages for a model call, starting with `system_prompt`
    pub fn to_messages(&self, system_prompt: &str, sender: OutputSender) -> Vec<ChatMessage> {
        self.render(system_prompt, sender, None)
    }

    /// Like [`Conversation::to_messages`], but entries outside the history
    /// window are folded into one summary note
    pub fn to_window_messages(&self, system_prompt: &str, agent: &AgentConfig) -> Vec<ChatMessage> {
        let compacted = compact(&self.entries, agent.max_context_chars, agent.keep_recent_entries);
        if let Some(compacted) = &compacted {
            debug!(
                conversation = %self.id,
                compacted = compacted.keep_from,
                kept = self.entries.len() - compacted.keep_from,
                "Compacting history for model call"
            );
        }
        self.render(system_prompt, agent.code_output_sender, compacted)
    }

    fn render(&self, system_prompt: &str, sender: OutputSender, compacted: Option<Compacted>) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(self.entries.len() + 2);
        if !system_prompt.is_empty() {
            messages.push(ChatMessage::system(system_prompt));
        }
        let mut keep_from = 0;
        if let Some(compacted) = compacted {
            messages.push(ChatMessage::system(compacted.summary));
            keep_from = compacted.keep_from;
        }
        for entry in &self.entries[keep_from..] {
            let message = match entry.role {
                Role::User => ChatMessage::user(&entry.content),
                Role::Assistant => ChatMessage::assistant(&entry.content),
                Role::Execution => match sender {
                    OutputSender::User => ChatMessage::user(&entry.content),
                    OutputSender::Tool => ChatMessage::tool(&entry.content),
                },
            };
            messages.push(message);
        }
        messages
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execution_must_follow_assistant() {
        let mut conversation = Conversation::new("c1");
        assert_eq!(
            conversation.push_execution("orphan"),
            Err(TranscriptError::OrphanExecution)
        );

        conversation.push_user("compute 2+2");
        assert!(conversation.push_execution("too early").is_err());

        conversation.push_assistant("```python\nprint(2+2)\n```");
        assert!(conversation.push_execution("4").is_ok());
        assert!(conversation.push_execution("second block").is_ok());
        assert_eq!(conversation.len(), 4);
    }

    #[test]
    fn test_to_messages_maps_roles() {
        let mut conversation = Conversation::new("c1");
        conversation.push_user("hi");
        conversation.push_assistant("code");
        conversation.push_execution("output").unwrap();

        let messages = conversation.to_messages("system", OutputSender::User);
        let roles: Vec<&str> = messages.iter().map(|m| m.role.as_str()).collect();
        assert_eq!(roles, vec!["system", "user", "assistant", "user"]);

        let messages = conversation.to_messages("", OutputSender::Tool);
        assert_eq!(messages.last().map(|m| m.role.as_str()), Some("tool"));
        assert_eq!(messages.len(), 3);
    }

    #[test]
    fn test_window_folds_old_entries() {
        let mut conversation = Conversation::new("c1");
        for i in 0..6 {
            conversation.push_user(format!("request {i}"));
            conversation.push_assistant("```python\nprint(1)\n```");
            conversation.push_execution("Code output: 1").unwrap();
        }
        let agent = AgentConfig {
            max_context_chars: 40,
            keep_recent_entries: 3,
            ..AgentConfig::default()
        };

        let messages = conversation.to_window_messages("system", &agent);
        assert_eq!(messages.len(), 5);
        assert_eq!(messages[0].content, "system");
        assert_eq!(messages[1].role.as_str(), "system");
        assert!(messages[1].content.contains("request 4"));
        assert!(!messages[1].content.contains("request 5"));
        assert_eq!(messages[2].content, "request 5");
        assert_eq!(conversation.len(), 18);

        let unlimited = AgentConfig {
            max_context_chars: 0,
            ..agent
        };
        assert_eq!(conversation.to_window_messages("system", &unlimited).len(), 19);
    }

    #[test]
    fn test_serde_keeps_entries() {
        let mut conversation = Conversation::new("c1");
        conversation.push_user("hello");
        let json = serde_json::to_string(&conversation).unwrap();
        let back: Conversation = serde_json::from_str(&json).unwrap();
        assert_eq!(back.entries(), conversation.entries());
        assert_eq!(back.id, "c1");
    }
}
