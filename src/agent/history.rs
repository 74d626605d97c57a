//! Conversation history persistence
//!
//! Lets a conversation survive engine restarts. `FileHistoryStore` keeps
//! one pretty-printed JSON file per conversation.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::HistoryError;

use super::conversation::{Conversation, Role};

/// Summary of a conversation for listing
#[derive(Debug, Clone, Serialize)]
pub struct ConversationSummary {
    pub id: String,
    /// First user message, shortened
    pub title: String,
    pub updated_at: DateTime<Utc>,
    pub entries: usize,
}

impl ConversationSummary {
    fn of(conversation: &Conversation) -> Self {
        let title = conversation
            .entries()
            .iter()
            .find(|e| e.role == Role::User)
            .map(|e| truncate(&e.content, 50))
            .unwrap_or_default();
        Self {
            id: conversation.id.clone(),
            title,
            updated_at: conversation.updated_at,
            entries: conversation.len(),
        }
    }
}

pub trait HistoryStore: Send + Sync {
    /// `Ok(None)` when the conversation was never saved
    fn load(&self, id: &str) -> Result<Option<Conversation>, HistoryError>;
    fn save(&self, conversation: &Conversation) -> Result<(), HistoryError>;
    /// Deleting an unknown conversation is not an error
    fn delete(&self, id: &str) -> Result<(), HistoryError>;
    /// Newest first
    fn list(&self) -> Result<Vec<ConversationSummary>, HistoryError>;
}

/// Keeps conversations for the lifetime of the process
#[derive(Default)]
pub struct MemoryHistoryStore {
    conversations: Mutex<HashMap<String, Conversation>>,
}

impl MemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl HistoryStore for MemoryHistoryStore {
    fn load(&self, id: &str) -> Result<Option<Conversation>, HistoryError> {
        let map = self
            .conversations
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(map.get(id).cloned())
    }

    fn save(&self, conversation: &Conversation) -> Result<(), HistoryError> {
        let mut map = self
            .conversations
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        map.insert(conversation.id.clone(), conversation.clone());
        Ok(())
    }

    fn delete(&self, id: &str) -> Result<(), HistoryError> {
        let mut map = self
            .conversations
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        map.remove(id);
        Ok(())
    }

    fn list(&self) -> Result<Vec<ConversationSummary>, HistoryError> {
        let map = self
            .conversations
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut summaries: Vec<_> = map.values().map(ConversationSummary::of).collect();
        summaries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(summaries)
    }
}

/// One JSON file per conversation under a base directory
pub struct FileHistoryStore {
    base_dir: PathBuf,
}

impl FileHistoryStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Result<Self, HistoryError> {
        let base_dir = base_dir.into();
        std::fs::create_dir_all(&base_dir)?;
        Ok(Self { base_dir })
    }

    /// Create with default directory (~/.localagent/conversations)
    pub fn default_store() -> Result<Self, HistoryError> {
        let home = std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string());
        Self::new(PathBuf::from(home).join(".localagent").join("conversations"))
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn conversation_path(&self, id: &str) -> Result<PathBuf, HistoryError> {
        let valid = !id.is_empty()
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
            && !id.starts_with('.');
        if !valid {
            return Err(HistoryError::InvalidId(id.to_string()));
        }
        Ok(self.base_dir.join(format!("{}.json", id)))
    }

    fn load_from_path(path: &Path) -> Result<Conversation, HistoryError> {
        let json = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }
}

impl HistoryStore for FileHistoryStore {
    fn load(&self, id: &str) -> Result<Option<Conversation>, HistoryError> {
        let path = self.conversation_path(id)?;
        match Self::load_from_path(&path) {
            Ok(conversation) => Ok(Some(conversation)),
            Err(HistoryError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn save(&self, conversation: &Conversation) -> Result<(), HistoryError> {
        let path = self.conversation_path(&conversation.id)?;
        let json = serde_json::to_string_pretty(conversation)?;
        // Write then rename so a crash never leaves half a file
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn delete(&self, id: &str) -> Result<(), HistoryError> {
        let path = self.conversation_path(id)?;
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn list(&self) -> Result<Vec<ConversationSummary>, HistoryError> {
        let mut summaries = Vec::new();
        for entry in std::fs::read_dir(&self.base_dir)? {
            let path = entry?.path();
            if path.extension().map(|e| e == "json").unwrap_or(false) {
                if let Ok(conversation) = Self::load_from_path(&path) {
                    summaries.push(ConversationSummary::of(&conversation));
                }
            }
        }
        summaries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(summaries)
    }
}

/// Truncate to `max_chars` characters, adding an ellipsis if needed
fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_chars.saturating_sub(3)).collect();
        format!("{kept}...")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(id: &str) -> Conversation {
        let mut conversation = Conversation::new(id);
        conversation.push_user("Find prime numbers below 100");
        conversation.push_assistant("```python\nprint([p for p in range(2, 100)])\n```");
        conversation.push_execution("[2, 3, 5]").unwrap();
        conversation
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryHistoryStore::new();
        assert!(store.load("c1").unwrap().is_none());
        store.save(&sample("c1")).unwrap();
        assert_eq!(store.load("c1").unwrap().unwrap().len(), 3);
        store.delete("c1").unwrap();
        assert!(store.load("c1").unwrap().is_none());
    }

    #[test]
    fn test_file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileHistoryStore::new(dir.path()).unwrap();

        store.save(&sample("c1")).unwrap();
        store.save(&sample("c2")).unwrap();
        let loaded = store.load("c1").unwrap().unwrap();
        let roles: Vec<Role> = loaded.entries().iter().map(|e| e.role).collect();
        assert_eq!(roles, vec![Role::User, Role::Assistant, Role::Execution]);
        assert_eq!(loaded.entries()[2].content, "[2, 3, 5]");

        let list = store.list().unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].title, "Find prime numbers below 100");

        store.delete("c1").unwrap();
        store.delete("c1").unwrap();
        assert!(store.load("c1").unwrap().is_none());
    }

    #[test]
    fn test_file_store_rejects_path_ids() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileHistoryStore::new(dir.path()).unwrap();
        assert!(matches!(store.load("../etc/passwd"), Err(HistoryError::InvalidId(_))));
        assert!(matches!(store.save(&Conversation::new("a/b")), Err(HistoryError::InvalidId(_))));
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("this is a long string", 10), "this is...");
    }
}
