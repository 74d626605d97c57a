//! Language runtime registry
//!
//! Arena of execution sessions keyed by (conversation, language). Each
//! conversation gets its own slot; a session sits behind its own async
//! mutex and is handed out as an owned guard, so a session never runs two
//! blocks at once and never leaks into another conversation.

use std::collections::{HashMap, HashSet};
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::RuntimeConfig;
use crate::error::RuntimeError;
use crate::metrics::{LIVE_SESSIONS, SESSION_STARTS};

use super::driver::launch_spec;
use super::language::Language;
use super::session::{Session, SessionKey};

/// Exclusive access to one session for the duration of a block
pub struct SessionLease {
    guard: OwnedMutexGuard<Session>,
}

impl Deref for SessionLease {
    type Target = Session;

    fn deref(&self) -> &Session {
        &self.guard
    }
}

impl DerefMut for SessionLease {
    fn deref_mut(&mut self) -> &mut Session {
        &mut self.guard
    }
}

/// Runtimes owned by one conversation
#[derive(Default)]
struct ConversationRuntimes {
    sessions: HashMap<Language, Arc<Mutex<Session>>>,
    /// Languages whose runtime failed to start in this conversation
    unsupported: HashSet<Language>,
}

/// Health of one language runtime
#[derive(Debug, Clone, Serialize)]
pub struct LanguageHealth {
    pub language: Language,
    pub program: String,
    /// Program resolves on `PATH` (or is an existing file)
    pub available: bool,
    pub active_sessions: usize,
    /// Conversations that marked this language unsupported
    pub unsupported_in: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub languages: Vec<LanguageHealth>,
    pub active_conversations: usize,
}

pub struct RuntimeRegistry {
    config: RuntimeConfig,
    conversations: std::sync::Mutex<HashMap<String, Arc<Mutex<ConversationRuntimes>>>>,
}

impl RuntimeRegistry {
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            config,
            conversations: std::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    fn slot(&self, conversation: &str) -> Arc<Mutex<ConversationRuntimes>> {
        let mut map = self
            .conversations
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        map.entry(conversation.to_string()).or_default().clone()
    }

    fn slots(&self) -> Vec<(String, Arc<Mutex<ConversationRuntimes>>)> {
        let map = self
            .conversations
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        map.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }

    /// Get the live session for (conversation, language), starting one if needed
    ///
    /// Start is retried `start_attempts` times. When every attempt fails the
    /// language is marked unsupported for the conversation: this call returns
    /// `StartFailed`, later calls return `MarkedUnsupported` without retrying.
    pub async fn acquire(
        &self,
        conversation: &str,
        language: &Language,
    ) -> Result<SessionLease, RuntimeError> {
        let spec = launch_spec(language, &self.config.commands)
            .ok_or_else(|| RuntimeError::UnsupportedLanguage(language.to_string()))?;

        let slot = self.slot(conversation);
        let mut runtimes = slot.lock().await;

        if runtimes.unsupported.contains(language) {
            return Err(RuntimeError::MarkedUnsupported(language.to_string()));
        }

        if let Some(existing) = runtimes.sessions.get(language).cloned() {
            let mut guard = existing.lock_owned().await;
            if guard.is_alive() {
                debug!(session = %guard.key(), executions = guard.executions(), "Reusing session");
                return Ok(SessionLease { guard });
            }
            guard.terminate().await;
            drop(guard);
            runtimes.sessions.remove(language);
            LIVE_SESSIONS.dec();
            info!(conversation, language = %language, "Replacing dead session");
        }

        let key = SessionKey {
            conversation: conversation.to_string(),
            language: language.clone(),
        };
        let attempts = self.config.start_attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            match Session::start(key.clone(), &spec, self.config.start_timeout()).await {
                Ok(session) => {
                    SESSION_STARTS.with_label_values(&[language.name(), "ok"]).inc();
                    LIVE_SESSIONS.inc();
                    let session = Arc::new(Mutex::new(session));
                    runtimes.sessions.insert(language.clone(), session.clone());
                    let guard = session.lock_owned().await;
                    return Ok(SessionLease { guard });
                }
                Err(e) => {
                    SESSION_STARTS.with_label_values(&[language.name(), "error"]).inc();
                    warn!(
                        session = %key,
                        attempt,
                        attempts,
                        error = %e,
                        "Runtime start failed"
                    );
                    last_error = Some(e);
                    if attempt < attempts {
                        tokio::time::sleep(Duration::from_millis(self.config.start_retry_delay_ms)).await;
                    }
                }
            }
        }

        runtimes.unsupported.insert(language.clone());
        let message = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "unknown error".to_string());
        warn!(session = %key, "Language marked unsupported for this conversation");
        Err(RuntimeError::StartFailed {
            language: language.to_string(),
            attempts,
            message,
        })
    }

    /// Terminate sessions past their idle or lifetime limit
    ///
    /// Busy sessions are skipped. A conversation left with no sessions and
    /// no unsupported marks loses its slot. Returns how many sessions were
    /// removed.
    pub async fn evict_expired(&self) -> usize {
        let idle = self.config.idle_timeout();
        let lifetime = self.config.max_lifetime();
        let mut evicted = 0;

        for (conversation, slot) in self.slots() {
            let mut runtimes = slot.lock().await;
            let mut expired = Vec::new();
            for (language, session) in &runtimes.sessions {
                let Ok(mut guard) = session.clone().try_lock_owned() else {
                    continue;
                };
                if !guard.is_alive() || guard.is_expired(idle, lifetime) {
                    guard.terminate().await;
                    expired.push(language.clone());
                }
            }
            for language in expired {
                runtimes.sessions.remove(&language);
                LIVE_SESSIONS.dec();
                debug!(conversation = %conversation, language = %language, "Evicted session");
                evicted += 1;
            }
            if runtimes.sessions.is_empty() && runtimes.unsupported.is_empty() {
                self.drop_slot(&conversation, &slot);
            }
        }

        if evicted > 0 {
            info!(evicted, "Evicted expired sessions");
        }
        evicted
    }

    /// Forget an empty slot unless someone else picked it up meanwhile
    fn drop_slot(&self, conversation: &str, slot: &Arc<Mutex<ConversationRuntimes>>) {
        let mut map = self
            .conversations
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        // Clones are only taken under this lock: the map's and ours
        let unshared = map.get(conversation).is_some_and(|s| Arc::ptr_eq(s, slot))
            && Arc::strong_count(slot) == 2;
        if unshared {
            map.remove(conversation);
            debug!(conversation, "Dropped empty runtime slot");
        }
    }

    /// Conversations holding a runtime slot
    pub fn conversation_count(&self) -> usize {
        self.conversations
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    /// Run `evict_expired` every `reap_interval_secs`
    pub fn start_reaper(registry: Arc<RuntimeRegistry>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let period = Duration::from_secs(registry.config.reap_interval_secs.max(1));
            let mut interval = tokio::time::interval(period);
            // First tick completes immediately
            interval.tick().await;

            loop {
                interval.tick().await;
                registry.evict_expired().await;
            }
        })
    }

    /// Terminate every session of a conversation and forget its unsupported marks
    pub async fn reset(&self, conversation: &str) {
        let slot = {
            let mut map = self
                .conversations
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            map.remove(conversation)
        };
        let Some(slot) = slot else {
            return;
        };

        let mut runtimes = slot.lock().await;
        let count = terminate_all(&mut runtimes).await;
        runtimes.unsupported.clear();
        info!(conversation, terminated = count, "Conversation runtimes reset");
    }

    /// Terminate every session in every conversation
    pub async fn shutdown(&self) {
        let slots: Vec<_> = {
            let mut map = self
                .conversations
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            map.drain().map(|(_, slot)| slot).collect()
        };

        let mut total = 0;
        for slot in slots {
            let mut runtimes = slot.lock().await;
            total += terminate_all(&mut runtimes).await;
        }
        info!(terminated = total, "Runtime registry shut down");
    }

    /// Number of live sessions for a conversation
    pub async fn session_count(&self, conversation: &str) -> usize {
        let slot = {
            let map = self
                .conversations
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            map.get(conversation).cloned()
        };
        match slot {
            Some(slot) => {
                let runtimes = slot.lock().await;
                live_languages(&runtimes).len()
            }
            None => 0,
        }
    }

    pub async fn health(&self) -> HealthReport {
        let mut active: HashMap<Language, usize> = HashMap::new();
        let mut unsupported: HashMap<Language, usize> = HashMap::new();
        let mut active_conversations = 0;

        for (_, slot) in self.slots() {
            let runtimes = slot.lock().await;
            let live = live_languages(&runtimes);
            if !live.is_empty() {
                active_conversations += 1;
            }
            for language in live {
                *active.entry(language).or_default() += 1;
            }
            for language in &runtimes.unsupported {
                *unsupported.entry(language.clone()).or_default() += 1;
            }
        }

        let languages = Language::SUPPORTED
            .iter()
            .map(|language| {
                let program = launch_spec(language, &self.config.commands)
                    .map(|spec| spec.program)
                    .unwrap_or_default();
                LanguageHealth {
                    language: language.clone(),
                    available: program_available(&program),
                    program,
                    active_sessions: active.get(language).copied().unwrap_or(0),
                    unsupported_in: unsupported.get(language).copied().unwrap_or(0),
                }
            })
            .collect();

        HealthReport {
            languages,
            active_conversations,
        }
    }
}

/// Languages whose session can still run a block; busy sessions count as live
fn live_languages(runtimes: &ConversationRuntimes) -> Vec<Language> {
    runtimes
        .sessions
        .iter()
        .filter(|(_, session)| match session.try_lock() {
            Ok(mut guard) => guard.is_alive(),
            Err(_) => true,
        })
        .map(|(language, _)| language.clone())
        .collect()
}

async fn terminate_all(runtimes: &mut ConversationRuntimes) -> usize {
    let mut count = 0;
    for (_, session) in runtimes.sessions.drain() {
        // Waits for a running block to release its lease
        session.lock().await.terminate().await;
        LIVE_SESSIONS.dec();
        count += 1;
    }
    count
}

/// Whether `program` is a path to an existing file or resolves on `PATH`
pub fn program_available(program: &str) -> bool {
    if program.is_empty() {
        return false;
    }
    let path = std::path::Path::new(program);
    if path.components().count() > 1 {
        return path.is_file();
    }
    let Some(paths) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&paths).any(|dir| {
        let candidate = dir.join(program);
        candidate.is_file() || (cfg!(windows) && candidate.with_extension("exe").is_file())
    })
}
