//! Engine facade
//!
//! The surface an HTTP or CLI shell talks to. Owns the router, the agent
//! controller, the runtime registry and the conversation store. Turns of
//! one conversation are serialized by a per-conversation lock; different
//! conversations run concurrently. Conversations nobody used for the
//! runtime idle timeout are dropped from memory and reloaded from the
//! history store on their next turn.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_stream::try_stream;
use futures_util::future::Either;
use futures_util::{pin_mut, Stream, StreamExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::{AgentError, EngineError, HistoryError};
use crate::model::ModelBackend;
use crate::router::{RouteDecision, RoutePath, Router};
use crate::runtime::{HealthReport, RuntimeRegistry};
use crate::safety::Confirmer;

use super::controller::{AgentController, TurnEvent};
use super::conversation::Conversation;
use super::history::HistoryStore;

type ConversationSlot = Arc<tokio::sync::Mutex<Conversation>>;

struct CachedConversation {
    slot: ConversationSlot,
    last_used: Instant,
}

/// Conversations held in memory, shared with the idle sweeper
#[derive(Default)]
struct ConversationCache {
    entries: Mutex<HashMap<String, CachedConversation>>,
}

impl ConversationCache {
    fn entries(&self) -> MutexGuard<'_, HashMap<String, CachedConversation>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn touch(&self, id: &str) {
        if let Some(cached) = self.entries().get_mut(id) {
            cached.last_used = Instant::now();
        }
    }

    fn get(&self, id: &str) -> Option<ConversationSlot> {
        let mut entries = self.entries();
        let cached = entries.get_mut(id)?;
        cached.last_used = Instant::now();
        Some(cached.slot.clone())
    }

    /// Insert unless another caller loaded the conversation first
    fn insert(&self, id: &str, conversation: Conversation) -> ConversationSlot {
        let mut entries = self.entries();
        let cached = entries.entry(id.to_string()).or_insert_with(|| CachedConversation {
            slot: Arc::new(tokio::sync::Mutex::new(conversation)),
            last_used: Instant::now(),
        });
        cached.last_used = Instant::now();
        cached.slot.clone()
    }

    fn remove(&self, id: &str, slot: &ConversationSlot) {
        let mut entries = self.entries();
        if entries.get(id).is_some_and(|c| Arc::ptr_eq(&c.slot, slot)) {
            entries.remove(id);
        }
    }

    /// Drop conversations unused for `idle`; one held by a turn stays
    fn evict_idle(&self, idle: Duration) -> usize {
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|_, c| Arc::strong_count(&c.slot) > 1 || c.last_used.elapsed() <= idle);
        before - entries.len()
    }

    fn len(&self) -> usize {
        self.entries().len()
    }
}

pub struct Engine {
    config: Arc<EngineConfig>,
    router: Router,
    controller: AgentController,
    registry: Arc<RuntimeRegistry>,
    history: Arc<dyn HistoryStore>,
    conversations: Arc<ConversationCache>,
    /// Cancellation handle of the turn running in each conversation
    active: Mutex<HashMap<String, CancellationToken>>,
    /// Session reaper and conversation sweeper
    background: Mutex<Vec<JoinHandle<()>>>,
}

/// Removes the turn's cancellation handle however the turn stream ends
struct ActiveTurn<'a> {
    engine: &'a Engine,
    conversation: &'a str,
    token: CancellationToken,
}

impl Drop for ActiveTurn<'_> {
    fn drop(&mut self) {
        let mut active = self
            .engine
            .active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        // A dropped stream stops whatever the turn was doing
        self.token.cancel();
        active.remove(self.conversation);
    }
}

impl Engine {
    /// Build the engine, start the session reaper and the conversation sweeper
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(
        config: EngineConfig,
        backend: Arc<dyn ModelBackend>,
        confirmer: Arc<dyn Confirmer>,
        history: Arc<dyn HistoryStore>,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        let config = Arc::new(config);
        let registry = Arc::new(RuntimeRegistry::new(config.runtime.clone()));
        let controller = AgentController::new(config.clone(), backend, registry.clone(), confirmer)?;
        let reaper = RuntimeRegistry::start_reaper(registry.clone());
        let conversations = Arc::new(ConversationCache::default());
        let sweeper = start_sweeper(
            conversations.clone(),
            config.runtime.idle_timeout(),
            Duration::from_secs(config.runtime.reap_interval_secs.max(1)),
        );

        info!(
            agent_model = %config.model.agent_model,
            chat_model = %config.model.chat_model,
            safe_mode = config.safety.mode.as_str(),
            "Engine started"
        );

        Ok(Self {
            router: Router::new(&config.router),
            config,
            controller,
            registry,
            history,
            conversations,
            active: Mutex::new(HashMap::new()),
            background: Mutex::new(vec![reaper, sweeper]),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn history(&self) -> &Arc<dyn HistoryStore> {
        &self.history
    }

    pub fn route(&self, message: &str) -> RouteDecision {
        self.router.route(message)
    }

    /// Route `message` and run it in `conversation`
    ///
    /// Starts with `TurnEvent::Routed` and ends with `TurnEvent::Done`, or
    /// with a single `Err` when the turn fails. The conversation is saved
    /// to the history store either way; when that also fails the error
    /// carries both causes. Dropping the stream cancels the turn.
    pub fn run_turn<'a>(
        &'a self,
        conversation_id: &'a str,
        message: &'a str,
    ) -> impl Stream<Item = Result<TurnEvent, EngineError>> + 'a {
        try_stream! {
            let decision = self.route(message);
            debug!(conversation = conversation_id, path = decision.path.as_str(), "Routed message");
            yield TurnEvent::Routed(decision.clone());

            let slot = self.conversation_slot(conversation_id).await?;
            let mut conversation = slot.lock_owned().await;
            let turn = self.begin_turn(conversation_id);
            let text = decision.strip_marker(message);

            let mut failure: Option<AgentError> = None;
            {
                let cancel = turn.token.clone();
                let events = match decision.path {
                    RoutePath::Chat => Either::Left(self.controller.run_chat(&mut conversation, text, cancel)),
                    RoutePath::Agent => Either::Right(self.controller.run_turn(&mut conversation, text, cancel)),
                };
                pin_mut!(events);
                while let Some(event) = events.next().await {
                    match event {
                        Ok(event) => yield event,
                        Err(e) => {
                            failure = Some(e);
                            break;
                        }
                    }
                }
            }
            drop(turn);

            // The lock stays held so saves of one conversation never reorder
            let snapshot = conversation.clone();
            let saved = with_history(&self.history, move |history| history.save(&snapshot)).await;
            self.conversations.touch(conversation_id);

            match (failure, saved) {
                (None, Ok(())) => {}
                (Some(turn), Ok(())) => Err::<(), _>(turn)?,
                (None, Err(save)) => {
                    warn!(conversation = conversation_id, error = %save, "Failed to save conversation");
                    Err::<(), _>(save)?
                }
                (Some(turn), Err(save)) => {
                    warn!(conversation = conversation_id, error = %save, "Failed to save conversation");
                    Err::<(), _>(EngineError::TurnNotSaved { turn, save })?
                }
            }
        }
    }

    /// Cancel the turn running in `conversation`; false when none is running
    pub fn cancel_turn(&self, conversation: &str) -> bool {
        let active = self
            .active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match active.get(conversation) {
            Some(token) => {
                info!(conversation, "Cancelling turn");
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Terminate the conversation's sessions, clear its history and drop
    /// it from memory
    ///
    /// Waits for a running turn to finish; cancel it first to reset promptly.
    pub async fn reset_conversation(&self, conversation_id: &str) -> Result<(), EngineError> {
        let slot = self.conversation_slot(conversation_id).await?;
        let mut conversation = slot.lock().await;
        self.registry.reset(conversation_id).await;
        conversation.clear();
        let id = conversation_id.to_string();
        with_history(&self.history, move |history| history.delete(&id)).await?;
        self.conversations.remove(conversation_id, &slot);
        info!(conversation = conversation_id, "Conversation reset");
        Ok(())
    }

    /// Snapshot of a conversation's transcript
    pub async fn conversation(&self, conversation_id: &str) -> Result<Conversation, EngineError> {
        let slot = self.conversation_slot(conversation_id).await?;
        let conversation = slot.lock().await;
        Ok(conversation.clone())
    }

    pub async fn health(&self) -> HealthReport {
        self.registry.health().await
    }

    /// Cancel running turns, stop the reaper and terminate every session
    pub async fn shutdown(&self) {
        {
            let active = self
                .active
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            for token in active.values() {
                token.cancel();
            }
        }
        let background: Vec<_> = self
            .background
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .drain(..)
            .collect();
        for task in background {
            task.abort();
        }
        self.registry.shutdown().await;
        info!("Engine shut down");
    }

    /// The in-memory conversation, loading it from history on first use
    async fn conversation_slot(&self, conversation_id: &str) -> Result<ConversationSlot, HistoryError> {
        if let Some(slot) = self.conversations.get(conversation_id) {
            return Ok(slot);
        }

        let id = conversation_id.to_string();
        let conversation = match with_history(&self.history, move |history| history.load(&id)).await? {
            Some(conversation) => {
                debug!(conversation = conversation_id, entries = conversation.len(), "Loaded conversation");
                conversation
            }
            None => Conversation::new(conversation_id),
        };
        Ok(self.conversations.insert(conversation_id, conversation))
    }

    fn begin_turn<'a>(&'a self, conversation: &'a str) -> ActiveTurn<'a> {
        let token = CancellationToken::new();
        let mut active = self
            .active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        active.insert(conversation.to_string(), token.clone());
        ActiveTurn {
            engine: self,
            conversation,
            token,
        }
    }
}

/// Run a history store call on the blocking pool
async fn with_history<T, F>(history: &Arc<dyn HistoryStore>, call: F) -> Result<T, HistoryError>
where
    F: FnOnce(&dyn HistoryStore) -> Result<T, HistoryError> + Send + 'static,
    T: Send + 'static,
{
    let history = history.clone();
    tokio::task::spawn_blocking(move || call(history.as_ref())).await?
}

/// Periodically drop idle conversations from memory
fn start_sweeper(cache: Arc<ConversationCache>, idle: Duration, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        // First tick completes immediately
        interval.tick().await;

        loop {
            interval.tick().await;
            let evicted = cache.evict_idle(idle);
            if evicted > 0 {
                debug!(evicted, "Dropped idle conversations from memory");
            }
        }
    })
}
