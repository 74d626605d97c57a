//! Agent loop, conversations and the engine facade
//!
//! # Architecture
//!
//! ```text
//! User message → Engine::run_turn → Router
//!                  │
//!                  ├── chat ──► chat model ──► reply
//!                  │
//!                  └── agent ─► AgentController ──► agent model (streamed)
//!                                    ↓
//!                              BlockParser → CodeBlocks
//!                                    ↓
//!                              SafetyGate (+ Confirmer)
//!                                    ↓
//!                              RuntimeRegistry.acquire() → Session.execute()
//!                                    ↓
//!                              OutputGovernor → transcript → model → loop or done
//! ```

pub mod compact;
pub mod controller;
pub mod conversation;
pub mod engine;
pub mod history;

pub use controller::{AgentController, DoneReason, TurnEvent, TurnSummary, TurnWarning};
pub use conversation::{Conversation, Role, TranscriptEntry};
pub use engine::Engine;
pub use history::{ConversationSummary, FileHistoryStore, HistoryStore, MemoryHistoryStore};
