//! localagent - let a language model run code on the local machine
//!
//! A message is routed either to a small chat model or to the agent loop.
//! The agent loop streams the model's reply, extracts fenced code blocks
//! (or native tool calls), runs them in persistent per-language
//! interpreters under a safety policy, bounds the output and feeds it back
//! until the model is done.
//!
//! # Modules
//!
//! - `agent` - conversation loop controller, transcript, history, `Engine`
//! - `parser` - incremental fenced-block parser and tool-call extraction
//! - `runtime` - language runtimes, execution sessions, session registry
//! - `safety` - safe modes, deny patterns, confirmation
//! - `output` - output budget (head/tail truncation)
//! - `router` - chat vs agent routing
//! - `model` - model backend trait, Ollama client, scripted backend
//! - `config` - engine configuration
//! - `metrics` - Prometheus metrics for observability
//! - `tracing` - logging and OpenTelemetry export
//!
//! # Quick Start
//!
//! ```ignore
//! use localagent::{Engine, EngineConfig, MemoryHistoryStore, OllamaBackend, AutoApprove};
//!
//! let config = EngineConfig::default();
//! let backend = Arc::new(OllamaBackend::from_config(&config.model)?);
//! let engine = Engine::new(config, backend, Arc::new(AutoApprove), Arc::new(MemoryHistoryStore::new()))?;
//!
//! let events = engine.run_turn("c1", "/agent how many files are in /tmp?");
//! ```

pub mod agent;
pub mod config;
pub mod error;
pub mod metrics;
pub mod model;
pub mod output;
pub mod parser;
pub mod router;
pub mod runtime;
pub mod safety;
pub mod tracing;

// Re-export commonly used types at crate root for convenience
pub use agent::{Conversation, Engine, FileHistoryStore, MemoryHistoryStore, TurnEvent};
pub use config::{EngineConfig, SafeMode};
pub use error::{AgentError, EngineError};
pub use model::{ModelBackend, OllamaBackend, ScriptedBackend};
pub use router::{RouteDecision, RoutePath, Router};
pub use runtime::{ExecutionResult, ExecutionStatus, Language, RuntimeRegistry};
pub use safety::{AutoApprove, AutoDeny, ChannelConfirmer};
