//! Integration tests for the engine
//!
//! These drive full turns through `Engine` with a scripted model backend
//! and real interpreter processes. Tests that need `python3` or `bash`
//! are skipped (with a message) when the interpreter is not on `PATH`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{pin_mut, StreamExt};
use serde_json::json;

use localagent::agent::{DoneReason, Engine, HistoryStore, MemoryHistoryStore, Role, TurnEvent, TurnWarning};
use localagent::config::{EngineConfig, SafeMode};
use localagent::error::{AgentError, EngineError};
use localagent::model::{ScriptedBackend, ScriptedReply, ToolCall};
use localagent::router::RoutePath;
use localagent::runtime::{
    program_available, ExecErrorKind, ExecutionResult, ExecutionStatus, Language, OutputSegment,
};
use localagent::safety::{AutoApprove, AutoDeny, Confirmer};
use localagent::FileHistoryStore;

macro_rules! require {
    ($program:expr) => {
        if !program_available($program) {
            eprintln!("skipping: {} is not on PATH", $program);
            return;
        }
    };
}

const DONE: &str = "The task is done.";

fn config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.runtime.start_retry_delay_ms = 10;
    config
}

fn engine(config: EngineConfig, backend: &ScriptedBackend, confirmer: Arc<dyn Confirmer>) -> Engine {
    Engine::new(
        config,
        Arc::new(backend.clone()),
        confirmer,
        Arc::new(MemoryHistoryStore::new()),
    )
    .unwrap()
}

async fn run(engine: &Engine, conversation: &str, message: &str) -> (Vec<TurnEvent>, Option<EngineError>) {
    let stream = engine.run_turn(conversation, message);
    pin_mut!(stream);
    let mut events = Vec::new();
    let mut error = None;
    while let Some(item) = stream.next().await {
        match item {
            Ok(event) => events.push(event),
            Err(e) => error = Some(e),
        }
    }
    (events, error)
}

fn block_results(events: &[TurnEvent]) -> Vec<&ExecutionResult> {
    events
        .iter()
        .filter_map(|e| match e {
            TurnEvent::Result(result) => Some(result),
            _ => None,
        })
        .collect()
}

fn done_reason(events: &[TurnEvent]) -> Option<DoneReason> {
    events.iter().find_map(|e| match e {
        TurnEvent::Done(summary) => Some(summary.reason),
        _ => None,
    })
}

async fn live_sessions(engine: &Engine, language: Language) -> usize {
    engine
        .health()
        .await
        .languages
        .into_iter()
        .find(|l| l.language == language)
        .map(|l| l.active_sessions)
        .unwrap_or(0)
}

#[tokio::test]
async fn test_greeting_takes_chat_path() {
    let backend = ScriptedBackend::with_texts(["Hello! How can I help?"]);
    let engine = engine(config(), &backend, Arc::new(AutoApprove));

    let (events, error) = run(&engine, "c1", "hello").await;
    assert!(error.is_none());
    assert!(matches!(&events[0], TurnEvent::Routed(d) if d.path == RoutePath::Chat));
    assert_eq!(done_reason(&events), Some(DoneReason::ChatReply));
    assert!(block_results(&events).is_empty());

    let reply: String = events
        .iter()
        .filter_map(|e| match e {
            TurnEvent::AssistantDelta(text) => Some(text.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(reply, "Hello! How can I help?");
    assert_eq!(engine.health().await.active_conversations, 0);
}

#[tokio::test]
async fn test_python_print_runs_once() {
    require!("python3");
    let backend = ScriptedBackend::with_texts([
        "Let me compute that.\n```python\nprint(2+2)\n```\n",
        "The answer is 4. The task is done.",
    ]);
    let engine = engine(config(), &backend, Arc::new(AutoApprove));

    let (events, error) = run(&engine, "c1", "/agent what is 2+2?").await;
    assert!(error.is_none(), "{error:?}");
    let results = block_results(&events);
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].status, ExecutionStatus::Success);
    assert!(results[0].output.contains('4'));
    assert_eq!(done_reason(&events), Some(DoneReason::NoBlocks));

    // The output reaches the model on the next call
    let requests = backend.requests();
    assert_eq!(requests.len(), 2);
    let feedback = &requests[1].messages.last().unwrap().content;
    assert!(feedback.starts_with("Code output: 4"));

    let conversation = engine.conversation("c1").await.unwrap();
    let roles: Vec<Role> = conversation.entries().iter().map(|e| e.role).collect();
    assert_eq!(roles, vec![Role::User, Role::Assistant, Role::Execution, Role::Assistant]);
    engine.shutdown().await;
}

#[tokio::test]
async fn test_ask_mode_denial_skips_block() {
    let mut config = config();
    config.safety.mode = SafeMode::Ask;
    let backend = ScriptedBackend::with_texts([
        "```shell\nrm -rf ~/projects\n```",
        "Understood, I won't delete anything.",
    ]);
    let engine = engine(config, &backend, Arc::new(AutoDeny));

    let (events, error) = run(&engine, "c1", "/agent clean my projects").await;
    assert!(error.is_none());
    let results = block_results(&events);
    assert_eq!(results.len(), 1);
    assert!(matches!(results[0].status, ExecutionStatus::Denied { .. }));
    assert_eq!(done_reason(&events), Some(DoneReason::NoBlocks));
    assert_eq!(live_sessions(&engine, Language::Shell).await, 0);
}

#[tokio::test]
async fn test_auto_mode_escalates_dangerous_block() {
    let mut config = config();
    config.safety.mode = SafeMode::Auto;
    let backend = ScriptedBackend::with_texts(["```bash\nrm -rf /\n```", "Okay."]);
    let engine = engine(config, &backend, Arc::new(AutoDeny));

    let (events, _) = run(&engine, "c1", "/agent wipe it").await;
    let verdict = events.iter().find_map(|e| match e {
        TurnEvent::Safety { decision, .. } => Some(decision.verdict),
        _ => None,
    });
    assert_eq!(verdict, Some(localagent::safety::Verdict::NeedsConfirmation));
    assert!(matches!(block_results(&events)[0].status, ExecutionStatus::Denied { .. }));
}

#[tokio::test]
async fn test_infinite_loop_times_out_and_terminates_session() {
    require!("python3");
    let mut config = config();
    config.runtime.execution_timeout_secs = 5;
    let backend = ScriptedBackend::with_texts(["```python\nwhile True:\n    pass\n```", DONE]);
    let engine = engine(config, &backend, Arc::new(AutoApprove));

    let started = Instant::now();
    let (events, error) = run(&engine, "c1", "/agent spin forever").await;
    assert!(error.is_none(), "{error:?}");
    assert!(started.elapsed() < Duration::from_secs(20));

    let results = block_results(&events);
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].status, ExecutionStatus::TimedOut);
    assert_eq!(live_sessions(&engine, Language::Python).await, 0);
}

#[tokio::test]
async fn test_each_block_gets_one_result_in_order() {
    require!("bash");
    let backend = ScriptedBackend::with_texts([
        "```bash\necho one\n```\nthen\n```sh\necho two\n```\nand\n```shell\necho three\n```",
        DONE,
    ]);
    let engine = engine(config(), &backend, Arc::new(AutoApprove));

    let (events, error) = run(&engine, "c1", "/agent count").await;
    assert!(error.is_none(), "{error:?}");
    let results = block_results(&events);
    let ordinals: Vec<usize> = results.iter().map(|r| r.block.ordinal).collect();
    assert_eq!(ordinals, vec![0, 1, 2]);
    let outputs: Vec<&str> = results.iter().map(|r| r.output.as_str()).collect();
    assert_eq!(outputs, vec!["one", "two", "three"]);
    assert!(results.iter().all(|r| r.status.is_success()));

    // One shell session served all three blocks
    assert_eq!(live_sessions(&engine, Language::Shell).await, 1);
    engine.shutdown().await;
}

#[tokio::test]
async fn test_reply_without_blocks_ends_after_one_call() {
    let backend = ScriptedBackend::with_texts(["You can use `ls -la` for that."]);
    let engine = engine(config(), &backend, Arc::new(AutoApprove));

    let (events, error) = run(&engine, "c1", "/agent how do I list files").await;
    assert!(error.is_none());
    assert!(block_results(&events).is_empty());
    assert_eq!(done_reason(&events), Some(DoneReason::NoBlocks));
    assert_eq!(backend.requests().len(), 1);
}

#[tokio::test]
async fn test_max_turns_reported() {
    require!("bash");
    let mut config = config();
    config.agent.max_turns = 3;
    let backend = ScriptedBackend::new([]).repeat_last(ScriptedReply::text("```bash\necho again\n```"));
    let engine = engine(config, &backend, Arc::new(AutoApprove));

    let (events, error) = run(&engine, "c1", "/agent keep going").await;
    assert!(error.is_none());
    assert_eq!(block_results(&events).len(), 3);
    assert!(events
        .iter()
        .any(|e| matches!(e, TurnEvent::Warning(TurnWarning::MaxTurnsReached { limit: 3 }))));
    assert_eq!(done_reason(&events), Some(DoneReason::MaxTurns));
    engine.shutdown().await;
}

#[tokio::test]
async fn test_cancel_interrupts_block_and_keeps_session() {
    require!("python3");
    let backend = ScriptedBackend::with_texts([
        "```python\nimport time\nvalue = 7\ntime.sleep(30)\n```\n```python\nprint('skipped')\n```",
        "```python\nprint(value * 6)\n```",
        DONE,
    ]);
    let engine = Arc::new(engine(config(), &backend, Arc::new(AutoApprove)));

    let canceller = {
        let engine = engine.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(1500)).await;
            engine.cancel_turn("c1")
        })
    };

    let started = Instant::now();
    let (events, error) = run(&engine, "c1", "/agent sleep then print").await;
    assert!(error.is_none(), "{error:?}");
    assert!(canceller.await.unwrap());
    assert!(started.elapsed() < Duration::from_secs(20));

    let results = block_results(&events);
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].status, ExecutionStatus::Interrupted);
    assert_eq!(done_reason(&events), Some(DoneReason::Cancelled));
    assert_eq!(live_sessions(&engine, Language::Python).await, 1);

    // Interpreter state survived the interrupt
    let (events, error) = run(&engine, "c1", "/agent continue").await;
    assert!(error.is_none(), "{error:?}");
    assert_eq!(block_results(&events)[0].output, "42");
    engine.shutdown().await;
}

#[tokio::test]
async fn test_state_persists_across_turns() {
    require!("python3");
    let backend = ScriptedBackend::with_texts([
        "```python\ncounter = 41\n```",
        DONE,
        "```python\nprint(counter + 1)\n```",
        DONE,
    ]);
    let engine = engine(config(), &backend, Arc::new(AutoApprove));

    let (events, _) = run(&engine, "c1", "/agent set counter").await;
    // No text output: the empty-output template is used
    assert_eq!(block_results(&events)[0].output, "");
    let (events, _) = run(&engine, "c1", "/agent print counter").await;
    assert_eq!(block_results(&events)[0].output, "42");
    engine.shutdown().await;
}

#[tokio::test]
async fn test_sessions_not_shared_across_conversations() {
    require!("python3");
    let backend = ScriptedBackend::with_texts([
        "```python\nsecret = 1\n```",
        DONE,
        "```python\nprint(secret)\n```",
        DONE,
    ]);
    let engine = engine(config(), &backend, Arc::new(AutoApprove));

    run(&engine, "c1", "/agent set").await;
    let (events, _) = run(&engine, "c2", "/agent read").await;
    let result = block_results(&events)[0];
    assert!(matches!(
        result.status,
        ExecutionStatus::Error { kind: ExecErrorKind::Execution, .. }
    ));
    assert!(result.output.contains("NameError"));
    assert_eq!(live_sessions(&engine, Language::Python).await, 2);
    engine.shutdown().await;
}

#[tokio::test]
async fn test_reset_clears_sessions_and_history() {
    require!("python3");
    let backend = ScriptedBackend::with_texts([
        "```python\nx = 5\n```",
        DONE,
        "```python\nprint(x)\n```",
        "x is gone.",
    ]);
    let engine = engine(config(), &backend, Arc::new(AutoApprove));

    run(&engine, "c1", "/agent set x").await;
    assert_eq!(live_sessions(&engine, Language::Python).await, 1);

    engine.reset_conversation("c1").await.unwrap();
    assert_eq!(live_sessions(&engine, Language::Python).await, 0);
    assert!(engine.conversation("c1").await.unwrap().is_empty());

    let (events, _) = run(&engine, "c1", "/agent print x").await;
    assert!(block_results(&events)[0].output.contains("NameError"));
    assert_eq!(engine.conversation("c1").await.unwrap().len(), 4);
    engine.shutdown().await;
}

#[tokio::test]
async fn test_start_failure_fails_fast_afterwards() {
    let mut config = config();
    config.runtime.commands.javascript.program = "/nonexistent/localagent-node".to_string();
    let backend = ScriptedBackend::with_texts([
        "```javascript\nconsole.log(1)\n```",
        "```js\nconsole.log(2)\n```",
        "JavaScript is unavailable. The task is impossible.",
    ]);
    let engine = engine(config, &backend, Arc::new(AutoApprove));

    // First failure ends the turn
    let (events, error) = run(&engine, "c1", "/agent run js").await;
    assert!(matches!(
        error,
        Some(EngineError::Agent(AgentError::RuntimeStart(_)))
    ));
    assert!(matches!(
        block_results(&events)[0].status,
        ExecutionStatus::Error { kind: ExecErrorKind::RuntimeStart, .. }
    ));

    // Later blocks fail at block level without retrying
    let started = Instant::now();
    let (events, error) = run(&engine, "c1", "/agent try again").await;
    assert!(error.is_none(), "{error:?}");
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(matches!(
        block_results(&events)[0].status,
        ExecutionStatus::Error { kind: ExecErrorKind::UnsupportedLanguage, .. }
    ));
    let health = engine.health().await;
    let js = health
        .languages
        .iter()
        .find(|l| l.language == Language::JavaScript)
        .unwrap();
    assert!(!js.available);
    assert_eq!(js.unsupported_in, 1);
}

#[tokio::test]
async fn test_native_tool_call_executes() {
    require!("python3");
    let backend = ScriptedBackend::new([
        ScriptedReply::tool_call(ToolCall::new(
            "execute",
            json!({"language": "python", "code": "print(6 * 7)"}),
        )),
        ScriptedReply::text(DONE),
    ]);
    let mut config = config();
    config.model.native_tool_calls = true;
    let engine = engine(config, &backend, Arc::new(AutoApprove));

    let (events, error) = run(&engine, "c1", "/agent multiply").await;
    assert!(error.is_none(), "{error:?}");
    assert_eq!(block_results(&events)[0].output, "42");
    assert!(backend.requests()[0].tools.is_some());
    engine.shutdown().await;
}

#[tokio::test]
async fn test_unterminated_fence_is_reported_not_run() {
    let backend = ScriptedBackend::with_texts(["```python\nprint('never closed')"]);
    let engine = engine(config(), &backend, Arc::new(AutoApprove));

    let (events, error) = run(&engine, "c1", "/agent go").await;
    assert!(error.is_none());
    assert!(events.iter().any(|e| matches!(e, TurnEvent::ParseIssue(_))));
    assert!(block_results(&events).is_empty());

    let conversation = engine.conversation("c1").await.unwrap();
    assert_eq!(conversation.last().map(|e| e.role), Some(Role::Execution));
}

#[tokio::test]
async fn test_output_is_truncated_to_budget() {
    require!("python3");
    let mut config = config();
    config.output.max_output_chars = 200;
    let backend = ScriptedBackend::with_texts([
        "```python\nfor i in range(1000):\n    print(i)\n```",
        DONE,
    ]);
    let engine = engine(config, &backend, Arc::new(AutoApprove));

    let (events, _) = run(&engine, "c1", "/agent print numbers").await;
    let result = block_results(&events)[0];
    assert!(result.truncated);
    assert!(result.output.starts_with("0\n1\n2\n"));
    assert!(result.output.ends_with("998\n999"));
    assert!(result.output.contains("characters elided"));
    // The kept segments obey the same budget
    assert!(result.segments.len() < 200, "{} segments kept", result.segments.len());
    assert_eq!(result.segments.first(), Some(&OutputSegment::Text("0".to_string())));
    assert_eq!(result.segments.last(), Some(&OutputSegment::Text("999".to_string())));
    engine.shutdown().await;
}

#[tokio::test]
async fn test_conversation_reloaded_from_file_store() {
    let dir = tempfile::tempdir().unwrap();
    let backend = ScriptedBackend::with_texts(["Hi!", "Welcome back!"]);

    {
        let store = Arc::new(FileHistoryStore::new(dir.path()).unwrap());
        let engine = Engine::new(config(), Arc::new(backend.clone()), Arc::new(AutoApprove), store).unwrap();
        run(&engine, "c1", "hello").await;
    }

    let store = Arc::new(FileHistoryStore::new(dir.path()).unwrap());
    assert_eq!(store.list().unwrap().len(), 1);
    let engine = Engine::new(config(), Arc::new(backend.clone()), Arc::new(AutoApprove), store).unwrap();
    run(&engine, "c1", "hello again").await;

    // The second call carries the first exchange
    let messages = &backend.requests()[1].messages;
    let contents: Vec<&str> = messages.iter().map(|m| m.content.as_str()).collect();
    assert!(contents.contains(&"Hi!"));
    assert_eq!(engine.conversation("c1").await.unwrap().len(), 4);
}

#[test]
fn test_agent_marker_always_routes_to_agent() {
    let router = localagent::Router::new(&EngineConfig::default().router);
    for message in ["/agent hi", "/agent tell me a joke", "!ls"] {
        assert_eq!(router.route(message).path, RoutePath::Agent);
    }
}
