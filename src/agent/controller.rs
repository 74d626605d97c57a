//! Conversation loop controller
//!
//! Drives one user request through the agent loop:
//!
//! ```text
//! AwaitingResponse ──► Parsing ──► (Gating ──► Executing)* ──► AwaitingResponse
//!        │                │                                        │
//!        └── cancelled    └── no blocks / loop breaker ──► Done ◄──┘ max turns
//! ```
//!
//! Every model call gets the full transcript, so the output of each block
//! is seen by the model on the next call. Blocks of one reply run strictly
//! one after another. Only two failures end a turn with an error: the
//! model backend failing, and a runtime that cannot be started at all.
//! Everything else is reported on the block's `ExecutionResult`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_stream::try_stream;
use futures_util::{pin_mut, Stream, StreamExt};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::{ConfigError, EngineConfig};
use crate::error::{AgentError, RuntimeError};
use crate::metrics::{
    BLOCKS_TOTAL, EXECUTION_DURATION, MODEL_CALL_DURATION, OUTPUT_TRUNCATIONS, SAFETY_VERDICTS,
    TURNS_TOTAL,
};
use crate::model::{agent_system_prompt, execute_tool, GenerateRequest, ModelBackend, ModelSegment};
use crate::output::{OutputCollector, OutputGovernor};
use crate::parser::{
    parse_tool_calls_from_text, BlockOrigin, BlockParser, CodeBlock, ParseIssue, ParserOptions,
    Segment, EXECUTE_TOOL_NAMES,
};
use crate::router::RouteDecision;
use crate::runtime::{
    BlockRef, ExecErrorKind, ExecEvent, ExecLimits, ExecutionResult, ExecutionStatus,
    OutputSegment, RuntimeRegistry,
};
use crate::safety::{
    confirm_with_timeout, ConfirmationOutcome, ConfirmationRequest, Confirmer, SafetyDecision,
    SafetyGate, Verdict,
};

use super::conversation::Conversation;

/// Progress of a turn, streamed to the caller
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum TurnEvent {
    /// Which path the engine picked for the message
    Routed(RouteDecision),
    /// A fragment of the assistant reply as it streams in
    AssistantDelta(String),
    ParseIssue(ParseIssue),
    /// A block is about to be gated
    Block(CodeBlock),
    Safety {
        ordinal: usize,
        decision: SafetyDecision,
    },
    Output {
        ordinal: usize,
        segment: OutputSegment,
    },
    Result(ExecutionResult),
    Warning(TurnWarning),
    Done(TurnSummary),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnWarning {
    /// The loop stopped at the model call limit with work possibly left
    MaxTurnsReached { limit: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DoneReason {
    /// Answered on the chat path
    ChatReply,
    /// The last reply had no executable blocks
    NoBlocks,
    /// The last reply contained a loop breaker phrase
    LoopBreaker,
    MaxTurns,
    Cancelled,
    /// A block failed and `halt_on_error` is set
    HaltOnError,
}

impl DoneReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DoneReason::ChatReply => "chat_reply",
            DoneReason::NoBlocks => "no_blocks",
            DoneReason::LoopBreaker => "loop_breaker",
            DoneReason::MaxTurns => "max_turns",
            DoneReason::Cancelled => "cancelled",
            DoneReason::HaltOnError => "halt_on_error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TurnSummary {
    pub reason: DoneReason,
    /// Model calls made
    pub turns: usize,
    /// Blocks that produced an `ExecutionResult`
    pub blocks: usize,
    pub trace_id: String,
}

/// What one model call produced
struct Reply {
    text: String,
    segments: Vec<Segment>,
    cancelled: bool,
}

enum ModelStep {
    Item(Option<Result<ModelSegment, crate::error::ModelError>>),
    Cancelled,
}

/// Runs agent turns against a model backend and the runtime registry
pub struct AgentController {
    config: Arc<EngineConfig>,
    backend: Arc<dyn ModelBackend>,
    registry: Arc<RuntimeRegistry>,
    gate: SafetyGate,
    confirmer: Arc<dyn Confirmer>,
    governor: OutputGovernor,
    system_prompt: String,
}

impl AgentController {
    pub fn new(
        config: Arc<EngineConfig>,
        backend: Arc<dyn ModelBackend>,
        registry: Arc<RuntimeRegistry>,
        confirmer: Arc<dyn Confirmer>,
    ) -> Result<Self, ConfigError> {
        let gate = SafetyGate::new(&config.safety)?;
        let governor = OutputGovernor::from_config(&config.output);
        let system_prompt = agent_system_prompt(&config.model);
        Ok(Self {
            config,
            backend,
            registry,
            gate,
            confirmer,
            governor,
            system_prompt,
        })
    }

    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    pub fn registry(&self) -> &Arc<RuntimeRegistry> {
        &self.registry
    }

    fn parser_options(&self) -> ParserOptions {
        ParserOptions {
            default_language: self.config.agent.default_language.clone(),
            flush_incomplete: self.config.agent.flush_incomplete_blocks,
        }
    }

    /// Answer `message` with the chat model; nothing is executed
    pub fn run_chat<'a>(
        &'a self,
        conversation: &'a mut Conversation,
        message: &'a str,
        cancel: CancellationToken,
    ) -> impl Stream<Item = Result<TurnEvent, AgentError>> + 'a {
        try_stream! {
            let trace_id = Uuid::now_v7().to_string();
            let model = self.config.model.chat_model.clone();
            conversation.push_user(message);

            let request = GenerateRequest {
                model: model.clone(),
                messages: conversation.to_window_messages(
                    &self.config.model.chat_system_prompt,
                    &self.config.agent,
                ),
                tools: None,
                temperature: self.config.model.temperature,
                trace_id: Some(trace_id.clone()),
            };

            let span = info_span!("model_call", trace_id = %trace_id, model = %model, path = "chat");
            let started = Instant::now();
            let mut stream = self
                .backend
                .generate(request)
                .instrument(span)
                .await
                .map_err(|e| turn_failed(&trace_id, e))?;

            let mut text = String::new();
            let mut cancelled = false;
            loop {
                let step = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => ModelStep::Cancelled,
                    item = stream.next() => ModelStep::Item(item),
                };
                match step {
                    ModelStep::Cancelled => {
                        cancelled = true;
                        break;
                    }
                    ModelStep::Item(None) => break,
                    ModelStep::Item(Some(Err(e))) => Err(turn_failed(&trace_id, e))?,
                    ModelStep::Item(Some(Ok(ModelSegment::Text(piece)))) => {
                        text.push_str(&piece);
                        yield TurnEvent::AssistantDelta(piece);
                    }
                    // The chat path sends no tool schema
                    ModelStep::Item(Some(Ok(ModelSegment::ToolCall(call)))) => {
                        debug!(trace_id = %trace_id, tool = %call.function.name, "Ignoring tool call on chat path");
                    }
                }
            }
            MODEL_CALL_DURATION
                .with_label_values(&[&model])
                .observe(started.elapsed().as_secs_f64());

            conversation.push_assistant(text);
            let reason = if cancelled { DoneReason::Cancelled } else { DoneReason::ChatReply };
            TURNS_TOTAL.with_label_values(&[reason.as_str()]).inc();
            yield TurnEvent::Done(TurnSummary {
                reason,
                turns: 1,
                blocks: 0,
                trace_id,
            });
        }
    }

    /// Run the agent loop for `message`
    ///
    /// The stream ends after `TurnEvent::Done`, or after a single `Err`
    /// when the turn fails.
    pub fn run_turn<'a>(
        &'a self,
        conversation: &'a mut Conversation,
        message: &'a str,
        cancel: CancellationToken,
    ) -> impl Stream<Item = Result<TurnEvent, AgentError>> + 'a {
        try_stream! {
            let trace_id = Uuid::now_v7().to_string();
            let turn_span = info_span!(
                "agent_turn",
                trace_id = %trace_id,
                conversation = %conversation.id,
                model = %self.config.model.agent_model,
                otel.name = "agent_turn"
            );
            info!(parent: &turn_span, trace_id = %trace_id, "Starting agent turn");

            let max_turns = self.config.agent.max_turns;
            let limits = ExecLimits::from(self.registry.config());
            let mut model_calls = 0usize;
            let mut executed = 0usize;

            conversation.push_user(message);

            let reason = 'turn: loop {
                if cancel.is_cancelled() {
                    break 'turn DoneReason::Cancelled;
                }
                if model_calls >= max_turns {
                    warn!(parent: &turn_span, trace_id = %trace_id, max_turns, "Max turns reached");
                    yield TurnEvent::Warning(TurnWarning::MaxTurnsReached { limit: max_turns });
                    break 'turn DoneReason::MaxTurns;
                }
                model_calls += 1;

                // AwaitingResponse + Parsing
                let reply = {
                    let request = self.agent_request(conversation, &trace_id);
                    let span = info_span!(
                        parent: &turn_span,
                        "model_call",
                        trace_id = %trace_id,
                        iteration = model_calls,
                        model = %request.model,
                        otel.name = "model_call"
                    );
                    let started = Instant::now();
                    let mut stream = self
                        .backend
                        .generate(request)
                        .instrument(span)
                        .await
                        .map_err(|e| turn_failed(&trace_id, e))?;

                    let mut parser = BlockParser::new(self.parser_options());
                    let mut text = String::new();
                    let mut segments = Vec::new();
                    let mut cancelled = false;
                    loop {
                        let step = tokio::select! {
                            biased;
                            _ = cancel.cancelled() => ModelStep::Cancelled,
                            item = stream.next() => ModelStep::Item(item),
                        };
                        match step {
                            ModelStep::Cancelled => {
                                cancelled = true;
                                break;
                            }
                            ModelStep::Item(None) => break,
                            ModelStep::Item(Some(Err(e))) => Err(turn_failed(&trace_id, e))?,
                            ModelStep::Item(Some(Ok(ModelSegment::Text(piece)))) => {
                                text.push_str(&piece);
                                segments.extend(parser.push(&piece));
                                yield TurnEvent::AssistantDelta(piece);
                            }
                            ModelStep::Item(Some(Ok(ModelSegment::ToolCall(call)))) => {
                                segments.push(parser.push_tool_call(&call));
                            }
                        }
                    }
                    segments.extend(parser.finish());

                    let elapsed = started.elapsed();
                    MODEL_CALL_DURATION
                        .with_label_values(&[&self.config.model.agent_model])
                        .observe(elapsed.as_secs_f64());
                    info!(
                        parent: &turn_span,
                        trace_id = %trace_id,
                        iteration = model_calls,
                        duration_ms = elapsed.as_millis() as u64,
                        "Model call completed"
                    );

                    if !cancelled {
                        self.recover_text_tool_calls(&text, &mut segments);
                    }
                    Reply { text, segments, cancelled }
                };

                conversation.push_assistant(assistant_entry(&reply));
                if reply.cancelled {
                    break 'turn DoneReason::Cancelled;
                }

                let mut blocks = Vec::new();
                for segment in reply.segments {
                    match segment {
                        Segment::Code(block) => blocks.push(block),
                        Segment::Malformed(issue) => {
                            warn!(parent: &turn_span, trace_id = %trace_id, issue = %issue, "Skipping malformed block");
                            conversation.push_execution(format!("Note: {issue}."))?;
                            yield TurnEvent::ParseIssue(issue);
                        }
                        Segment::Commentary(_) => {}
                    }
                }

                if blocks.is_empty() {
                    break 'turn DoneReason::NoBlocks;
                }

                // (Gating → Executing)*
                for block in blocks {
                    if cancel.is_cancelled() {
                        debug!(parent: &turn_span, trace_id = %trace_id, ordinal = block.ordinal, "Skipping block after cancel");
                        break 'turn DoneReason::Cancelled;
                    }
                    yield TurnEvent::Block(block.clone());

                    let decision = self.gate.evaluate(&block);
                    SAFETY_VERDICTS
                        .with_label_values(&[decision.mode.as_str(), decision.verdict.as_str()])
                        .inc();
                    yield TurnEvent::Safety {
                        ordinal: block.ordinal,
                        decision: decision.clone(),
                    };

                    let started = Instant::now();
                    let mut output = self.governor.collector();
                    let status = match self.clear_block(&conversation.id, &block, &decision, &cancel).await {
                        Some(skipped) => skipped,
                        None => {
                            let span = info_span!(
                                parent: &turn_span,
                                "session_start",
                                trace_id = %trace_id,
                                language = %block.language,
                                otel.name = "session_start"
                            );
                            match self.registry.acquire(&conversation.id, &block.language).instrument(span).await {
                                Ok(mut lease) => {
                                    info!(
                                        parent: &turn_span,
                                        trace_id = %trace_id,
                                        ordinal = block.ordinal,
                                        language = %block.language,
                                        code_len = block.source.len(),
                                        "Executing block"
                                    );
                                    let mut finished = None;
                                    let events = lease.execute(&block.source, limits, cancel.clone());
                                    pin_mut!(events);
                                    while let Some(event) = events.next().await {
                                        match event {
                                            ExecEvent::Output(segment) => {
                                                output.push(segment.clone());
                                                yield TurnEvent::Output {
                                                    ordinal: block.ordinal,
                                                    segment,
                                                };
                                            }
                                            ExecEvent::Finished(outcome) => finished = Some(outcome.status),
                                        }
                                    }
                                    finished.unwrap_or_else(|| {
                                        ExecutionStatus::error(ExecErrorKind::Execution, "execution ended without a status")
                                    })
                                }
                                Err(err @ RuntimeError::StartFailed { .. }) => {
                                    let status = ExecutionStatus::error(ExecErrorKind::RuntimeStart, err.to_string());
                                    let result = self.finish_block(&block, self.governor.collector(), status, started.elapsed());
                                    executed += 1;
                                    conversation.push_execution(self.feedback(&result))?;
                                    yield TurnEvent::Result(result);
                                    Err(turn_failed(&trace_id, AgentError::RuntimeStart(err)))?
                                }
                                Err(err @ (RuntimeError::UnsupportedLanguage(_) | RuntimeError::MarkedUnsupported(_))) => {
                                    ExecutionStatus::error(ExecErrorKind::UnsupportedLanguage, err.to_string())
                                }
                                Err(err) => ExecutionStatus::error(ExecErrorKind::RuntimeStart, err.to_string()),
                            }
                        }
                    };

                    let result = self.finish_block(&block, output, status, started.elapsed());
                    executed += 1;
                    conversation.push_execution(self.feedback(&result))?;
                    let failed = matches!(
                        result.status,
                        ExecutionStatus::Error { .. } | ExecutionStatus::TimedOut
                    );
                    yield TurnEvent::Result(result);

                    if failed && self.config.agent.halt_on_error {
                        break 'turn DoneReason::HaltOnError;
                    }
                }

                if cancel.is_cancelled() {
                    break 'turn DoneReason::Cancelled;
                }
                if self.has_loop_breaker(&reply.text) {
                    break 'turn DoneReason::LoopBreaker;
                }
            };

            TURNS_TOTAL.with_label_values(&[reason.as_str()]).inc();
            info!(
                parent: &turn_span,
                trace_id = %trace_id,
                reason = reason.as_str(),
                turns = model_calls,
                blocks = executed,
                "Agent turn completed"
            );
            yield TurnEvent::Done(TurnSummary {
                reason,
                turns: model_calls,
                blocks: executed,
                trace_id,
            });
        }
    }

    fn agent_request(&self, conversation: &Conversation, trace_id: &str) -> GenerateRequest {
        let model = &self.config.model;
        GenerateRequest {
            model: model.agent_model.clone(),
            messages: conversation.to_window_messages(&self.system_prompt, &self.config.agent),
            tools: model.native_tool_calls.then(|| vec![execute_tool()]),
            temperature: model.temperature,
            trace_id: Some(trace_id.to_string()),
        }
    }

    /// Models without native tool calling sometimes write the call as JSON
    fn recover_text_tool_calls(&self, text: &str, segments: &mut Vec<Segment>) {
        if !self.config.model.native_tool_calls {
            return;
        }
        let has_blocks = segments
            .iter()
            .any(|s| matches!(s, Segment::Code(_) | Segment::Malformed(_)));
        if has_blocks {
            return;
        }

        let mut parser = BlockParser::new(self.parser_options());
        for call in parse_tool_calls_from_text(text)
            .iter()
            .filter(|c| EXECUTE_TOOL_NAMES.contains(&c.function.name.as_str()))
        {
            debug!(tool = %call.function.name, "Recovered tool call from reply text");
            segments.push(parser.push_tool_call(call));
        }
    }

    /// `None` when the block may run, otherwise the status it ends with
    async fn clear_block(
        &self,
        conversation: &str,
        block: &CodeBlock,
        decision: &SafetyDecision,
        cancel: &CancellationToken,
    ) -> Option<ExecutionStatus> {
        match decision.verdict {
            Verdict::Allow => None,
            Verdict::Deny => Some(ExecutionStatus::Denied {
                reason: decision.reason.clone(),
            }),
            Verdict::NeedsConfirmation => {
                let request = ConfirmationRequest {
                    conversation: conversation.to_string(),
                    block: block.clone(),
                    reason: decision.reason.clone(),
                };
                let timeout = self.config.safety.confirmation_timeout();
                let outcome = tokio::select! {
                    outcome = confirm_with_timeout(self.confirmer.as_ref(), &request, timeout) => outcome,
                    _ = cancel.cancelled() => return Some(ExecutionStatus::Interrupted),
                };
                match outcome {
                    ConfirmationOutcome::Approved => None,
                    ConfirmationOutcome::Denied(reason) => {
                        info!(ordinal = block.ordinal, reason = %reason, "Block denied");
                        Some(ExecutionStatus::Denied { reason })
                    }
                    ConfirmationOutcome::TimedOut => {
                        warn!(ordinal = block.ordinal, timeout_secs = timeout.as_secs(), "Confirmation timed out");
                        Some(ExecutionStatus::ConfirmationTimedOut)
                    }
                }
            }
        }
    }

    fn finish_block(
        &self,
        block: &CodeBlock,
        output: OutputCollector,
        status: ExecutionStatus,
        duration: Duration,
    ) -> ExecutionResult {
        let language = block.language.name().to_string();
        let collected = output.finish();
        let governed = collected.governed;
        if governed.truncated {
            OUTPUT_TRUNCATIONS.with_label_values(&[&language]).inc();
        }
        BLOCKS_TOTAL
            .with_label_values(&[&language, status.label()])
            .inc();
        EXECUTION_DURATION.observe(duration.as_secs_f64());

        ExecutionResult {
            block: BlockRef {
                ordinal: block.ordinal,
                language: block.language.clone(),
            },
            segments: collected.segments,
            status,
            output: governed.text,
            truncated: governed.truncated,
            duration_ms: duration.as_millis() as u64,
        }
    }

    /// Transcript text the model sees for a result
    fn feedback(&self, result: &ExecutionResult) -> String {
        let mut content = result.output.clone();
        if let Some(note) = status_note(&result.status, self.registry.config().execution_timeout_secs) {
            if !content.is_empty() {
                content.push('\n');
            }
            content.push_str(&note);
        }

        let agent = &self.config.agent;
        if content.trim().is_empty() {
            agent.empty_code_output_template.clone()
        } else {
            agent.code_output_template.replace("{content}", &content)
        }
    }

    fn has_loop_breaker(&self, text: &str) -> bool {
        self.config
            .agent
            .loop_breakers
            .iter()
            .any(|b| !b.is_empty() && text.contains(b.as_str()))
    }
}

fn status_note(status: &ExecutionStatus, timeout_secs: u32) -> Option<String> {
    match status {
        ExecutionStatus::Success => None,
        ExecutionStatus::Error { message, .. } => Some(format!("Error: {message}")),
        ExecutionStatus::Interrupted => Some("Execution was interrupted by the user.".to_string()),
        ExecutionStatus::TimedOut => Some(format!(
            "Execution timed out after {timeout_secs} seconds and was stopped."
        )),
        ExecutionStatus::Denied { reason } => {
            Some(format!("The user did not allow this code to run ({reason})."))
        }
        ExecutionStatus::ConfirmationTimedOut => {
            Some("The code was not confirmed in time and did not run.".to_string())
        }
    }
}

/// Reply text plus any tool-call blocks, rendered as fences
fn assistant_entry(reply: &Reply) -> String {
    let mut content = reply.text.clone();
    for segment in &reply.segments {
        if let Segment::Code(block) = segment {
            if block.origin == BlockOrigin::ToolCall {
                if !content.is_empty() && !content.ends_with('\n') {
                    content.push('\n');
                }
                content.push_str(&format!("```{}\n{}\n```\n", block.language.name(), block.source));
            }
        }
    }
    content
}

fn turn_failed<E: Into<AgentError>>(trace_id: &str, error: E) -> AgentError {
    let error = error.into();
    TURNS_TOTAL.with_label_values(&["error"]).inc();
    warn!(trace_id = %trace_id, error = %error, "Agent turn failed");
    error
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DenyPattern, SafeMode};
    use crate::model::{ScriptedBackend, ScriptedReply, ToolCall};
    use crate::safety::{AutoApprove, AutoDeny};

    fn config(mode: SafeMode) -> EngineConfig {
        let mut config = EngineConfig::default();
        config.safety.mode = mode;
        config.runtime.start_attempts = 1;
        config.runtime.start_retry_delay_ms = 0;
        config
    }

    fn controller(
        config: EngineConfig,
        backend: ScriptedBackend,
        confirmer: Arc<dyn Confirmer>,
    ) -> AgentController {
        let registry = Arc::new(RuntimeRegistry::new(config.runtime.clone()));
        AgentController::new(Arc::new(config), Arc::new(backend), registry, confirmer).unwrap()
    }

    async fn collect(
        controller: &AgentController,
        conversation: &mut Conversation,
        message: &str,
    ) -> Vec<Result<TurnEvent, AgentError>> {
        let stream = controller.run_turn(conversation, message, CancellationToken::new());
        pin_mut!(stream);
        let mut events = Vec::new();
        while let Some(event) = stream.next().await {
            events.push(event);
        }
        events
    }

    fn summary(events: &[Result<TurnEvent, AgentError>]) -> Option<&TurnSummary> {
        events.iter().find_map(|e| match e {
            Ok(TurnEvent::Done(summary)) => Some(summary),
            _ => None,
        })
    }

    #[tokio::test]
    async fn test_zero_blocks_is_done_after_one_call() {
        let backend = ScriptedBackend::with_texts(["Nothing to run here."]);
        let controller = controller(config(SafeMode::Off), backend.clone(), Arc::new(AutoApprove));
        let mut conversation = Conversation::new("c1");

        let events = collect(&controller, &mut conversation, "explain").await;
        let summary = summary(&events).unwrap();
        assert_eq!(summary.reason, DoneReason::NoBlocks);
        assert_eq!(summary.turns, 1);
        assert_eq!(summary.blocks, 0);
        assert!(!events.iter().any(|e| matches!(e, Ok(TurnEvent::Result(_)))));
        assert_eq!(backend.requests().len(), 1);
        assert_eq!(conversation.len(), 2);
    }

    #[tokio::test]
    async fn test_denied_block_does_not_end_turn() {
        let backend = ScriptedBackend::with_texts([
            "```python\nprint('hi')\n```",
            "Okay, I will not run it.",
        ]);
        let controller = controller(config(SafeMode::Ask), backend, Arc::new(AutoDeny));
        let mut conversation = Conversation::new("c1");

        let events = collect(&controller, &mut conversation, "say hi").await;
        let result = events
            .iter()
            .find_map(|e| match e {
                Ok(TurnEvent::Result(result)) => Some(result),
                _ => None,
            })
            .unwrap();
        assert!(matches!(result.status, ExecutionStatus::Denied { .. }));
        assert_eq!(summary(&events).unwrap().reason, DoneReason::NoBlocks);
        assert_eq!(controller.registry().session_count("c1").await, 0);
    }

    #[tokio::test]
    async fn test_unsupported_language_is_block_level() {
        let backend = ScriptedBackend::with_texts([
            "```haskell\nmain = print 1\n```",
            "Haskell is not available. The task is impossible.",
        ]);
        let controller = controller(config(SafeMode::Off), backend, Arc::new(AutoApprove));
        let mut conversation = Conversation::new("c1");

        let events = collect(&controller, &mut conversation, "run haskell").await;
        assert!(events.iter().all(|e| e.is_ok()));
        let result = events
            .iter()
            .find_map(|e| match e {
                Ok(TurnEvent::Result(result)) => Some(result),
                _ => None,
            })
            .unwrap();
        assert!(matches!(
            result.status,
            ExecutionStatus::Error { kind: ExecErrorKind::UnsupportedLanguage, .. }
        ));
        let execution = &conversation.entries()[2].content;
        assert!(execution.contains("haskell"));
    }

    #[tokio::test]
    async fn test_halt_on_error_stops_after_failing_block() {
        let reply = "```haskell\nmain = pure ()\n```\n```cobol\nDISPLAY 'HI'.\n```";
        let results = |events: &[Result<TurnEvent, AgentError>]| {
            events
                .iter()
                .filter(|e| matches!(e, Ok(TurnEvent::Result(_))))
                .count()
        };

        let mut halting = config(SafeMode::Off);
        halting.agent.halt_on_error = true;
        let backend = ScriptedBackend::with_texts([reply, "The task is done."]);
        let controller = controller(halting, backend.clone(), Arc::new(AutoApprove));
        let mut conversation = Conversation::new("c1");

        let events = collect(&controller, &mut conversation, "run both").await;
        assert_eq!(summary(&events).unwrap().reason, DoneReason::HaltOnError);
        assert_eq!(results(&events), 1);
        assert_eq!(backend.requests().len(), 1);

        let backend = ScriptedBackend::with_texts([reply, "The task is done."]);
        let controller = self::controller(config(SafeMode::Off), backend.clone(), Arc::new(AutoApprove));
        let mut conversation = Conversation::new("c2");

        let events = collect(&controller, &mut conversation, "run both").await;
        assert_ne!(summary(&events).unwrap().reason, DoneReason::HaltOnError);
        assert_eq!(results(&events), 2);
        assert_eq!(backend.requests().len(), 2);
    }

    #[tokio::test]
    async fn test_hard_denied_block_never_runs() {
        let mut config = config(SafeMode::Auto);
        config
            .safety
            .hard_deny_patterns
            .push(DenyPattern::new(r"\bshutdown\b", "host shutdown"));
        let backend = ScriptedBackend::with_texts([
            "```shell\nshutdown -h now\n```",
            "Understood, I will not do that.",
        ]);
        let controller = controller(config, backend, Arc::new(AutoApprove));
        let mut conversation = Conversation::new("c1");

        let events = collect(&controller, &mut conversation, "turn it off").await;
        let result = events
            .iter()
            .find_map(|e| match e {
                Ok(TurnEvent::Result(result)) => Some(result),
                _ => None,
            })
            .unwrap();
        match &result.status {
            ExecutionStatus::Denied { reason } => assert_eq!(reason, "refused: host shutdown"),
            other => panic!("expected a refusal, got {:?}", other),
        }
        assert!(result.segments.is_empty());
        assert_eq!(controller.registry().session_count("c1").await, 0);
    }

    #[tokio::test]
    async fn test_max_turns_warns() {
        let mut config = config(SafeMode::Off);
        config.agent.max_turns = 2;
        let backend = ScriptedBackend::new([])
            .repeat_last(ScriptedReply::text("```haskell\nmain = pure ()\n```"));
        let controller = controller(config, backend.clone(), Arc::new(AutoApprove));
        let mut conversation = Conversation::new("c1");

        let events = collect(&controller, &mut conversation, "loop").await;
        assert!(events.iter().any(|e| matches!(
            e,
            Ok(TurnEvent::Warning(TurnWarning::MaxTurnsReached { limit: 2 }))
        )));
        assert_eq!(summary(&events).unwrap().reason, DoneReason::MaxTurns);
        assert_eq!(backend.requests().len(), 2);
    }

    #[tokio::test]
    async fn test_model_failure_is_terminal() {
        let backend = ScriptedBackend::new([ScriptedReply::Fail("connection refused".to_string())]);
        let controller = controller(config(SafeMode::Off), backend, Arc::new(AutoApprove));
        let mut conversation = Conversation::new("c1");

        let events = collect(&controller, &mut conversation, "run ls").await;
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], Err(AgentError::Model(_))));
    }

    #[tokio::test]
    async fn test_start_failure_is_terminal() {
        let mut config = config(SafeMode::Off);
        config.runtime.commands.javascript.program = "/nonexistent/node-binary".to_string();
        let backend = ScriptedBackend::with_texts(["```js\nconsole.log(1)\n```"]);
        let controller = controller(config, backend, Arc::new(AutoApprove));
        let mut conversation = Conversation::new("c1");

        let events = collect(&controller, &mut conversation, "run js").await;
        assert!(matches!(events.last(), Some(Err(AgentError::RuntimeStart(_)))));
        assert!(matches!(
            events.iter().rev().nth(1),
            Some(Ok(TurnEvent::Result(ExecutionResult {
                status: ExecutionStatus::Error { kind: ExecErrorKind::RuntimeStart, .. },
                ..
            })))
        ));
    }

    #[tokio::test]
    async fn test_text_tool_call_recovered() {
        let mut config = config(SafeMode::Off);
        config.model.native_tool_calls = true;
        let backend = ScriptedBackend::with_texts([
            r#"{"name": "execute", "arguments": {"language": "haskell", "code": "main = pure ()"}}"#,
            "The task is done.",
        ]);
        let controller = controller(config, backend, Arc::new(AutoApprove));
        let mut conversation = Conversation::new("c1");

        let events = collect(&controller, &mut conversation, "run it").await;
        let block = events
            .iter()
            .find_map(|e| match e {
                Ok(TurnEvent::Block(block)) => Some(block),
                _ => None,
            })
            .unwrap();
        assert_eq!(block.origin, BlockOrigin::ToolCall);
        assert!(conversation.entries()[1].content.contains("```haskell\nmain = pure ()\n```"));
    }

    #[tokio::test]
    async fn test_native_tool_call_block() {
        let backend = ScriptedBackend::new([
            ScriptedReply::tool_call(ToolCall::new(
                "run_code",
                serde_json::json!({"language": "cobol", "code": "DISPLAY 'HI'."}),
            )),
            ScriptedReply::text("Done. The task is done."),
        ]);
        let controller = controller(config(SafeMode::Off), backend, Arc::new(AutoApprove));
        let mut conversation = Conversation::new("c1");

        let events = collect(&controller, &mut conversation, "hi").await;
        assert_eq!(summary(&events).unwrap().blocks, 1);
    }

    #[test]
    fn test_status_notes() {
        assert_eq!(status_note(&ExecutionStatus::Success, 30), None);
        assert_eq!(
            status_note(&ExecutionStatus::TimedOut, 5).unwrap(),
            "Execution timed out after 5 seconds and was stopped."
        );
    }
}
