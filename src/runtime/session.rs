//! Execution session
//!
//! A session owns one interpreter process for a (conversation, language)
//! pair. Variables, imports and the working directory survive between
//! blocks because every block runs in the same process.
//!
//! ```text
//! Starting ──ready marker──► Ready ◄──marker──┐
//!                          │              │
//!                               └──execute──► Running
//!                                              │
//!             exit before marker / kill ───────┴──► Terminated
//! ```

use std::time::{Duration, Instant};

use async_stream::stream;
use futures_util::Stream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::RuntimeConfig;

use super::driver::{frame, parse_image, split_marker, LaunchSpec, READY_MARKER};
use super::language::Language;
use super::process::{Pipe, ProcessLine, RuntimeProcess};
use super::result::{ExecErrorKind, ExecutionStatus, OutputSegment};

/// Number of trailing stderr lines quoted in error messages
const STDERR_TAIL_LINES: usize = 5;

/// Identity of a session
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub conversation: String,
    pub language: Language,
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.conversation, self.language)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Starting,
    Ready,
    Running,
    Terminated,
}

/// Time limits applied to a single block
#[derive(Debug, Clone, Copy)]
pub struct ExecLimits {
    pub timeout: Duration,
    pub interrupt_grace: Duration,
    pub terminate_on_timeout: bool,
}

impl From<&RuntimeConfig> for ExecLimits {
    fn from(config: &RuntimeConfig) -> Self {
        Self {
            timeout: config.execution_timeout(),
            interrupt_grace: config.interrupt_grace(),
            terminate_on_timeout: config.terminate_on_timeout,
        }
    }
}

/// Item of an execution stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecEvent {
    Output(OutputSegment),
    Finished(ExecOutcome),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutcome {
    pub status: ExecutionStatus,
    pub duration: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InterruptReason {
    Timeout,
    Cancel,
}

enum Step {
    Line(Option<ProcessLine>),
    Deadline,
    Cancelled,
}

/// How the read loop ended
enum Completion {
    /// Both markers seen; exit status from the stdout marker
    Marker(Option<i32>),
    /// Pipes closed before both markers arrived
    Exited,
    /// The interrupt grace period ran out
    Unresponsive,
    /// Writing the block failed
    WriteFailed(std::io::Error),
}

/// One live interpreter process
#[derive(Debug)]
pub struct Session {
    key: SessionKey,
    process: Option<RuntimeProcess>,
    state: SessionState,
    started_at: Instant,
    last_activity: Instant,
    executions: u64,
}

impl Session {
    /// Spawn the runtime described by `spec` and wait for its driver
    ///
    /// A runtime that exits or stays silent for `ready_timeout` is killed
    /// and reported as a start failure.
    pub async fn start(key: SessionKey, spec: &LaunchSpec, ready_timeout: Duration) -> std::io::Result<Self> {
        debug!(session = %key, program = %spec.program, "Starting session");
        let mut process = RuntimeProcess::spawn(spec).await?;
        if let Err(e) = process.wait_ready(READY_MARKER, ready_timeout).await {
            process.kill().await;
            return Err(e);
        }
        let now = Instant::now();
        info!(session = %key, pid = ?process.pid(), "Session ready");
        Ok(Self {
            key,
            process: Some(process),
            state: SessionState::Ready,
            started_at: now,
            last_activity: now,
            executions: 0,
        })
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    /// Blocks executed so far
    pub fn executions(&self) -> u64 {
        self.executions
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().and_then(RuntimeProcess::pid)
    }

    /// Whether the session can accept another block
    pub fn is_alive(&mut self) -> bool {
        // Still `Running` while nobody holds the lease: the block was abandoned
        if matches!(self.state, SessionState::Terminated | SessionState::Running) {
            return false;
        }
        match self.process.as_mut() {
            Some(process) => !process.has_exited(),
            None => false,
        }
    }

    /// Idle or lifetime limit exceeded
    pub fn is_expired(&self, idle_timeout: Duration, max_lifetime: Duration) -> bool {
        let now = Instant::now();
        now.duration_since(self.last_activity) > idle_timeout
            || now.duration_since(self.started_at) > max_lifetime
    }

    /// Send SIGINT to the runtime's process group
    pub fn interrupt(&self) -> std::io::Result<()> {
        match &self.process {
            Some(process) => process.interrupt(),
            None => Ok(()),
        }
    }

    /// Kill the runtime; idempotent
    pub async fn terminate(&mut self) {
        if let Some(mut process) = self.process.take() {
            process.kill().await;
            info!(session = %self.key, executions = self.executions, "Session terminated");
        }
        self.state = SessionState::Terminated;
    }

    /// Run one block, streaming its output
    ///
    /// The stream always ends with exactly one `ExecEvent::Finished`.
    /// Cancelling `cancel` interrupts the block and keeps the session; a
    /// timeout interrupts it and, with `terminate_on_timeout`, kills it.
    pub fn execute<'a>(
        &'a mut self,
        source: &'a str,
        limits: ExecLimits,
        cancel: CancellationToken,
    ) -> impl Stream<Item = ExecEvent> + 'a {
        stream! {
            let started = Instant::now();
            self.executions += 1;
            self.last_activity = started;

            let language = self.key.language.clone();
            let key = self.key.clone();
            let process = match self.process.as_mut() {
                Some(process) if self.state != SessionState::Terminated => process,
                _ => {
                    yield ExecEvent::Finished(ExecOutcome {
                        status: ExecutionStatus::error(ExecErrorKind::Execution, "session is terminated"),
                        duration: started.elapsed(),
                    });
                    return;
                }
            };
            self.state = SessionState::Running;

            let mut interrupted: Option<InterruptReason> = None;
            let mut stdout_done = false;
            let mut stderr_done = false;
            let mut exit_status: Option<i32> = None;
            let mut stderr_tail: Vec<String> = Vec::new();

            let completion = match process.write(&frame(&language, source)).await {
                Err(e) => Completion::WriteFailed(e),
                Ok(()) => {
                    let deadline = tokio::time::sleep(limits.timeout);
                    tokio::pin!(deadline);

                    loop {
                        let step = tokio::select! {
                            line = process.next_line() => Step::Line(line),
                            _ = &mut deadline => Step::Deadline,
                            _ = cancel.cancelled(), if interrupted.is_none() => Step::Cancelled,
                        };

                        match step {
                            Step::Line(Some(ProcessLine::Line(Pipe::Stdout, line))) => {
                                if let Some((before, status)) = split_marker(&line) {
                                    if !before.is_empty() {
                                        yield ExecEvent::Output(OutputSegment::Text(before.to_string()));
                                    }
                                    stdout_done = true;
                                    exit_status = status;
                                    if stderr_done {
                                        break Completion::Marker(exit_status);
                                    }
                                } else if let Some((mime, data)) = parse_image(&line) {
                                    yield ExecEvent::Output(OutputSegment::Image {
                                        mime: mime.to_string(),
                                        data_base64: data.to_string(),
                                    });
                                } else {
                                    yield ExecEvent::Output(OutputSegment::Text(line));
                                }
                            }
                            Step::Line(Some(ProcessLine::Line(Pipe::Stderr, line))) => {
                                if let Some((before, _)) = split_marker(&line) {
                                    if !before.is_empty() {
                                        yield ExecEvent::Output(OutputSegment::Error(before.to_string()));
                                    }
                                    stderr_done = true;
                                    if stdout_done {
                                        break Completion::Marker(exit_status);
                                    }
                                } else {
                                    push_tail(&mut stderr_tail, &line);
                                    yield ExecEvent::Output(OutputSegment::Error(line));
                                }
                            }
                            Step::Line(Some(ProcessLine::Closed(pipe))) => {
                                debug!(session = %key, ?pipe, "Pipe closed");
                            }
                            Step::Line(None) => break Completion::Exited,
                            Step::Deadline => {
                                if interrupted.is_some() {
                                    break Completion::Unresponsive;
                                }
                                warn!(session = %key, timeout_secs = limits.timeout.as_secs(), "Block timed out, interrupting");
                                send_interrupt(process, &key);
                                interrupted = Some(InterruptReason::Timeout);
                                deadline.as_mut().reset(tokio::time::Instant::now() + limits.interrupt_grace);
                            }
                            Step::Cancelled => {
                                info!(session = %key, "Block cancelled, interrupting");
                                send_interrupt(process, &key);
                                interrupted = Some(InterruptReason::Cancel);
                                deadline.as_mut().reset(tokio::time::Instant::now() + limits.interrupt_grace);
                            }
                        }
                    }
                }
            };

            let (status, keep) = match (completion, interrupted) {
                (Completion::Marker(_), Some(InterruptReason::Timeout)) => {
                    (ExecutionStatus::TimedOut, !limits.terminate_on_timeout)
                }
                (Completion::Marker(_), Some(InterruptReason::Cancel)) => (ExecutionStatus::Interrupted, true),
                (Completion::Marker(status), None) => match status {
                    Some(0) | None => (ExecutionStatus::Success, true),
                    Some(code) => (
                        ExecutionStatus::error(ExecErrorKind::Execution, failure_message(code, &stderr_tail)),
                        true,
                    ),
                },
                (Completion::Unresponsive, reason) | (Completion::Exited, reason @ Some(_)) => {
                    let status = match reason {
                        Some(InterruptReason::Cancel) => ExecutionStatus::Interrupted,
                        _ => ExecutionStatus::TimedOut,
                    };
                    (status, false)
                }
                (Completion::Exited, None) => {
                    let mut message = "runtime exited before the block completed".to_string();
                    if !stderr_tail.is_empty() {
                        message.push_str(": ");
                        message.push_str(&stderr_tail.join("\n"));
                    }
                    (ExecutionStatus::error(ExecErrorKind::Execution, message), false)
                }
                (Completion::WriteFailed(e), _) => (
                    ExecutionStatus::error(
                        ExecErrorKind::Execution,
                        format!("failed to send block to runtime: {e}"),
                    ),
                    false,
                ),
            };

            if keep {
                self.state = SessionState::Ready;
            } else {
                self.terminate().await;
            }
            self.last_activity = Instant::now();

            debug!(session = %key, status = status.label(), kept = keep, "Block finished");
            yield ExecEvent::Finished(ExecOutcome {
                status,
                duration: started.elapsed(),
            });
        }
    }
}

fn send_interrupt(process: &RuntimeProcess, key: &SessionKey) {
    if let Err(e) = process.interrupt() {
        warn!(session = %key, error = %e, "Failed to interrupt runtime");
    }
}

fn push_tail(tail: &mut Vec<String>, line: &str) {
    if tail.len() == STDERR_TAIL_LINES {
        tail.remove(0);
    }
    tail.push(line.to_string());
}

fn failure_message(code: i32, stderr_tail: &[String]) -> String {
    match stderr_tail.iter().rev().find(|l| !l.trim().is_empty()) {
        Some(last) => format!("exit status {code}: {}", last.trim()),
        None => format!("exit status {code}"),
    }
}
