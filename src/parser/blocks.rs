//! Incremental fenced-block parser
//!
//! Assistant replies arrive as a stream of text fragments. The parser keeps
//! a two-state machine (prose / inside a fence), consumes whole lines, and
//! emits commentary as soon as a partial line can no longer become a fence.
//!
//! ```text
//!   Prose ──"```lang"──► Fence ──"```"──► Prose
//!     ▲                    │
//!     └── commentary       └── source lines (nested openers are literal)
//! ```

use serde::{Deserialize, Serialize};

use crate::model::ToolCall;
use crate::runtime::Language;

use super::tool_calls::code_from_tool_call;

/// Where a block came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockOrigin {
    Fence,
    ToolCall,
}

/// An executable unit extracted from an assistant reply
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeBlock {
    pub language: Language,
    pub source: String,
    /// Position among the blocks of one reply, starting at 0
    pub ordinal: usize,
    pub origin: BlockOrigin,
}

/// A structural problem in the reply
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "issue", rename_all = "snake_case")]
pub enum ParseIssue {
    /// The reply ended inside a fence
    UnterminatedFence { language: Language, partial_source: String },
    /// A fence with nothing but whitespace inside
    EmptyBlock { language: Language },
    /// A tool call that does not describe code to run
    InvalidToolCall { name: String, reason: String },
}

impl std::fmt::Display for ParseIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParseIssue::UnterminatedFence { language, .. } => {
                write!(f, "the {language} code block was not closed and was not executed")
            }
            ParseIssue::EmptyBlock { language } => {
                write!(f, "the {language} code block was empty and was not executed")
            }
            ParseIssue::InvalidToolCall { name, reason } => {
                write!(f, "tool call '{name}' was not executed: {reason}")
            }
        }
    }
}

/// One piece of a parsed reply, in order of appearance
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Commentary(String),
    Code(CodeBlock),
    Malformed(ParseIssue),
}

#[derive(Debug, Clone, Default)]
pub struct ParserOptions {
    /// Language for fences without a tag; `None` marks them unsupported
    pub default_language: Option<String>,
    /// Emit a fence left open at the end of the reply as a block
    pub flush_incomplete: bool,
}

#[derive(Debug)]
enum State {
    Prose,
    Fence {
        ticks: usize,
        language: Language,
        lines: Vec<String>,
    },
}

#[derive(Debug)]
pub struct BlockParser {
    options: ParserOptions,
    state: State,
    /// Text after the last newline
    pending: String,
    /// Part of the current prose line was already emitted
    mid_line: bool,
    next_ordinal: usize,
}

impl BlockParser {
    pub fn new(options: ParserOptions) -> Self {
        Self {
            options,
            state: State::Prose,
            pending: String::new(),
            mid_line: false,
            next_ordinal: 0,
        }
    }

    /// Number of blocks emitted so far
    pub fn block_count(&self) -> usize {
        self.next_ordinal
    }

    /// Feed a fragment of the reply
    pub fn push(&mut self, chunk: &str) -> Vec<Segment> {
        let mut out = Vec::new();
        self.pending.push_str(chunk);

        while let Some(pos) = self.pending.find('\n') {
            let mut line: String = self.pending.drain(..=pos).collect();
            line.pop();
            if line.ends_with('\r') {
                line.pop();
            }
            self.process_line(line, true, &mut out);
        }

        // Stream prose that can no longer turn into a fence line
        if matches!(self.state, State::Prose) && !self.pending.is_empty() {
            if self.mid_line || !could_be_fence(&self.pending) {
                let text = std::mem::take(&mut self.pending);
                push_commentary(&mut out, text);
                self.mid_line = true;
            }
        }

        out
    }

    /// Turn a native tool call into a block, or an issue
    pub fn push_tool_call(&mut self, call: &ToolCall) -> Segment {
        match code_from_tool_call(call) {
            Ok((language, source)) => Segment::Code(self.next_block(language, source, BlockOrigin::ToolCall)),
            Err(reason) => Segment::Malformed(ParseIssue::InvalidToolCall {
                name: call.function.name.clone(),
                reason,
            }),
        }
    }

    /// Flush the remainder at the end of the reply
    pub fn finish(mut self) -> Vec<Segment> {
        let mut out = Vec::new();
        if !self.pending.is_empty() {
            let mut line = std::mem::take(&mut self.pending);
            if line.ends_with('\r') {
                line.pop();
            }
            self.process_line(line, false, &mut out);
        }

        if let State::Fence { language, lines, .. } = std::mem::replace(&mut self.state, State::Prose) {
            let source = lines.join("\n");
            if self.options.flush_incomplete {
                out.push(self.close_block(language, source));
            } else {
                out.push(Segment::Malformed(ParseIssue::UnterminatedFence {
                    language,
                    partial_source: source,
                }));
            }
        }
        out
    }

    fn process_line(&mut self, line: String, newline: bool, out: &mut Vec<Segment>) {
        match &mut self.state {
            State::Prose => {
                let opener = if self.mid_line { None } else { fence_open(&line) };
                match opener {
                    Some((ticks, tag)) => {
                        let language = self.resolve_language(&tag);
                        self.state = State::Fence {
                            ticks,
                            language,
                            lines: Vec::new(),
                        };
                    }
                    None => {
                        let mut text = line;
                        if newline {
                            text.push('\n');
                        }
                        push_commentary(out, text);
                    }
                }
                self.mid_line = false;
            }
            State::Fence { ticks, lines, .. } => {
                if is_fence_close(&line, *ticks) {
                    if let State::Fence { language, lines, .. } =
                        std::mem::replace(&mut self.state, State::Prose)
                    {
                        let segment = self.close_block(language, lines.join("\n"));
                        out.push(segment);
                    }
                } else {
                    lines.push(line);
                }
            }
        }
    }

    fn close_block(&mut self, language: Language, source: String) -> Segment {
        if source.trim().is_empty() {
            Segment::Malformed(ParseIssue::EmptyBlock { language })
        } else {
            Segment::Code(self.next_block(language, source, BlockOrigin::Fence))
        }
    }

    fn next_block(&mut self, language: Language, source: String, origin: BlockOrigin) -> CodeBlock {
        let ordinal = self.next_ordinal;
        self.next_ordinal += 1;
        CodeBlock {
            language,
            source,
            ordinal,
            origin,
        }
    }

    fn resolve_language(&self, tag: &str) -> Language {
        if tag.is_empty() {
            match &self.options.default_language {
                Some(default) => Language::from_tag(default),
                None => Language::Unsupported(String::new()),
            }
        } else {
            Language::from_tag(tag)
        }
    }
}

/// Parse a complete reply in one go
pub fn parse_complete(text: &str, options: ParserOptions) -> Vec<Segment> {
    let mut parser = BlockParser::new(options);
    let mut segments = parser.push(text);
    segments.extend(parser.finish());
    segments
}

/// Only the code blocks of a segment list
pub fn code_blocks(segments: &[Segment]) -> Vec<&CodeBlock> {
    segments
        .iter()
        .filter_map(|s| match s {
            Segment::Code(block) => Some(block),
            _ => None,
        })
        .collect()
}

fn push_commentary(out: &mut Vec<Segment>, text: String) {
    if text.is_empty() {
        return;
    }
    if let Some(Segment::Commentary(last)) = out.last_mut() {
        last.push_str(&text);
    } else {
        out.push(Segment::Commentary(text));
    }
}

/// `(ticks, tag)` when `line` opens a fence
fn fence_open(line: &str) -> Option<(usize, String)> {
    let trimmed = line.trim_start();
    let ticks = trimmed.chars().take_while(|c| *c == '`').count();
    if ticks < 3 {
        return None;
    }
    let info = &trimmed[ticks..];
    // Backticks in the info string mean inline code, not a fence
    if info.contains('`') {
        return None;
    }
    let tag = info.split_whitespace().next().unwrap_or("").to_string();
    Some((ticks, tag))
}

fn is_fence_close(line: &str, ticks: usize) -> bool {
    let trimmed = line.trim();
    trimmed.len() >= ticks && trimmed.chars().all(|c| c == '`')
}

/// Whether an unfinished line could still become a fence opener
fn could_be_fence(partial: &str) -> bool {
    let trimmed = partial.trim_start();
    let ticks = trimmed.chars().take_while(|c| *c == '`').count();
    if trimmed.len() == ticks {
        // Only whitespace and backticks so far
        return true;
    }
    ticks >= 3
}
