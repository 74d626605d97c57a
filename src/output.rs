//! Output governor
//!
//! Bounds execution output before it enters the transcript. Lengths are
//! counted in characters, never bytes, so multi-byte text is never split.
//! Output over the budget `B` keeps its first `floor(B * head_ratio)`
//! characters and its last `B - head` characters around an elision marker.
//!
//! `OutputCollector` applies the same budget while a block is still
//! running, so neither the text nor the kept segments grow with the amount
//! of output.

use std::collections::VecDeque;

use crate::config::OutputConfig;
use crate::runtime::OutputSegment;

/// Text produced by `OutputGovernor::govern`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Governed {
    pub text: String,
    pub truncated: bool,
    /// Characters removed
    pub elided: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct OutputGovernor {
    budget: usize,
    head_ratio: f64,
}

impl OutputGovernor {
    pub fn new(budget: usize, head_ratio: f64) -> Self {
        Self {
            budget,
            head_ratio: head_ratio.clamp(0.0, 1.0),
        }
    }

    pub fn from_config(config: &OutputConfig) -> Self {
        Self::new(config.max_output_chars, config.head_ratio)
    }

    pub fn budget(&self) -> usize {
        self.budget
    }

    fn head_len(&self) -> usize {
        (self.budget as f64 * self.head_ratio).floor() as usize
    }

    /// Start collecting the output of one block under this budget
    pub fn collector(&self) -> OutputCollector {
        OutputCollector::new(*self)
    }

    pub fn govern(&self, text: &str) -> Governed {
        let total = text.chars().count();
        if total <= self.budget {
            return Governed {
                text: text.to_string(),
                truncated: false,
                elided: 0,
            };
        }

        let head_len = self.head_len();
        let tail_len = self.budget - head_len;
        let elided = total - self.budget;

        let head: String = text.chars().take(head_len).collect();
        let tail: String = text.chars().skip(total - tail_len).collect();

        Governed {
            text: format!("{head}{}{tail}", elision_marker(elided)),
            truncated: true,
            elided,
        }
    }
}

pub fn elision_marker(elided: usize) -> String {
    format!("\n\n... [{elided} characters elided] ...\n\n")
}

/// Segment standing in for the segments an `OutputCollector` dropped
pub fn dropped_segments_marker(dropped: usize) -> OutputSegment {
    OutputSegment::Text(format!("... [{dropped} lines elided] ..."))
}

/// Flatten output segments into the text shown to the model
pub fn render(segments: &[OutputSegment]) -> String {
    let mut out = String::new();
    for segment in segments {
        if !out.is_empty() {
            out.push('\n');
        }
        out.push_str(&render_segment(segment));
    }
    out
}

fn render_segment(segment: &OutputSegment) -> String {
    match segment {
        OutputSegment::Text(line) | OutputSegment::Error(line) => line.clone(),
        OutputSegment::Image { mime, data_base64 } => {
            format!("[image: {mime}, {} bytes base64]", data_base64.len())
        }
    }
}

/// What an `OutputCollector` kept of a block's output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Collected {
    /// Head and tail segments, with a marker where segments were dropped
    pub segments: Vec<OutputSegment>,
    /// Same text `OutputGovernor::govern` gives for the full output
    pub governed: Governed,
}

/// Streaming form of `OutputGovernor::govern` over output segments
///
/// Keeps the first `budget` and last `budget - head` characters of the
/// rendered text, and whole segments from the start and the end whose
/// rendered size fits the budget. Segments are only dropped once the
/// output is over budget; a single oversized line keeps its last `budget`
/// characters.
#[derive(Debug)]
pub struct OutputCollector {
    governor: OutputGovernor,
    tail_len: usize,
    /// Characters of the rendered text seen so far
    total: usize,
    prefix: String,
    prefix_len: usize,
    suffix: VecDeque<char>,
    head: Vec<OutputSegment>,
    head_chars: usize,
    tail: VecDeque<(OutputSegment, usize)>,
    tail_chars: usize,
    dropped: usize,
}

impl OutputCollector {
    fn new(governor: OutputGovernor) -> Self {
        Self {
            governor,
            tail_len: governor.budget - governor.head_len(),
            total: 0,
            prefix: String::new(),
            prefix_len: 0,
            suffix: VecDeque::new(),
            head: Vec::new(),
            head_chars: 0,
            tail: VecDeque::new(),
            tail_chars: 0,
            dropped: 0,
        }
    }

    pub fn push(&mut self, segment: OutputSegment) {
        let budget = self.governor.budget;
        let rendered = render_segment(&segment);
        // Same joining rule as `render`
        if self.total > 0 {
            self.push_text("\n");
        }
        self.push_text(&rendered);

        let size = rendered.chars().count() + 1;
        if self.tail.is_empty() && self.head_chars + size <= self.governor.head_len() {
            self.head_chars += size;
            self.head.push(segment);
            return;
        }

        let (segment, size) = clip(segment, size, budget);
        self.tail_chars += size;
        self.tail.push_back((segment, size));
        while self.total > budget && self.head_chars + self.tail_chars > budget + 1 && self.tail.len() > 1 {
            if let Some((_, size)) = self.tail.pop_front() {
                self.tail_chars -= size;
                self.dropped += 1;
            }
        }
    }

    fn push_text(&mut self, text: &str) {
        for c in text.chars() {
            if self.prefix_len < self.governor.budget {
                self.prefix.push(c);
                self.prefix_len += 1;
            }
            if self.tail_len > 0 {
                if self.suffix.len() == self.tail_len {
                    self.suffix.pop_front();
                }
                self.suffix.push_back(c);
            }
            self.total += 1;
        }
    }

    pub fn finish(self) -> Collected {
        let budget = self.governor.budget;
        let governed = if self.total <= budget {
            Governed {
                text: self.prefix,
                truncated: false,
                elided: 0,
            }
        } else {
            let elided = self.total - budget;
            let mut text: String = self.prefix.chars().take(self.governor.head_len()).collect();
            text.push_str(&elision_marker(elided));
            text.extend(self.suffix.iter());
            Governed {
                text,
                truncated: true,
                elided,
            }
        };

        let mut segments = self.head;
        if self.dropped > 0 {
            segments.push(dropped_segments_marker(self.dropped));
        }
        segments.extend(self.tail.into_iter().map(|(segment, _)| segment));
        Collected { segments, governed }
    }
}

/// Keep the last `budget` characters of an oversized text line
fn clip(segment: OutputSegment, size: usize, budget: usize) -> (OutputSegment, usize) {
    if size <= budget + 1 {
        return (segment, size);
    }
    let keep = |line: String| -> String {
        let count = line.chars().count();
        line.chars().skip(count.saturating_sub(budget)).collect()
    };
    let segment = match segment {
        OutputSegment::Text(line) => OutputSegment::Text(keep(line)),
        OutputSegment::Error(line) => OutputSegment::Error(keep(line)),
        image @ OutputSegment::Image { .. } => return (image, size),
    };
    (segment, budget + 1)
}
