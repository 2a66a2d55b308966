//! Stream normalizer: raw model output in, canonical [`StreamEvent`]s out.
//!
//! Reasoning reaches us in one of two shapes: native `Reasoning*` events, or
//! inline in ordinary text between a pair of think markers
//! (`<think>...</think>`). Native events pass through. Text chunks go through
//! a small line-buffer style scanner that splits them into text and
//! reasoning segments. When the buffer tail could be the beginning of a
//! marker, those bytes are held back until the next chunk decides it, so a
//! marker split across chunks is still recognized.

use futures::stream::{self, BoxStream, StreamExt};
use std::collections::VecDeque;
use thinkloop_core::error::ModelError;
use thinkloop_core::provider::{RawStream, RawStreamEvent};

use crate::stream_event::StreamEvent;

/// The delimiter pair wrapping inline reasoning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThinkMarkers {
    pub open: String,
    pub close: String,
}

impl ThinkMarkers {
    pub fn new(open: impl Into<String>, close: impl Into<String>) -> Self {
        Self {
            open: open.into(),
            close: close.into(),
        }
    }
}

impl Default for ThinkMarkers {
    fn default() -> Self {
        Self::new("<think>", "</think>")
    }
}

/// Incremental normalizer state for one model call.
#[derive(Debug)]
pub struct StreamNormalizer {
    markers: ThinkMarkers,
    /// Text not yet emitted (only ever a possible partial marker between calls)
    buffer: String,
    /// Inside an inline think segment
    inside: bool,
    text_open: bool,
    native_reasoning_open: bool,
}

impl StreamNormalizer {
    pub fn new(markers: ThinkMarkers) -> Self {
        Self {
            markers,
            buffer: String::new(),
            inside: false,
            text_open: false,
            native_reasoning_open: false,
        }
    }

    /// Feed one raw event, returning the canonical events it produces.
    pub fn handle(&mut self, event: RawStreamEvent) -> Vec<StreamEvent> {
        let mut out = Vec::new();
        match event {
            RawStreamEvent::TextDelta { text } => {
                self.buffer.push_str(&text);
                self.scan(&mut out);
            }
            RawStreamEvent::ReasoningStart => {
                self.flush_pending(&mut out);
                self.close_text(&mut out);
                self.native_reasoning_open = true;
                out.push(StreamEvent::ReasoningStart);
            }
            RawStreamEvent::ReasoningDelta { text } => {
                self.flush_pending(&mut out);
                self.close_text(&mut out);
                out.push(StreamEvent::ReasoningDelta { text });
            }
            RawStreamEvent::ReasoningEnd => {
                self.native_reasoning_open = false;
                out.push(StreamEvent::ReasoningEnd);
            }
            RawStreamEvent::ToolCall { id, name, args } => {
                self.close_all(&mut out);
                out.push(StreamEvent::ToolCall { id, name, args });
            }
            RawStreamEvent::ToolResult {
                id,
                name,
                output,
                is_error,
            } => {
                self.close_all(&mut out);
                out.push(StreamEvent::ToolResult {
                    id,
                    name,
                    output,
                    is_error,
                });
            }
            RawStreamEvent::Finish {
                finish_reason,
                usage,
            } => {
                self.close_all(&mut out);
                out.push(StreamEvent::Finish {
                    finish_reason,
                    usage,
                });
            }
            RawStreamEvent::Error { message } => {
                self.flush_pending(&mut out);
                out.push(StreamEvent::Error { message });
            }
        }
        out
    }

    /// The raw stream ended: flush held bytes and close open segments.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        let mut out = Vec::new();
        self.close_all(&mut out);
        out
    }

    fn scan(&mut self, out: &mut Vec<StreamEvent>) {
        loop {
            let marker = if self.inside {
                self.markers.close.as_str()
            } else {
                self.markers.open.as_str()
            };
            if marker.is_empty() {
                let rest = std::mem::take(&mut self.buffer);
                self.emit_delta(rest, out);
                return;
            }

            if let Some(pos) = self.buffer.find(marker) {
                let before = self.buffer[..pos].to_string();
                self.buffer.drain(..pos + marker.len());
                self.emit_delta(before, out);
                if self.inside {
                    self.inside = false;
                    out.push(StreamEvent::ReasoningEnd);
                } else {
                    self.close_text(out);
                    self.inside = true;
                    out.push(StreamEvent::ReasoningStart);
                }
                continue;
            }

            let hold = partial_marker_len(&self.buffer, marker);
            let split = self.buffer.len() - hold;
            let ready: String = self.buffer.drain(..split).collect();
            self.emit_delta(ready, out);
            return;
        }
    }

    fn emit_delta(&mut self, text: String, out: &mut Vec<StreamEvent>) {
        if text.is_empty() {
            return;
        }
        if self.inside {
            out.push(StreamEvent::ReasoningDelta { text });
        } else {
            if !self.text_open {
                self.text_open = true;
                out.push(StreamEvent::TextStart);
            }
            out.push(StreamEvent::TextDelta { text });
        }
    }

    /// Emit held-back bytes literally in the current mode.
    fn flush_pending(&mut self, out: &mut Vec<StreamEvent>) {
        let rest = std::mem::take(&mut self.buffer);
        self.emit_delta(rest, out);
    }

    fn close_text(&mut self, out: &mut Vec<StreamEvent>) {
        if self.text_open {
            self.text_open = false;
            out.push(StreamEvent::TextEnd);
        }
    }

    fn close_all(&mut self, out: &mut Vec<StreamEvent>) {
        self.flush_pending(out);
        if self.inside {
            self.inside = false;
            out.push(StreamEvent::ReasoningEnd);
        }
        if self.native_reasoning_open {
            self.native_reasoning_open = false;
            out.push(StreamEvent::ReasoningEnd);
        }
        self.close_text(out);
    }
}

/// Length of the longest buffer suffix that is a strict prefix of `marker`.
fn partial_marker_len(buffer: &str, marker: &str) -> usize {
    let max = (marker.len() - 1).min(buffer.len());
    (1..=max)
        .rev()
        .find(|&k| {
            let start = buffer.len() - k;
            buffer.is_char_boundary(start) && marker.starts_with(&buffer[start..])
        })
        .unwrap_or(0)
}

/// Normalize a raw model stream. A transport error ends the stream after
/// being yielded.
pub fn normalize(
    raw: RawStream,
    markers: ThinkMarkers,
) -> BoxStream<'static, Result<StreamEvent, ModelError>> {
    let state = (raw, StreamNormalizer::new(markers), VecDeque::new(), false);
    stream::unfold(
        state,
        |(mut raw, mut normalizer, mut pending, mut done)| async move {
            loop {
                if let Some(event) = pending.pop_front() {
                    return Some((event, (raw, normalizer, pending, done)));
                }
                if done {
                    return None;
                }
                match raw.next().await {
                    Some(Ok(event)) => pending.extend(normalizer.handle(event).into_iter().map(Ok)),
                    Some(Err(e)) => {
                        pending.push_back(Err(e));
                        done = true;
                    }
                    None => {
                        pending.extend(normalizer.finish().into_iter().map(Ok));
                        done = true;
                    }
                }
            }
        },
    )
    .boxed()
}
