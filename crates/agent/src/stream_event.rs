//! Canonical streaming events.
//!
//! Whatever shape a model backend streams in (native reasoning segments or
//! reasoning inlined in text between think markers), the normalizer turns it
//! into this one vocabulary. The dispatcher, observers and UI layers only
//! ever see `StreamEvent`.

use serde::{Deserialize, Serialize};
use thinkloop_core::provider::{FinishReason, Usage};

/// One canonical stream event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum StreamEvent {
    ReasoningStart,
    ReasoningDelta { text: String },
    ReasoningEnd,

    TextStart,
    TextDelta { text: String },
    TextEnd,

    /// The model requested a tool call.
    ToolCall {
        id: String,
        name: String,
        args: serde_json::Value,
    },

    /// A tool call completed.
    ToolResult {
        id: String,
        name: String,
        output: String,
        #[serde(default)]
        is_error: bool,
    },

    /// One internal model round trip of a multi-step call begins.
    StepStart,

    /// One internal model round trip ended.
    StepEnd {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        finish_reason: Option<FinishReason>,
    },

    /// The model call is complete.
    Finish {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        finish_reason: Option<FinishReason>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        usage: Option<Usage>,
    },

    /// The backend reported an error mid-stream.
    Error { message: String },
}

impl StreamEvent {
    /// Wire name of this event type.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::ReasoningStart => "reasoning-start",
            Self::ReasoningDelta { .. } => "reasoning-delta",
            Self::ReasoningEnd => "reasoning-end",
            Self::TextStart => "text-start",
            Self::TextDelta { .. } => "text-delta",
            Self::TextEnd => "text-end",
            Self::ToolCall { .. } => "tool-call",
            Self::ToolResult { .. } => "tool-result",
            Self::StepStart => "step-start",
            Self::StepEnd { .. } => "step-end",
            Self::Finish { .. } => "finish",
            Self::Error { .. } => "error",
        }
    }

    pub fn text_delta(text: impl Into<String>) -> Self {
        Self::TextDelta { text: text.into() }
    }

    pub fn reasoning_delta(text: impl Into<String>) -> Self {
        Self::ReasoningDelta { text: text.into() }
    }
}
