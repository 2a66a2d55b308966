//! Model invocation contract: the abstraction over LLM backends.
//!
//! The core never talks to a network client directly. It hands a persona,
//! the message history and an optional tool set to a [`ModelInvoker`] and
//! consumes the raw event stream it returns. Retries and timeouts are the
//! invoker's job; the core only supplies the budgets in [`InvokeOptions`].

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::error::ModelError;
use crate::message::Message;

/// A named agent persona: which model to call and how to prompt it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersonaConfig {
    /// Persona name (e.g., "planner", "executor")
    pub name: String,

    /// The model to use (e.g., "anthropic/claude-sonnet-4")
    #[serde(default)]
    pub model: String,

    /// System prompt prepended by the invoker
    #[serde(default)]
    pub system_prompt: String,

    /// Temperature (0.0 = deterministic, 1.0 = creative)
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Maximum tokens to generate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

fn default_temperature() -> f32 {
    0.7
}

impl PersonaConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            model: String::new(),
            system_prompt: String::new(),
            temperature: default_temperature(),
            max_tokens: None,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }
}

/// A tool definition sent to the model so it knows what it can call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema describing the tool's parameters
    pub parameters: serde_json::Value,
}

/// Token usage information.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl Usage {
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens.saturating_add(completion_tokens),
        }
    }

    /// Component-wise sum, saturating at `u32::MAX`.
    pub fn merge(self, other: Usage) -> Usage {
        Usage {
            prompt_tokens: self.prompt_tokens.saturating_add(other.prompt_tokens),
            completion_tokens: self.completion_tokens.saturating_add(other.completion_tokens),
            total_tokens: self.total_tokens.saturating_add(other.total_tokens),
        }
    }
}

/// Why one model call stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FinishReason {
    Stop,
    EndTurn,
    ToolCalls,
    Length,
    ContentFilter,
    Error,
    Other,
    Unknown,
}

impl FinishReason {
    /// Parse a vendor string. Both `tool_calls` and `tool-calls` spellings are
    /// accepted; anything unrecognized becomes [`FinishReason::Other`].
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "stop" => Self::Stop,
            "end-turn" => Self::EndTurn,
            "tool-calls" | "tool-use" => Self::ToolCalls,
            "length" | "max-tokens" => Self::Length,
            "content-filter" => Self::ContentFilter,
            "error" => Self::Error,
            "unknown" | "" => Self::Unknown,
            _ => Self::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stop => "stop",
            Self::EndTurn => "end-turn",
            Self::ToolCalls => "tool-calls",
            Self::Length => "length",
            Self::ContentFilter => "content-filter",
            Self::Error => "error",
            Self::Other => "other",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for FinishReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One event of the raw model output stream.
///
/// Reasoning may arrive either as native `Reasoning*` events or inline in
/// `TextDelta` chunks between think markers; the agent's normalizer turns
/// both into one canonical event vocabulary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum RawStreamEvent {
    ReasoningStart,
    ReasoningDelta { text: String },
    ReasoningEnd,
    TextDelta { text: String },
    ToolCall {
        id: String,
        name: String,
        args: serde_json::Value,
    },
    /// Result of a tool the backend executed itself.
    ToolResult {
        id: String,
        name: String,
        output: String,
        #[serde(default)]
        is_error: bool,
    },
    Finish {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        finish_reason: Option<FinishReason>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        usage: Option<Usage>,
    },
    Error { message: String },
}

/// The stream returned by a model call.
pub type RawStream = BoxStream<'static, std::result::Result<RawStreamEvent, ModelError>>;

/// A cloneable cancellation flag shared with the model collaborator.
#[derive(Debug, Clone, Default)]
pub struct AbortSignal {
    aborted: Arc<AtomicBool>,
}

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }
}

/// Per-call budgets handed to the invoker.
#[derive(Debug, Clone)]
pub struct InvokeOptions {
    pub max_retries: u32,
    pub timeout: Duration,
    pub abort: Option<AbortSignal>,
}

impl Default for InvokeOptions {
    fn default() -> Self {
        Self {
            max_retries: 2,
            timeout: Duration::from_secs(120),
            abort: None,
        }
    }
}

/// The model invocation collaborator.
///
/// Implementations own network access, provider selection, credentials,
/// retries and timeouts. The agent loop only calls [`ModelInvoker::invoke`]
/// and drains the stream.
#[async_trait]
pub trait ModelInvoker: Send + Sync {
    /// A human-readable name for this invoker (e.g., "openrouter", "scripted").
    fn name(&self) -> &str;

    /// Start one model call. An empty `tools` slice means no tool use.
    async fn invoke(
        &self,
        persona: &PersonaConfig,
        messages: &[Message],
        tools: &[ToolDefinition],
        options: &InvokeOptions,
    ) -> std::result::Result<RawStream, ModelError>;
}
