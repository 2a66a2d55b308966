//! Shared helpers for unit and integration tests.

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::collections::VecDeque;
use std::sync::Mutex;
use thinkloop_core::error::ModelError;
use thinkloop_core::message::Message;
use thinkloop_core::provider::{
    FinishReason, InvokeOptions, ModelInvoker, PersonaConfig, RawStream, RawStreamEvent,
    ToolDefinition, Usage,
};

/// What one call to the invoker looked like.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub persona: String,
    pub messages: usize,
    pub tools: usize,
}

/// A model invoker that replays one scripted raw event sequence per call.
///
/// Calls past the end of the script fail with a `ModelError::ApiError`.
pub struct ScriptedInvoker {
    script: Mutex<VecDeque<Vec<RawStreamEvent>>>,
    recorded: Mutex<Vec<RecordedCall>>,
    fail_all: bool,
}

impl ScriptedInvoker {
    pub fn new(script: Vec<Vec<RawStreamEvent>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            recorded: Mutex::new(Vec::new()),
            fail_all: false,
        }
    }

    /// An invoker whose every call fails.
    pub fn failing() -> Self {
        Self {
            fail_all: true,
            ..Self::new(Vec::new())
        }
    }

    pub fn calls(&self) -> usize {
        self.recorded().len()
    }

    /// Persona names in call order.
    pub fn personas(&self) -> Vec<String> {
        self.recorded().into_iter().map(|c| c.persona).collect()
    }

    /// History length seen by each call.
    pub fn history_lens(&self) -> Vec<usize> {
        self.recorded().into_iter().map(|c| c.messages).collect()
    }

    /// Number of tool definitions offered to each call.
    pub fn tool_counts(&self) -> Vec<usize> {
        self.recorded().into_iter().map(|c| c.tools).collect()
    }

    pub fn recorded(&self) -> Vec<RecordedCall> {
        self.recorded
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl ModelInvoker for ScriptedInvoker {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn invoke(
        &self,
        persona: &PersonaConfig,
        messages: &[Message],
        tools: &[ToolDefinition],
        _options: &InvokeOptions,
    ) -> Result<RawStream, ModelError> {
        self.recorded
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(RecordedCall {
                persona: persona.name.clone(),
                messages: messages.len(),
                tools: tools.len(),
            });

        if self.fail_all {
            return Err(ModelError::Network("connection refused".into()));
        }

        let next = self
            .script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();
        match next {
            Some(events) => Ok(stream::iter(events.into_iter().map(Ok)).boxed()),
            None => Err(ModelError::ApiError {
                status_code: 500,
                message: format!("no scripted response left for persona '{}'", persona.name),
            }),
        }
    }
}

pub fn text(t: &str) -> RawStreamEvent {
    RawStreamEvent::TextDelta { text: t.into() }
}

pub fn tool_call(id: &str, name: &str, args: serde_json::Value) -> RawStreamEvent {
    RawStreamEvent::ToolCall {
        id: id.into(),
        name: name.into(),
        args,
    }
}

pub fn finish(reason: FinishReason) -> RawStreamEvent {
    RawStreamEvent::Finish {
        finish_reason: Some(reason),
        usage: Some(Usage::new(10, 5)),
    }
}

/// A step that produces nothing but a finish event.
pub fn silent() -> Vec<RawStreamEvent> {
    vec![RawStreamEvent::Finish {
        finish_reason: Some(FinishReason::Stop),
        usage: None,
    }]
}
