//! Processor: the four step functions of the loop.
//!
//! Each step issues one model call for a named persona, routes the reply
//! through the normalizer and the dispatcher, and returns one
//! [`ProcessorStepResult`]. Only `execute` exposes tools; it may take
//! several internal model/tool round trips, bounded by `max_tool_steps`,
//! and stops early once the terminal tool has been called.

use futures::FutureExt;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use thinkloop_core::error::{Error, Result, ToolError};
use thinkloop_core::event::{DomainEvent, EventBus};
use thinkloop_core::message::Message;
use thinkloop_core::provider::{
    FinishReason, InvokeOptions, ModelInvoker, PersonaConfig, ToolDefinition, Usage,
};
use thinkloop_core::tool::{ToolCall, ToolResult, ToolSet};
use tracing::{debug, info, warn};

use crate::dispatcher::{StreamDispatcher, StreamHandler, StreamSummary};
use crate::merge::{compose_message, with_tool_calls};
use crate::normalizer::{ThinkMarkers, normalize};
use crate::stream_event::StreamEvent;

/// The outcome of one processor step.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessorStepResult {
    pub text: String,
    pub reasoning: String,
    pub finish_reason: Option<FinishReason>,
    pub usage: Option<Usage>,
    pub message: Message,
    pub tool_calls: Vec<ToolCall>,
    pub tool_results: Vec<ToolResult>,
}

impl ProcessorStepResult {
    fn from_summary(summary: StreamSummary) -> Self {
        let message = compose_message(&summary.text, &summary.reasoning);
        Self {
            text: summary.text,
            reasoning: summary.reasoning,
            finish_reason: summary.finish_reason,
            usage: summary.usage,
            message,
            tool_calls: summary.tool_calls,
            tool_results: summary.tool_results,
        }
    }

    /// No text, no reasoning and no tool calls.
    pub fn is_empty(&self) -> bool {
        self.text.is_empty() && self.reasoning.is_empty() && self.tool_calls.is_empty()
    }
}

pub struct Processor {
    invoker: Arc<dyn ModelInvoker>,
    markers: ThinkMarkers,
    terminal_tool: String,
    max_tool_steps: u32,
    event_bus: Option<Arc<EventBus>>,
}

impl Processor {
    pub fn new(invoker: Arc<dyn ModelInvoker>, terminal_tool: impl Into<String>) -> Self {
        Self {
            invoker,
            markers: ThinkMarkers::default(),
            terminal_tool: terminal_tool.into(),
            max_tool_steps: 5,
            event_bus: None,
        }
    }

    pub fn with_markers(mut self, markers: ThinkMarkers) -> Self {
        self.markers = markers;
        self
    }

    /// Cap on internal model/tool round trips inside one `execute`.
    pub fn with_max_tool_steps(mut self, steps: u32) -> Self {
        self.max_tool_steps = steps.max(1);
        self
    }

    /// Publish a `ToolExecuted` event for every tool run.
    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(bus);
        self
    }

    pub fn terminal_tool(&self) -> &str {
        &self.terminal_tool
    }

    /// Whole-task planning for the first iteration. No tools.
    pub async fn plan(
        &self,
        persona: &PersonaConfig,
        messages: &[Message],
        handler: &dyn StreamHandler,
        options: &InvokeOptions,
    ) -> Result<ProcessorStepResult> {
        self.single_call("plan", persona, messages, handler, options)
            .await
    }

    /// Observation-driven next-step reasoning for later iterations. No tools.
    pub async fn reason(
        &self,
        persona: &PersonaConfig,
        messages: &[Message],
        handler: &dyn StreamHandler,
        options: &InvokeOptions,
    ) -> Result<ProcessorStepResult> {
        self.single_call("reason", persona, messages, handler, options)
            .await
    }

    /// Message compression hook. Returns the input unchanged; callers must
    /// not rely on it shrinking anything.
    pub async fn compress(
        &self,
        persona: &PersonaConfig,
        messages: &[Message],
        threshold: usize,
    ) -> Vec<Message> {
        debug!(
            persona = %persona.name,
            messages = messages.len(),
            threshold,
            "Compress step (pass-through)"
        );
        messages.to_vec()
    }

    /// The acting step: model call with tools, tool execution, repeat.
    pub async fn execute(
        &self,
        persona: &PersonaConfig,
        messages: &[Message],
        tools: &ToolSet,
        handler: &dyn StreamHandler,
        options: &InvokeOptions,
    ) -> Result<ProcessorStepResult> {
        let definitions = tools.definitions();
        let mut history = messages.to_vec();
        let mut dispatcher = StreamDispatcher::new(handler);

        for step in 1..=self.max_tool_steps {
            let text_before = dispatcher.summary().text.len();
            let calls_before = dispatcher.summary().tool_calls.len();
            let results_before = dispatcher.summary().tool_results.len();

            dispatcher.begin_step();
            dispatcher.dispatch(StreamEvent::StepStart).await?;
            self.drain_call(&mut dispatcher, persona, &history, &definitions, options)
                .await?;

            let summary = dispatcher.summary();
            let step_text = summary.text[text_before..].trim_start_matches('\n').to_string();
            let step_calls = summary.tool_calls[calls_before..].to_vec();
            let answered: HashSet<String> = summary.tool_results[results_before..]
                .iter()
                .map(|r| r.tool_call_id.clone())
                .collect();

            let mut ran_locally = 0;
            for call in step_calls.iter().filter(|c| !answered.contains(&c.id)) {
                ran_locally += 1;
                let result = self.run_tool(tools, call).await;
                dispatcher
                    .dispatch(StreamEvent::ToolResult {
                        id: result.tool_call_id,
                        name: result.tool_name,
                        output: result.content,
                        is_error: result.is_error,
                    })
                    .await?;
            }

            let finish_reason = dispatcher.summary().finish_reason;
            dispatcher
                .dispatch(StreamEvent::StepEnd { finish_reason })
                .await?;

            if step_calls.iter().any(|c| c.name == self.terminal_tool) {
                info!(step, tool = %self.terminal_tool, "Terminal tool called, ending execute");
                dispatcher.set_finish_reason(Some(FinishReason::Stop));
                break;
            }
            if step_calls.is_empty() {
                break;
            }
            if ran_locally == 0 && finish_reason != Some(FinishReason::ToolCalls) {
                debug!(step, "Every tool call was answered in-stream");
                break;
            }
            if step == self.max_tool_steps {
                debug!(step, "Tool step cap reached");
                break;
            }

            history.push(with_tool_calls(&Message::assistant(step_text), &step_calls));
            history.extend(
                dispatcher.summary().tool_results[results_before..]
                    .iter()
                    .map(|r| {
                        Message::tool_result(&r.tool_call_id, &r.tool_name, &r.content, r.is_error)
                    }),
            );
        }

        let summary = dispatcher.finish().await?;
        Ok(ProcessorStepResult::from_summary(summary))
    }

    async fn single_call(
        &self,
        phase: &str,
        persona: &PersonaConfig,
        messages: &[Message],
        handler: &dyn StreamHandler,
        options: &InvokeOptions,
    ) -> Result<ProcessorStepResult> {
        let mut dispatcher = StreamDispatcher::new(handler);
        self.drain_call(&mut dispatcher, persona, messages, &[], options)
            .await?;
        let mut summary = dispatcher.finish().await?;
        if !summary.tool_calls.is_empty() {
            warn!(
                phase,
                count = summary.tool_calls.len(),
                "Model requested tools in a tool-less step, ignoring"
            );
            summary.tool_calls.clear();
            summary.tool_results.clear();
        }
        Ok(ProcessorStepResult::from_summary(summary))
    }

    async fn drain_call(
        &self,
        dispatcher: &mut StreamDispatcher<'_>,
        persona: &PersonaConfig,
        messages: &[Message],
        tools: &[ToolDefinition],
        options: &InvokeOptions,
    ) -> Result<()> {
        debug!(
            persona = %persona.name,
            invoker = self.invoker.name(),
            messages = messages.len(),
            tools = tools.len(),
            "Invoking model"
        );
        let raw = match self.invoker.invoke(persona, messages, tools, options).await {
            Ok(raw) => raw,
            Err(e) => return dispatcher.fail(Error::Model(e)).await,
        };
        dispatcher.drain(normalize(raw, self.markers.clone())).await
    }

    /// Run one tool call. Errors and panics become `is_error` results.
    async fn run_tool(&self, tools: &ToolSet, call: &ToolCall) -> ToolResult {
        let Some(tool) = tools.get(&call.name) else {
            warn!(tool = %call.name, "Model called a tool that is not available");
            return ToolResult::error(call, ToolError::NotFound(call.name.clone()).to_string());
        };

        let start = Instant::now();
        let outcome = AssertUnwindSafe(tool.execute(call.args.clone()))
            .catch_unwind()
            .await;
        let duration_ms = start.elapsed().as_millis() as u64;

        let result = match outcome {
            Ok(Ok(output)) => ToolResult {
                tool_call_id: call.id.clone(),
                tool_name: call.name.clone(),
                content: output.output,
                is_error: !output.success,
            },
            Ok(Err(e)) => {
                warn!(tool = %call.name, error = %e, "Tool execution failed");
                ToolResult::error(call, format!("Error: {e}"))
            }
            Err(panic) => {
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                warn!(tool = %call.name, reason = %reason, "Tool panicked");
                ToolResult::error(call, format!("Error: {}", ToolError::Panicked(reason)))
            }
        };

        debug!(tool = %call.name, duration_ms, is_error = result.is_error, "Tool executed");
        if let Some(bus) = &self.event_bus {
            bus.publish(DomainEvent::ToolExecuted {
                tool_name: call.name.clone(),
                success: !result.is_error,
                duration_ms,
                timestamp: chrono::Utc::now(),
            });
        }
        result
    }
}
