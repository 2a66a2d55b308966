//! Stream dispatcher: routes canonical events to callbacks and keeps the
//! running aggregate of one model call.
//!
//! Dispatch never swallows errors: a failing callback or an `error` event
//! invokes [`StreamHandler::on_error`] and is then returned to the caller.

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use thinkloop_core::error::{Error, ModelError, Result};
use thinkloop_core::provider::{FinishReason, Usage};
use thinkloop_core::tool::{ToolCall, ToolResult};
use tracing::debug;

use crate::stream_event::StreamEvent;

/// Aggregate of one fully drained stream.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamSummary {
    pub text: String,
    pub reasoning: String,
    pub finish_reason: Option<FinishReason>,
    pub usage: Option<Usage>,
    pub tool_calls: Vec<ToolCall>,
    pub tool_results: Vec<ToolResult>,
}

/// Per-category stream callbacks. Every method defaults to a no-op.
#[async_trait]
pub trait StreamHandler: Send + Sync {
    async fn on_reasoning_start(&self) -> anyhow::Result<()> {
        Ok(())
    }
    async fn on_reasoning_delta(&self, _text: &str) -> anyhow::Result<()> {
        Ok(())
    }
    async fn on_reasoning_end(&self) -> anyhow::Result<()> {
        Ok(())
    }
    async fn on_text_start(&self) -> anyhow::Result<()> {
        Ok(())
    }
    async fn on_text_delta(&self, _text: &str) -> anyhow::Result<()> {
        Ok(())
    }
    async fn on_text_end(&self) -> anyhow::Result<()> {
        Ok(())
    }
    async fn on_tool_call(&self, _call: &ToolCall) -> anyhow::Result<()> {
        Ok(())
    }
    async fn on_tool_result(&self, _result: &ToolResult) -> anyhow::Result<()> {
        Ok(())
    }
    async fn on_step_start(&self) -> anyhow::Result<()> {
        Ok(())
    }
    async fn on_step_end(&self, _finish_reason: Option<FinishReason>) -> anyhow::Result<()> {
        Ok(())
    }
    async fn on_error(&self, _error: &Error) {}
    async fn on_finish(&self, _summary: &StreamSummary) -> anyhow::Result<()> {
        Ok(())
    }
}

/// A handler that ignores everything.
pub struct NoopHandler;

impl StreamHandler for NoopHandler {}

/// Stateful dispatcher for one model call (possibly spanning several
/// internal steps when driven by Execute).
pub struct StreamDispatcher<'a> {
    handler: &'a dyn StreamHandler,
    summary: StreamSummary,
    /// Set at a step boundary; the next text delta starts on a new line.
    separate_text: bool,
}

impl<'a> StreamDispatcher<'a> {
    pub fn new(handler: &'a dyn StreamHandler) -> Self {
        Self {
            handler,
            summary: StreamSummary::default(),
            separate_text: false,
        }
    }

    /// The aggregate so far.
    pub fn summary(&self) -> &StreamSummary {
        &self.summary
    }

    /// Route one event to its callback and fold it into the aggregate.
    pub async fn dispatch(&mut self, event: StreamEvent) -> Result<()> {
        let handler = self.handler;
        let outcome = match event {
            StreamEvent::ReasoningStart => handler.on_reasoning_start().await,
            StreamEvent::ReasoningDelta { text } => {
                self.summary.reasoning.push_str(&text);
                handler.on_reasoning_delta(&text).await
            }
            StreamEvent::ReasoningEnd => handler.on_reasoning_end().await,
            StreamEvent::TextStart => handler.on_text_start().await,
            StreamEvent::TextDelta { text } => {
                if self.separate_text && !text.is_empty() {
                    self.summary.text.push('\n');
                    self.separate_text = false;
                }
                self.summary.text.push_str(&text);
                handler.on_text_delta(&text).await
            }
            StreamEvent::TextEnd => handler.on_text_end().await,
            StreamEvent::ToolCall { id, name, args } => {
                let call = ToolCall { id, name, args };
                let outcome = handler.on_tool_call(&call).await;
                self.summary.tool_calls.push(call);
                outcome
            }
            StreamEvent::ToolResult {
                id,
                name,
                output,
                is_error,
            } => {
                let result = ToolResult {
                    tool_call_id: id,
                    tool_name: name,
                    content: output,
                    is_error,
                };
                let outcome = handler.on_tool_result(&result).await;
                self.summary.tool_results.push(result);
                outcome
            }
            StreamEvent::StepStart => handler.on_step_start().await,
            StreamEvent::StepEnd { finish_reason } => handler.on_step_end(finish_reason).await,
            StreamEvent::Finish {
                finish_reason,
                usage,
            } => {
                if finish_reason.is_some() {
                    self.summary.finish_reason = finish_reason;
                }
                if let Some(usage) = usage {
                    self.summary.usage = Some(match self.summary.usage {
                        Some(total) => total.merge(usage),
                        None => usage,
                    });
                }
                Ok(())
            }
            StreamEvent::Error { message } => {
                return self.fail(Error::Stream(message)).await;
            }
        };

        match outcome {
            Ok(()) => Ok(()),
            Err(e) => self.fail(Error::Handler(format!("{e:#}"))).await,
        }
    }

    /// Dispatch every event of `stream`. Transport errors abort the drain.
    pub async fn drain(
        &mut self,
        mut stream: BoxStream<'_, std::result::Result<StreamEvent, ModelError>>,
    ) -> Result<()> {
        while let Some(item) = stream.next().await {
            match item {
                Ok(event) => self.dispatch(event).await?,
                Err(e) => return self.fail(Error::Model(e)).await,
            }
        }
        Ok(())
    }

    /// Report the aggregate through `on_finish` and hand it back.
    pub async fn finish(self) -> Result<StreamSummary> {
        debug!(
            text_len = self.summary.text.len(),
            reasoning_len = self.summary.reasoning.len(),
            tool_calls = self.summary.tool_calls.len(),
            finish_reason = ?self.summary.finish_reason,
            "Stream drained"
        );
        if let Err(e) = self.handler.on_finish(&self.summary).await {
            let error = Error::Handler(format!("{e:#}"));
            self.handler.on_error(&error).await;
            return Err(error);
        }
        Ok(self.summary)
    }

    /// Mark the start of another internal step. The finish reason is reset
    /// so it always describes the latest step, and text from the new step is
    /// separated from earlier text by a newline.
    pub fn begin_step(&mut self) {
        self.summary.finish_reason = None;
        self.separate_text = !self.summary.text.is_empty();
    }

    /// Replace the aggregated finish reason.
    pub fn set_finish_reason(&mut self, reason: Option<FinishReason>) {
        self.summary.finish_reason = reason;
    }

    /// Report `error` through `on_error` and return it.
    pub async fn fail<T>(&self, error: Error) -> Result<T> {
        self.handler.on_error(&error).await;
        Err(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<String>>,
        fail_on_text: bool,
    }

    impl Recorder {
        fn log(&self, entry: impl Into<String>) {
            self.calls.lock().unwrap().push(entry.into());
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl StreamHandler for Recorder {
        async fn on_reasoning_delta(&self, text: &str) -> anyhow::Result<()> {
            self.log(format!("reasoning:{text}"));
            Ok(())
        }
        async fn on_text_delta(&self, text: &str) -> anyhow::Result<()> {
            if self.fail_on_text {
                anyhow::bail!("renderer closed");
            }
            self.log(format!("text:{text}"));
            Ok(())
        }
        async fn on_tool_call(&self, call: &ToolCall) -> anyhow::Result<()> {
            self.log(format!("tool:{}", call.name));
            Ok(())
        }
        async fn on_error(&self, error: &Error) {
            self.log(format!("error:{error}"));
        }
        async fn on_finish(&self, summary: &StreamSummary) -> anyhow::Result<()> {
            self.log(format!("finish:{}", summary.text));
            Ok(())
        }
    }

    fn events(list: Vec<StreamEvent>) -> BoxStream<'static, std::result::Result<StreamEvent, ModelError>> {
        stream::iter(list.into_iter().map(Ok)).boxed()
    }

    #[tokio::test]
    async fn accumulates_and_finishes_after_drain() {
        let recorder = Recorder::default();
        let mut dispatcher = StreamDispatcher::new(&recorder);
        dispatcher
            .drain(events(vec![
                StreamEvent::ReasoningStart,
                StreamEvent::reasoning_delta("think "),
                StreamEvent::reasoning_delta("more"),
                StreamEvent::ReasoningEnd,
                StreamEvent::TextStart,
                StreamEvent::text_delta("Hello"),
                StreamEvent::text_delta("!"),
                StreamEvent::TextEnd,
                StreamEvent::ToolCall {
                    id: "c1".into(),
                    name: "finish_task".into(),
                    args: serde_json::json!({}),
                },
                StreamEvent::Finish {
                    finish_reason: Some(FinishReason::ToolCalls),
                    usage: Some(Usage::new(5, 5)),
                },
            ]))
            .await
            .unwrap();

        assert!(!recorder.calls().iter().any(|c| c.starts_with("finish:")));
        let summary = dispatcher.finish().await.unwrap();

        assert_eq!(summary.text, "Hello!");
        assert_eq!(summary.reasoning, "think more");
        assert_eq!(summary.finish_reason, Some(FinishReason::ToolCalls));
        assert_eq!(summary.usage.unwrap().total_tokens, 10);
        assert_eq!(summary.tool_calls.len(), 1);
        assert_eq!(recorder.calls().last().unwrap(), "finish:Hello!");
    }

    #[tokio::test]
    async fn usage_is_summed_across_finishes() {
        let mut dispatcher = StreamDispatcher::new(&NoopHandler);
        for _ in 0..2 {
            dispatcher
                .dispatch(StreamEvent::Finish {
                    finish_reason: None,
                    usage: Some(Usage::new(3, 4)),
                })
                .await
                .unwrap();
        }
        assert_eq!(dispatcher.summary().usage.unwrap().total_tokens, 14);
        assert_eq!(dispatcher.summary().finish_reason, None);
    }

    #[tokio::test]
    async fn error_event_calls_on_error_then_propagates() {
        let recorder = Recorder::default();
        let mut dispatcher = StreamDispatcher::new(&recorder);
        let err = dispatcher
            .drain(events(vec![
                StreamEvent::text_delta("a"),
                StreamEvent::Error {
                    message: "overloaded".into(),
                },
                StreamEvent::text_delta("b"),
            ]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Stream(ref m) if m == "overloaded"));
        assert_eq!(
            recorder.calls(),
            vec!["text:a".to_string(), "error:Stream error: overloaded".into()]
        );
    }

    #[tokio::test]
    async fn callback_error_propagates() {
        let recorder = Recorder {
            fail_on_text: true,
            ..Default::default()
        };
        let mut dispatcher = StreamDispatcher::new(&recorder);
        let err = dispatcher
            .dispatch(StreamEvent::text_delta("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Handler(ref m) if m.contains("renderer closed")));
        assert_eq!(recorder.calls().len(), 1);
    }

    #[tokio::test]
    async fn transport_error_propagates_as_model_error() {
        let recorder = Recorder::default();
        let mut dispatcher = StreamDispatcher::new(&recorder);
        let stream = stream::iter(vec![Err(ModelError::Timeout("120s".into()))]).boxed();
        let err = dispatcher.drain(stream).await.unwrap_err();
        assert!(matches!(err, Error::Model(ModelError::Timeout(_))));
        assert!(recorder.calls()[0].starts_with("error:"));
    }

    #[tokio::test]
    async fn oversized_usage_saturates() {
        let mut dispatcher = StreamDispatcher::new(&NoopHandler);
        let big = u32::MAX / 2 + 1;
        for _ in 0..2 {
            dispatcher
                .dispatch(StreamEvent::Finish {
                    finish_reason: Some(FinishReason::Stop),
                    usage: Some(Usage::new(big, 0)),
                })
                .await
                .unwrap();
        }
        assert_eq!(dispatcher.summary().usage.unwrap().total_tokens, u32::MAX);
    }

    #[tokio::test]
    async fn step_boundary_separates_text_and_resets_finish_reason() {
        let mut dispatcher = StreamDispatcher::new(&NoopHandler);
        dispatcher.begin_step();
        dispatcher
            .drain(events(vec![
                StreamEvent::text_delta("first"),
                StreamEvent::Finish {
                    finish_reason: Some(FinishReason::ToolCalls),
                    usage: None,
                },
            ]))
            .await
            .unwrap();
        dispatcher.begin_step();
        assert_eq!(dispatcher.summary().finish_reason, None);
        dispatcher
            .drain(events(vec![StreamEvent::text_delta("second")]))
            .await
            .unwrap();
        assert_eq!(dispatcher.summary().text, "first\nsecond");
    }
}
