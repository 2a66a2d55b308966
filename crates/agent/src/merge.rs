//! Folding a processor step into the session.

use thinkloop_core::message::{ContentBlock, Message, MessageContent};
use thinkloop_core::session::Session;
use thinkloop_core::tool::ToolCall;

use crate::processor::ProcessorStepResult;

/// The assistant message for a step without tool calls: `[Reasoning, Text]`
/// when reasoning is present, plain text otherwise.
pub fn compose_message(text: &str, reasoning: &str) -> Message {
    if reasoning.is_empty() {
        Message::assistant(text)
    } else {
        Message::assistant_blocks(vec![
            ContentBlock::reasoning(reasoning),
            ContentBlock::text(text),
        ])
    }
}

/// `message`'s existing content followed by one `ToolCall` block per call.
pub fn with_tool_calls(message: &Message, calls: &[ToolCall]) -> Message {
    let mut blocks: Vec<ContentBlock> = match &message.content {
        MessageContent::Text(text) if text.is_empty() => Vec::new(),
        MessageContent::Text(text) => vec![ContentBlock::text(text.as_str())],
        MessageContent::Blocks(blocks) => blocks
            .iter()
            .filter(|b| match b {
                ContentBlock::Text { text } | ContentBlock::Reasoning { text } => !text.is_empty(),
                _ => true,
            })
            .cloned()
            .collect(),
    };
    blocks.extend(calls.iter().map(|c| ContentBlock::ToolCall {
        id: c.id.clone(),
        name: c.name.clone(),
        args: c.args.clone(),
    }));
    Message::assistant_blocks(blocks)
}

/// Append one step result to `session`, returning the new session.
///
/// With tool calls the assistant message carries the calls as blocks and
/// every tool result becomes its own `tool` message. A step with no text, no
/// reasoning and no tool calls appends nothing. Usage is folded into the
/// token total either way.
pub fn process_result_to_session(session: &Session, result: &ProcessorStepResult) -> Session {
    let mut appended = Vec::new();

    if !result.tool_calls.is_empty() {
        appended.push(with_tool_calls(&result.message, &result.tool_calls));
        appended.extend(result.tool_results.iter().map(|r| {
            Message::tool_result(&r.tool_call_id, &r.tool_name, &r.content, r.is_error)
        }));
    } else if !result.is_empty() {
        appended.push(result.message.clone());
    }

    let next = session.add_messages(appended);
    match result.usage {
        Some(usage) if usage.total_tokens > 0 => next.add_tokens(u64::from(usage.total_tokens)),
        _ => next,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use thinkloop_core::message::Role;
    use thinkloop_core::provider::{FinishReason, Usage};
    use thinkloop_core::tool::ToolResult;

    fn step(text: &str, reasoning: &str) -> ProcessorStepResult {
        ProcessorStepResult {
            text: text.into(),
            reasoning: reasoning.into(),
            finish_reason: Some(FinishReason::Stop),
            usage: Some(Usage::new(7, 3)),
            message: compose_message(text, reasoning),
            tool_calls: Vec::new(),
            tool_results: Vec::new(),
        }
    }

    #[test]
    fn plain_text_step() {
        let session = Session::new("s", "a").add_message(Message::user("hi"));
        let next = process_result_to_session(&session, &step("hello", ""));

        assert_eq!(session.len(), 1);
        assert_eq!(next.len(), 2);
        assert_eq!(
            next.messages()[1].content,
            MessageContent::Text("hello".into())
        );
        assert_eq!(next.metadata.total_tokens, 10);
    }

    #[test]
    fn reasoning_step_has_two_blocks() {
        let next = process_result_to_session(&Session::new("s", "a"), &step("answer", "because"));
        assert_eq!(
            next.messages()[0].blocks(),
            &[ContentBlock::reasoning("because"), ContentBlock::text("answer")]
        );
    }

    #[test]
    fn tool_calls_become_blocks_and_tool_messages() {
        let call = ToolCall {
            id: "c1".into(),
            name: "finish_task".into(),
            args: serde_json::json!({"summary": "ok"}),
        };
        let mut result = step("calling", "");
        result.finish_reason = Some(FinishReason::ToolCalls);
        result.tool_calls = vec![call.clone()];
        result.tool_results = vec![ToolResult {
            tool_call_id: "c1".into(),
            tool_name: "finish_task".into(),
            content: "ok".into(),
            is_error: false,
        }];

        let next = process_result_to_session(&Session::new("s", "a"), &result);
        assert_eq!(next.len(), 2);

        let assistant = &next.messages()[0];
        assert_eq!(assistant.role, Role::Assistant);
        assert_eq!(
            assistant.blocks(),
            &[
                ContentBlock::text("calling"),
                ContentBlock::ToolCall {
                    id: "c1".into(),
                    name: "finish_task".into(),
                    args: serde_json::json!({"summary": "ok"}),
                },
            ]
        );

        let tool = &next.messages()[1];
        assert_eq!(tool.role, Role::Tool);
        assert_eq!(tool.tool_result_ids().collect::<Vec<_>>(), vec!["c1"]);
    }

    #[test]
    fn tool_calls_without_text_have_only_call_blocks() {
        let mut result = step("", "");
        result.tool_calls = vec![ToolCall {
            id: "c1".into(),
            name: "x".into(),
            args: serde_json::Value::Null,
        }];
        let next = process_result_to_session(&Session::new("s", "a"), &result);
        assert_eq!(next.messages()[0].blocks().len(), 1);
        assert!(next.messages()[0].has_tool_call());
    }

    #[test]
    fn empty_step_appends_nothing_but_counts_tokens() {
        let session = Session::new("s", "a").add_message(Message::user("hi"));
        let next = process_result_to_session(&session, &step("", ""));
        assert_eq!(next.len(), 1);
        assert_eq!(next.metadata.total_tokens, 10);
    }
}
