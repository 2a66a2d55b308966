//! Message and content-block domain types.
//!
//! These are the value objects that flow through the whole loop:
//! the user message opens a run, the processor produces assistant messages,
//! tool execution produces tool messages, and the session stores them all.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The role of a message sender in a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The end user (or the parent agent, for sub-agent runs)
    User,
    /// The model
    Assistant,
    /// Tool execution result
    Tool,
}

/// One typed block inside a block-list message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ContentBlock {
    /// Visible answer text.
    Text { text: String },

    /// Model reasoning that is kept in the history but not shown as the answer.
    Reasoning { text: String },

    /// A tool invocation requested by the model.
    ToolCall {
        id: String,
        name: String,
        args: serde_json::Value,
    },

    /// The outcome of a tool invocation. Must follow the `ToolCall` with the same id.
    ToolResult {
        tool_call_id: String,
        tool_name: String,
        output: String,
        #[serde(default)]
        is_error: bool,
    },
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn reasoning(text: impl Into<String>) -> Self {
        Self::Reasoning { text: text.into() }
    }
}

/// Message payload: either plain text or an ordered list of blocks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

/// A single message in a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Unique message ID
    pub id: String,

    /// Who sent this message
    pub role: Role,

    /// The payload
    pub content: MessageContent,

    /// Timestamp
    pub timestamp: DateTime<Utc>,
}

impl Message {
    fn new(role: Role, content: MessageContent) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role,
            content,
            timestamp: Utc::now(),
        }
    }

    /// Create a new user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, MessageContent::Text(content.into()))
    }

    /// Create a plain-text assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, MessageContent::Text(content.into()))
    }

    /// Create an assistant message made of blocks.
    pub fn assistant_blocks(blocks: Vec<ContentBlock>) -> Self {
        Self::new(Role::Assistant, MessageContent::Blocks(blocks))
    }

    /// Create a tool message carrying exactly one `ToolResult` block.
    pub fn tool_result(
        tool_call_id: impl Into<String>,
        tool_name: impl Into<String>,
        output: impl Into<String>,
        is_error: bool,
    ) -> Self {
        Self::new(
            Role::Tool,
            MessageContent::Blocks(vec![ContentBlock::ToolResult {
                tool_call_id: tool_call_id.into(),
                tool_name: tool_name.into(),
                output: output.into(),
                is_error,
            }]),
        )
    }

    /// The blocks of this message; plain text is viewed as no blocks.
    pub fn blocks(&self) -> &[ContentBlock] {
        match &self.content {
            MessageContent::Text(_) => &[],
            MessageContent::Blocks(blocks) => blocks,
        }
    }

    /// Concatenated visible text (plain content or all `Text` blocks).
    pub fn text(&self) -> String {
        match &self.content {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join(""),
        }
    }

    /// Whether any `ToolCall` block is present.
    pub fn has_tool_call(&self) -> bool {
        self.blocks()
            .iter()
            .any(|b| matches!(b, ContentBlock::ToolCall { .. }))
    }

    /// Ids of every `ToolCall` block in this message.
    pub fn tool_call_ids(&self) -> impl Iterator<Item = &str> {
        self.blocks().iter().filter_map(|b| match b {
            ContentBlock::ToolCall { id, .. } => Some(id.as_str()),
            _ => None,
        })
    }

    /// Ids referenced by every `ToolResult` block in this message.
    pub fn tool_result_ids(&self) -> impl Iterator<Item = &str> {
        self.blocks().iter().filter_map(|b| match b {
            ContentBlock::ToolResult { tool_call_id, .. } => Some(tool_call_id.as_str()),
            _ => None,
        })
    }

    /// Rough size of the payload in characters, used for token estimates.
    pub fn char_len(&self) -> usize {
        match &self.content {
            MessageContent::Text(text) => text.len(),
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .map(|b| match b {
                    ContentBlock::Text { text } | ContentBlock::Reasoning { text } => text.len(),
                    ContentBlock::ToolCall { name, args, .. } => {
                        name.len() + args.to_string().len()
                    }
                    ContentBlock::ToolResult { output, .. } => output.len(),
                })
                .sum(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_user_message() {
        let msg = Message::user("Hello, agent!");
        assert_eq!(msg.role, Role::User);
        assert_eq!(msg.text(), "Hello, agent!");
        assert!(!msg.has_tool_call());
    }

    #[test]
    fn block_message_text_skips_reasoning() {
        let msg = Message::assistant_blocks(vec![
            ContentBlock::reasoning("thinking"),
            ContentBlock::text("answer"),
        ]);
        assert_eq!(msg.text(), "answer");
    }

    #[test]
    fn tool_result_message_has_single_block() {
        let msg = Message::tool_result("call_1", "search", "3 hits", false);
        assert_eq!(msg.role, Role::Tool);
        assert_eq!(msg.blocks().len(), 1);
        assert_eq!(msg.tool_result_ids().collect::<Vec<_>>(), vec!["call_1"]);
    }

    #[test]
    fn content_serializes_as_string_or_blocks() {
        let plain = serde_json::to_value(Message::user("hi")).unwrap();
        assert_eq!(plain["content"], "hi");

        let blocks = Message::assistant_blocks(vec![ContentBlock::ToolCall {
            id: "c1".into(),
            name: "finish_task".into(),
            args: serde_json::json!({"summary": "ok"}),
        }]);
        let json = serde_json::to_value(&blocks).unwrap();
        assert_eq!(json["content"][0]["type"], "tool-call");

        let back: Message = serde_json::from_value(json).unwrap();
        assert_eq!(back, blocks);
    }
}
