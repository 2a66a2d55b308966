//! Session model and its pure transformation operations.
//!
//! A [`Session`] is never mutated in place. Every operation borrows the
//! current value and returns a new one, so a caller holding an older
//! session keeps seeing exactly what it saw before. The message list sits
//! behind an `Arc`, which makes cloning a session cheap and lets
//! [`Session::shares_messages`] tell whether two values alias the same list.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;

use crate::message::Message;

/// Running totals attached to a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub total_tokens: u64,
    pub total_iterations: u32,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_compaction_at: Option<DateTime<Utc>>,
}

/// An immutable conversation owned by one agent-loop invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub agent_name: String,
    messages: Arc<Vec<Message>>,
    pub metadata: SessionMetadata,
}

impl Session {
    /// Create an empty session with zeroed metadata.
    pub fn new(id: impl Into<String>, agent_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            agent_name: agent_name.into(),
            messages: Arc::new(Vec::new()),
            metadata: SessionMetadata {
                total_tokens: 0,
                total_iterations: 0,
                created_at: Utc::now(),
                last_compaction_at: None,
            },
        }
    }

    /// The ordered message history.
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn last_message(&self) -> Option<&Message> {
        self.messages.last()
    }

    /// Whether both values point at the same message storage.
    pub fn shares_messages(&self, other: &Session) -> bool {
        Arc::ptr_eq(&self.messages, &other.messages)
    }

    /// Rough token estimate for the history (4 chars ≈ 1 token).
    pub fn estimated_tokens(&self) -> usize {
        self.messages.iter().map(|m| m.char_len() / 4).sum()
    }

    fn with_messages(&self, messages: Vec<Message>) -> Self {
        Self {
            id: self.id.clone(),
            agent_name: self.agent_name.clone(),
            messages: Arc::new(messages),
            metadata: self.metadata.clone(),
        }
    }

    /// Append one message.
    #[must_use]
    pub fn add_message(&self, message: Message) -> Self {
        self.add_messages(vec![message])
    }

    /// Append several messages. An empty list returns a value that shares
    /// storage with `self`; otherwise the message list is freshly allocated.
    #[must_use]
    pub fn add_messages(&self, messages: Vec<Message>) -> Self {
        if messages.is_empty() {
            return self.clone();
        }
        let mut next = Vec::with_capacity(self.messages.len() + messages.len());
        next.extend(self.messages.iter().cloned());
        next.extend(messages);
        self.with_messages(next)
    }

    /// Add `n` to the token total.
    #[must_use]
    pub fn add_tokens(&self, n: u64) -> Self {
        let mut next = self.with_messages(self.messages.to_vec());
        next.metadata.total_tokens = self.metadata.total_tokens.saturating_add(n);
        next
    }

    /// Add `n` to the iteration total.
    #[must_use]
    pub fn increment_iterations(&self, n: u32) -> Self {
        let mut next = self.with_messages(self.messages.to_vec());
        next.metadata.total_iterations = self.metadata.total_iterations.saturating_add(n);
        next
    }

    /// Keep at most `keep_count` of the most recent messages and stamp
    /// `last_compaction_at`.
    ///
    /// Tool-result messages whose call was cut off are dropped as well, so
    /// the retained history never references a missing `ToolCall`.
    #[must_use]
    pub fn compress_messages(&self, keep_count: usize) -> Self {
        let start = self.messages.len().saturating_sub(keep_count);
        let mut seen_calls: HashSet<&str> = HashSet::new();
        let mut kept = Vec::with_capacity(self.messages.len() - start);

        for message in &self.messages[start..] {
            let orphaned = message
                .tool_result_ids()
                .any(|id| !seen_calls.contains(id));
            if orphaned {
                continue;
            }
            seen_calls.extend(message.tool_call_ids());
            kept.push(message.clone());
        }

        let mut next = self.with_messages(kept);
        next.metadata.last_compaction_at = Some(Utc::now());
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{ContentBlock, Role};

    fn session_with(n: usize) -> Session {
        let messages = (0..n).map(|i| Message::user(format!("m{i}"))).collect();
        Session::new("s1", "agent").add_messages(messages)
    }

    fn tool_call(id: &str) -> Message {
        Message::assistant_blocks(vec![ContentBlock::ToolCall {
            id: id.into(),
            name: "search".into(),
            args: serde_json::json!({}),
        }])
    }

    #[test]
    fn create_starts_empty() {
        let s = Session::new("s1", "agent");
        assert!(s.is_empty());
        assert_eq!(s.metadata.total_tokens, 0);
        assert_eq!(s.metadata.total_iterations, 0);
        assert!(s.metadata.last_compaction_at.is_none());
    }

    #[test]
    fn ops_leave_input_untouched() {
        let s = session_with(3);
        let before_len = s.len();
        let before_meta = s.metadata.clone();

        let results = [
            s.add_message(Message::assistant("x")),
            s.add_messages(vec![Message::assistant("y")]),
            s.add_tokens(42),
            s.increment_iterations(2),
            s.compress_messages(1),
        ];

        assert_eq!(s.len(), before_len);
        assert_eq!(s.metadata, before_meta);
        for r in &results {
            assert!(!r.shares_messages(&s));
        }
    }

    #[test]
    fn empty_add_messages_is_noop_alias() {
        let s = session_with(2);
        let same = s.add_messages(vec![]);
        assert!(same.shares_messages(&s));
        assert_eq!(same, s);
    }

    #[test]
    fn counters_accumulate() {
        let s = Session::new("s1", "agent").add_tokens(10).add_tokens(5);
        assert_eq!(s.metadata.total_tokens, 15);
        let s = s.increment_iterations(3);
        assert_eq!(s.metadata.total_iterations, 3);
    }

    #[test]
    fn compaction_bound_holds() {
        let s = session_with(10);
        for k in [0, 1, 5, 10, 20] {
            let c = s.compress_messages(k);
            assert!(c.len() <= k);
            assert!(c.metadata.last_compaction_at.is_some());
        }
        let c = s.compress_messages(3);
        assert_eq!(c.messages()[0].text(), "m7");
    }

    #[test]
    fn compaction_drops_orphaned_tool_results() {
        let s = Session::new("s1", "agent").add_messages(vec![
            Message::user("go"),
            tool_call("c1"),
            Message::tool_result("c1", "search", "hit", false),
            Message::assistant("done"),
        ]);

        // Window starts at the tool result, whose call is cut off.
        let c = s.compress_messages(2);
        assert_eq!(c.len(), 1);
        assert_eq!(c.messages()[0].role, Role::Assistant);

        // Window keeps the call, so the result stays too.
        let c = s.compress_messages(3);
        assert_eq!(c.len(), 3);
    }
}
