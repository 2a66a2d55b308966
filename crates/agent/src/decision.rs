//! Decision policy: maps loop and model signals to the next transition.
//!
//! Priority order:
//! 1. compaction pressure (flag or message-count threshold)
//! 2. the model's finish reason
//! 3. the structure of the last message, only when the finish reason is
//!    missing or not one we act on
//! 4. continue

use serde::{Deserialize, Serialize};
use thinkloop_core::message::{Message, Role};
use thinkloop_core::provider::FinishReason;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Continue,
    Compact,
    Stop,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Continue => "continue",
            Self::Compact => "compact",
            Self::Stop => "stop",
        }
    }
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The loop signals the policy looks at.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecisionSignals {
    pub needs_compaction: bool,
    pub message_count: usize,
    pub compact_threshold: usize,
    pub finish_reason: Option<FinishReason>,
}

/// Decide what the loop does after an observation.
pub fn decide(signals: &DecisionSignals, last_message: Option<&Message>) -> Decision {
    if signals.needs_compaction
        || (signals.compact_threshold > 0 && signals.message_count >= signals.compact_threshold)
    {
        return Decision::Compact;
    }

    if let Some(decision) = signals.finish_reason.and_then(from_finish_reason) {
        return decision;
    }

    if let Some(decision) = from_message_structure(last_message) {
        return decision;
    }

    Decision::Continue
}

fn from_finish_reason(reason: FinishReason) -> Option<Decision> {
    match reason {
        FinishReason::Stop | FinishReason::EndTurn => Some(Decision::Stop),
        FinishReason::ToolCalls => Some(Decision::Continue),
        // Truncated output: tool intent is unknowable
        FinishReason::Length => Some(Decision::Stop),
        FinishReason::ContentFilter => Some(Decision::Stop),
        FinishReason::Error | FinishReason::Other | FinishReason::Unknown => None,
    }
}

fn from_message_structure(last_message: Option<&Message>) -> Option<Decision> {
    let Some(message) = last_message else {
        return Some(Decision::Stop);
    };
    match message.role {
        Role::Tool => Some(Decision::Continue),
        Role::Assistant if message.has_tool_call() => Some(Decision::Continue),
        Role::Assistant => Some(Decision::Stop),
        Role::User => None,
    }
}
