//! Loop states and the per-run context the state machine mutates.

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};
use thinkloop_core::error::Error;
use thinkloop_core::provider::FinishReason;
use thinkloop_core::session::Session;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LoopState {
    Init,
    Planning,
    Executing,
    Observing,
    Compacting,
    Completed,
    Failed,
}

impl LoopState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "INIT",
            Self::Planning => "PLANNING",
            Self::Executing => "EXECUTING",
            Self::Observing => "OBSERVING",
            Self::Compacting => "COMPACTING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Whether the state machine may move from `self` to `next`.
    pub fn can_transition_to(&self, next: LoopState) -> bool {
        if next == LoopState::Failed {
            return !self.is_terminal();
        }
        match self {
            Self::Init => next == Self::Planning,
            Self::Planning => matches!(
                next,
                Self::Executing | Self::Compacting | Self::Completed
            ),
            Self::Executing => next == Self::Observing,
            Self::Observing => matches!(
                next,
                Self::Planning | Self::Compacting | Self::Completed
            ),
            Self::Compacting => next == Self::Planning,
            Self::Completed | Self::Failed => false,
        }
    }
}

impl Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mutable state of one loop run. Created at the start of a run and
/// dropped when it returns.
#[derive(Debug)]
pub struct AgentLoopContext {
    pub session: Session,
    pub state: LoopState,
    pub iteration: u32,
    pub max_iterations: u32,
    pub compact_threshold: usize,
    pub needs_compaction: bool,
    pub last_finish_reason: Option<FinishReason>,
    pub last_tool_call_count: usize,
    pub error: Option<Error>,
}

impl AgentLoopContext {
    pub fn new(session: Session, max_iterations: u32, compact_threshold: usize) -> Self {
        Self {
            session,
            state: LoopState::Init,
            iteration: 0,
            max_iterations,
            compact_threshold,
            needs_compaction: false,
            last_finish_reason: None,
            last_tool_call_count: 0,
            error: None,
        }
    }

    /// Messages to keep when compacting.
    pub fn compaction_target(&self) -> usize {
        self.compact_threshold * 7 / 10
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitions_follow_the_state_graph() {
        use LoopState::*;
        assert!(Init.can_transition_to(Planning));
        assert!(Planning.can_transition_to(Compacting));
        assert!(Observing.can_transition_to(Completed));
        assert!(Compacting.can_transition_to(Planning));
        assert!(Executing.can_transition_to(Failed));
        assert!(!Executing.can_transition_to(Planning));
        assert!(!Completed.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Planning));
    }

    #[test]
    fn compaction_target_is_seventy_percent_floored() {
        let ctx = AgentLoopContext::new(Session::new("s", "a"), 3, 4);
        assert_eq!(ctx.compaction_target(), 2);
        let ctx = AgentLoopContext::new(Session::new("s", "a"), 3, 40);
        assert_eq!(ctx.compaction_target(), 28);
    }

    #[test]
    fn state_serializes_screaming_case() {
        assert_eq!(
            serde_json::to_string(&LoopState::Compacting).unwrap(),
            r#""COMPACTING""#
        );
    }
}
