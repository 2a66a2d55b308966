//! Loop-runner capability.
//!
//! The sub-agent tool needs to start a nested agent loop, and the agent loop
//! needs the tool registry. Tools depend on this trait instead of on the
//! agent crate; the agent loop implements it and is injected at wiring time.

use async_trait::async_trait;

use crate::error::Error;
use crate::message::Message;
use crate::session::Session;

/// Input of one loop run.
#[derive(Debug, Clone, PartialEq)]
pub struct LoopRequest {
    pub session_id: String,
    pub agent_name: String,
    /// The new user message appended at INIT.
    pub message: String,
    /// Overrides the configured iteration budget.
    pub max_iterations: Option<u32>,
    /// Overrides the Execute persona.
    pub persona: Option<String>,
    /// Overrides the tool names exposed to Execute.
    pub tool_names: Option<Vec<String>>,
}

impl LoopRequest {
    pub fn new(
        session_id: impl Into<String>,
        agent_name: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            agent_name: agent_name.into(),
            message: message.into(),
            max_iterations: None,
            persona: None,
            tool_names: None,
        }
    }

    pub fn with_max_iterations(mut self, max: u32) -> Self {
        self.max_iterations = Some(max);
        self
    }

    pub fn with_persona(mut self, persona: impl Into<String>) -> Self {
        self.persona = Some(persona.into());
        self
    }

    pub fn with_tools(mut self, names: Vec<String>) -> Self {
        self.tool_names = Some(names);
        self
    }
}

/// Structured outcome of one loop run. Runs never return `Err`; failures are
/// reported through `success = false` and `error`.
#[derive(Debug)]
pub struct LoopResult {
    pub success: bool,
    pub session: Session,
    pub iterations: u32,
    pub error: Option<Error>,
}

impl LoopResult {
    /// The final message history.
    pub fn messages(&self) -> &[Message] {
        self.session.messages()
    }
}

/// Something that can run a full agent loop.
#[async_trait]
pub trait LoopRunner: Send + Sync {
    async fn run_loop(&self, request: LoopRequest) -> LoopResult;
}
