//! Built-in tool implementations for thinkloop.
//!
//! Two capabilities ship with the core: the terminal tool the model calls to
//! declare a task complete, and the sub-agent tool that delegates a task to
//! a nested, isolated loop run.

pub mod finish_task;
pub mod spawn_sub_agent;

use std::sync::{Arc, Weak};
use thinkloop_core::error::ToolError;
use thinkloop_core::runner::LoopRunner;
use thinkloop_core::tool::ToolRegistry;

pub use finish_task::{FINISH_TASK, FinishTaskTool};
pub use spawn_sub_agent::{
    SPAWN_SUB_AGENT, SpawnSubAgentTool, SubAgentReport, SubAgentSettings, SubAgentStatus,
    extract_summary,
};

/// Create a registry holding the terminal tool under `terminal_tool`.
///
/// The sub-agent tool is added later with [`register_sub_agent`], once the
/// loop that will run nested tasks exists.
pub fn default_registry(terminal_tool: &str) -> Result<ToolRegistry, ToolError> {
    let registry = ToolRegistry::new();
    registry.register(Arc::new(FinishTaskTool::named(terminal_tool)))?;
    Ok(registry)
}

/// Register the sub-agent tool, bound to `runner`.
pub fn register_sub_agent(
    registry: &ToolRegistry,
    runner: Weak<dyn LoopRunner>,
    settings: SubAgentSettings,
) -> Result<(), ToolError> {
    registry.register(Arc::new(SpawnSubAgentTool::new(runner, settings)))
}
