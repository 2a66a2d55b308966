//! # thinkloop core
//!
//! Domain types, traits, and error definitions for the thinkloop agent
//! orchestration core. Every collaborator of the agent loop (model
//! invocation, tools, persistence, sub-agent runs) is a trait here;
//! implementations live in their respective crates.
//!
//! ## Design Philosophy
//!
//! - Sessions are immutable values; every operation returns a new one.
//! - The "current session" is a task-scoped value, never a global.
//! - The tool registry is an explicit value injected where it is needed.

pub mod error;
pub mod event;
pub mod message;
pub mod provider;
pub mod runner;
pub mod session;
pub mod session_context;
pub mod store;
pub mod tool;

// Re-export key types at crate root for ergonomics
pub use error::{ContextError, Error, ModelError, Result, StoreError, ToolError};
pub use event::{DomainEvent, EventBus};
pub use message::{ContentBlock, Message, MessageContent, Role};
pub use provider::{
    AbortSignal, FinishReason, InvokeOptions, ModelInvoker, PersonaConfig, RawStream,
    RawStreamEvent, ToolDefinition, Usage,
};
pub use runner::{LoopRequest, LoopResult, LoopRunner};
pub use session::{Session, SessionMetadata};
pub use session_context::SessionContext;
pub use store::SessionStore;
pub use tool::{Tool, ToolCall, ToolOutput, ToolRegistry, ToolResult, ToolSet};
