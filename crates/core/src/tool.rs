//! Tool trait: the abstraction over agent capabilities.
//!
//! Tools are registered in a [`ToolRegistry`] owned by whoever wires the
//! loop together, and a per-run [`ToolSet`] is selected from it by name.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};

use crate::error::ToolError;
use crate::provider::ToolDefinition;

/// A tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Unique call ID (matches the model's tool call id)
    pub id: String,

    /// Name of the tool to execute
    pub name: String,

    /// Arguments as a JSON value
    pub args: serde_json::Value,
}

/// The outcome of one tool call as recorded in a step result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub tool_call_id: String,
    pub tool_name: String,
    pub content: String,
    pub is_error: bool,
}

impl ToolResult {
    pub fn error(call: &ToolCall, message: impl Into<String>) -> Self {
        Self {
            tool_call_id: call.id.clone(),
            tool_name: call.name.clone(),
            content: message.into(),
            is_error: true,
        }
    }
}

/// What a tool returns from [`Tool::execute`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolOutput {
    /// Whether the tool executed successfully
    pub success: bool,

    /// The output content
    pub output: String,

    /// Optional structured data
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl ToolOutput {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            data: None,
        }
    }

    pub fn failure(output: impl Into<String>) -> Self {
        Self {
            success: false,
            output: output.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// The core Tool trait.
#[async_trait]
pub trait Tool: Send + Sync {
    /// The unique name of this tool (e.g., "finish_task").
    fn name(&self) -> &str;

    /// A description of what this tool does (sent to the model).
    fn description(&self) -> &str;

    /// JSON Schema describing this tool's parameters.
    fn parameters_schema(&self) -> serde_json::Value;

    /// Execute the tool with the given arguments.
    async fn execute(&self, args: serde_json::Value) -> std::result::Result<ToolOutput, ToolError>;

    /// Convert this tool into a ToolDefinition for sending to the model.
    fn to_definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters_schema(),
        }
    }
}

/// Name → capability map.
///
/// Registration is possible through a shared reference so the registry can
/// be handed out as `Arc<ToolRegistry>` before every tool exists (the
/// sub-agent tool needs the loop, which needs the registry). Once
/// [`ToolRegistry::lock`] is called, `register`/`unregister` are refused
/// until [`ToolRegistry::unlock`].
#[derive(Default)]
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, Arc<dyn Tool>>>,
    locked: AtomicBool,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool. Replaces any existing tool with the same name.
    pub fn register(&self, tool: Arc<dyn Tool>) -> std::result::Result<(), ToolError> {
        let name = tool.name().to_string();
        if self.is_locked() {
            return Err(ToolError::RegistryLocked(name));
        }
        debug!(tool = %name, "Registering tool");
        self.tools
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name, tool);
        Ok(())
    }

    /// Remove a tool, returning it if it was present.
    pub fn unregister(&self, name: &str) -> std::result::Result<Option<Arc<dyn Tool>>, ToolError> {
        if self.is_locked() {
            return Err(ToolError::RegistryLocked(name.to_string()));
        }
        Ok(self
            .tools
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(name))
    }

    pub fn lock(&self) {
        self.locked.store(true, Ordering::SeqCst);
    }

    pub fn unlock(&self) {
        self.locked.store(false, Ordering::SeqCst);
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::SeqCst)
    }

    /// Get a tool by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }

    /// Select tools by name. Unknown names are skipped with a warning.
    pub fn get_by_names<S: AsRef<str>>(&self, names: &[S]) -> ToolSet {
        let tools = self.tools.read().unwrap_or_else(|e| e.into_inner());
        let mut selected = Vec::with_capacity(names.len());
        for name in names {
            let name = name.as_ref();
            match tools.get(name) {
                Some(tool) => selected.push(tool.clone()),
                None => warn!(tool = %name, "Unknown tool requested, skipping"),
            }
        }
        ToolSet::new(selected)
    }

    /// Every registered tool, ordered by name.
    pub fn all(&self) -> ToolSet {
        let tools = self.tools.read().unwrap_or_else(|e| e.into_inner());
        let mut selected: Vec<_> = tools.values().cloned().collect();
        selected.sort_by(|a, b| a.name().cmp(b.name()));
        ToolSet::new(selected)
    }

    /// List all registered tool names.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .tools
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}

/// The tools exposed to one Execute step.
#[derive(Clone, Default)]
pub struct ToolSet {
    tools: Vec<Arc<dyn Tool>>,
}

impl ToolSet {
    pub fn new(tools: Vec<Arc<dyn Tool>>) -> Self {
        Self { tools }
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.iter().find(|t| t.name() == name)
    }

    /// Tool definitions for sending to the model.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.iter().map(|t| t.to_definition()).collect()
    }

    pub fn names(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl std::fmt::Debug for ToolSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}
