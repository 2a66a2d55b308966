//! Terminal tool: the model calls it to declare the task complete.
//!
//! The tool itself only echoes the summary back; what makes it terminal is
//! the processor, which stops the Execute step as soon as it sees a call to
//! this name.

use async_trait::async_trait;
use thinkloop_core::error::ToolError;
use thinkloop_core::tool::{Tool, ToolOutput};

pub const FINISH_TASK: &str = "finish_task";

pub struct FinishTaskTool {
    name: String,
}

impl FinishTaskTool {
    pub fn new() -> Self {
        Self::named(FINISH_TASK)
    }

    /// Register the terminal tool under a configured name.
    pub fn named(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Default for FinishTaskTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for FinishTaskTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Declare the task complete. Call this exactly once, after all work is done, with a concise summary of the outcome."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "summary": {
                    "type": "string",
                    "description": "What was accomplished and the final answer"
                }
            },
            "required": ["summary"]
        })
    }

    async fn execute(&self, args: serde_json::Value) -> Result<ToolOutput, ToolError> {
        let summary = args["summary"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidArguments("Missing 'summary' argument".into()))?;
        Ok(ToolOutput::ok(summary).with_data(serde_json::json!({ "summary": summary })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn echoes_summary() {
        let out = FinishTaskTool::new()
            .execute(serde_json::json!({"summary": "all done"}))
            .await
            .unwrap();
        assert!(out.success);
        assert_eq!(out.output, "all done");
    }

    #[tokio::test]
    async fn missing_summary_is_invalid() {
        let err = FinishTaskTool::new()
            .execute(serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments(_)));
    }

    #[test]
    fn custom_name() {
        assert_eq!(FinishTaskTool::named("done").name(), "done");
    }
}
