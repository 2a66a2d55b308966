//! Sub-agent spawning: delegate a task to an isolated nested loop run.
//!
//! The nested run gets a fresh session id, its own iteration budget and a
//! synthesized first message that embeds the task and requires a call to
//! the terminal tool. Only a plain-data report travels back to the parent;
//! failures and panics inside the nested run are reported, never raised.
//!
//! The tool holds a `Weak` handle to the loop runner: the loop owns the
//! registry that owns this tool, so a strong handle would form a cycle.

use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::panic::AssertUnwindSafe;
use std::sync::Weak;
use thinkloop_core::error::ToolError;
use thinkloop_core::message::{ContentBlock, Message, Role};
use thinkloop_core::runner::{LoopRequest, LoopRunner};
use thinkloop_core::session_context::SessionContext;
use thinkloop_core::tool::{Tool, ToolOutput};
use tracing::{info, warn};
use uuid::Uuid;

pub const SPAWN_SUB_AGENT: &str = "spawn_sub_agent";

const NO_SUMMARY: &str = "Sub-agent finished without producing a summary.";

/// How nested runs are configured.
#[derive(Debug, Clone)]
pub struct SubAgentSettings {
    /// Agent name recorded on the nested session
    pub agent_name: String,
    /// Execute persona of the nested run
    pub persona: String,
    /// Iteration budget of the nested run
    pub max_iterations: u32,
    /// Tools exposed to the nested run
    pub tools: Vec<String>,
    /// Tool the nested run must call when done
    pub terminal_tool: String,
}

/// Outcome of a nested run as seen by the parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubAgentStatus {
    Completed,
    Failed,
    Crashed,
}

/// Plain-data report returned to the parent tool-call site.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubAgentReport {
    pub status: SubAgentStatus,
    pub session_id: String,
    pub summary: String,
    pub iterations: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub struct SpawnSubAgentTool {
    runner: Weak<dyn LoopRunner>,
    settings: SubAgentSettings,
}

impl SpawnSubAgentTool {
    pub fn new(runner: Weak<dyn LoopRunner>, settings: SubAgentSettings) -> Self {
        Self { runner, settings }
    }

    /// Build the first user message of the nested run.
    pub fn task_message(&self, task: &str, context: Option<&str>) -> String {
        let mut message = format!(
            "You are a sub-agent working on a delegated task.\n\n## Task\n{task}\n"
        );
        if let Some(context) = context.filter(|c| !c.trim().is_empty()) {
            message.push_str(&format!("\n## Context\n{context}\n"));
        }
        message.push_str(&format!(
            "\n## Requirements\n\
             - Work autonomously with the tools available to you.\n\
             - When you are done you MUST call the `{}` tool with a concise `summary` of the result.\n",
            self.settings.terminal_tool
        ));
        message
    }

    async fn spawn(&self, task: &str, context: Option<&str>) -> SubAgentReport {
        let session_id = format!("sub-{}", Uuid::new_v4());

        let Some(runner) = self.runner.upgrade() else {
            warn!(session_id = %session_id, "Loop runner is gone, cannot spawn sub-agent");
            return SubAgentReport {
                status: SubAgentStatus::Crashed,
                session_id,
                summary: NO_SUMMARY.into(),
                iterations: 0,
                error: Some("loop runner is no longer available".into()),
            };
        };

        let parent = SessionContext::try_current().map(|s| s.id);
        info!(
            parent = parent.as_deref().unwrap_or("-"),
            session_id = %session_id,
            persona = %self.settings.persona,
            max_iterations = self.settings.max_iterations,
            "Spawning sub-agent"
        );

        let request = LoopRequest::new(
            session_id.clone(),
            self.settings.agent_name.clone(),
            self.task_message(task, context),
        )
        .with_max_iterations(self.settings.max_iterations)
        .with_persona(self.settings.persona.clone())
        .with_tools(self.settings.tools.clone());

        match AssertUnwindSafe(runner.run_loop(request))
            .catch_unwind()
            .await
        {
            Ok(result) => {
                let summary = extract_summary(result.messages(), &self.settings.terminal_tool);
                let status = if result.success {
                    SubAgentStatus::Completed
                } else {
                    SubAgentStatus::Failed
                };
                SubAgentReport {
                    status,
                    session_id,
                    summary,
                    iterations: result.iterations,
                    error: result.error.map(|e| e.to_string()),
                }
            }
            Err(panic) => {
                let reason = panic_message(panic.as_ref());
                warn!(session_id = %session_id, reason = %reason, "Sub-agent crashed");
                SubAgentReport {
                    status: SubAgentStatus::Crashed,
                    session_id,
                    summary: NO_SUMMARY.into(),
                    iterations: 0,
                    error: Some(reason),
                }
            }
        }
    }
}

#[async_trait]
impl Tool for SpawnSubAgentTool {
    fn name(&self) -> &str {
        SPAWN_SUB_AGENT
    }

    fn description(&self) -> &str {
        "Delegate a self-contained task to a sub-agent that runs in an isolated session and returns a summary."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "task": {
                    "type": "string",
                    "description": "The instruction for the sub-agent"
                },
                "context": {
                    "type": "string",
                    "description": "Optional background the sub-agent needs"
                }
            },
            "required": ["task"]
        })
    }

    async fn execute(&self, args: serde_json::Value) -> Result<ToolOutput, ToolError> {
        let task = args["task"]
            .as_str()
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| ToolError::InvalidArguments("Missing 'task' argument".into()))?;
        let context = args["context"].as_str();

        let report = self.spawn(task, context).await;
        let data = serde_json::to_value(&report)
            .map_err(|e| ToolError::ExecutionFailed {
                tool_name: SPAWN_SUB_AGENT.into(),
                reason: e.to_string(),
            })?;
        let output = ToolOutput {
            success: report.status == SubAgentStatus::Completed,
            output: data.to_string(),
            data: None,
        };
        Ok(output.with_data(data))
    }
}

/// Pick the summary of a finished run: the terminal tool's `summary`
/// argument, else the last assistant text, else a generic notice.
pub fn extract_summary(messages: &[Message], terminal_tool: &str) -> String {
    let from_terminal = messages.iter().rev().find_map(|m| {
        m.blocks().iter().find_map(|b| match b {
            ContentBlock::ToolCall { name, args, .. } if name == terminal_tool => args["summary"]
                .as_str()
                .filter(|s| !s.trim().is_empty())
                .map(str::to_string),
            _ => None,
        })
    });
    if let Some(summary) = from_terminal {
        return summary;
    }

    messages
        .iter()
        .rev()
        .filter(|m| m.role == Role::Assistant)
        .map(|m| m.text())
        .find(|t| !t.trim().is_empty())
        .unwrap_or_else(|| NO_SUMMARY.to_string())
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "sub-agent panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use thinkloop_core::error::Error;
    use thinkloop_core::runner::LoopResult;
    use thinkloop_core::session::Session;

    enum Behaviour {
        Finish,
        TextOnly,
        Fail,
        Panic,
    }

    struct FakeRunner {
        behaviour: Behaviour,
        requests: Mutex<Vec<LoopRequest>>,
    }

    impl FakeRunner {
        fn new(behaviour: Behaviour) -> Arc<Self> {
            Arc::new(Self {
                behaviour,
                requests: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl LoopRunner for FakeRunner {
        async fn run_loop(&self, request: LoopRequest) -> LoopResult {
            self.requests.lock().unwrap().push(request.clone());
            let session = Session::new(&request.session_id, &request.agent_name)
                .add_message(Message::user(&request.message));
            match self.behaviour {
                Behaviour::Finish => LoopResult {
                    success: true,
                    session: session.add_messages(vec![
                        Message::assistant_blocks(vec![
                            ContentBlock::text("wrapping up"),
                            ContentBlock::ToolCall {
                                id: "c1".into(),
                                name: "finish_task".into(),
                                args: serde_json::json!({"summary": "found 3 files"}),
                            },
                        ]),
                        Message::tool_result("c1", "finish_task", "found 3 files", false),
                    ]),
                    iterations: 2,
                    error: None,
                },
                Behaviour::TextOnly => LoopResult {
                    success: true,
                    session: session.add_message(Message::assistant("plain answer")),
                    iterations: 1,
                    error: None,
                },
                Behaviour::Fail => LoopResult {
                    success: false,
                    session,
                    iterations: 1,
                    error: Some(Error::Internal("model unreachable".into())),
                },
                Behaviour::Panic => panic!("boom"),
            }
        }
    }

    fn settings() -> SubAgentSettings {
        SubAgentSettings {
            agent_name: "sub-agent".into(),
            persona: "executor".into(),
            max_iterations: 3,
            tools: vec!["finish_task".into()],
            terminal_tool: "finish_task".into(),
        }
    }

    fn tool_for(runner: &Arc<FakeRunner>) -> SpawnSubAgentTool {
        let weak: Weak<FakeRunner> = Arc::downgrade(runner);
        SpawnSubAgentTool::new(weak, settings())
    }

    async fn report_of(tool: &SpawnSubAgentTool) -> SubAgentReport {
        let out = tool
            .execute(serde_json::json!({"task": "count files", "context": "repo root"}))
            .await
            .unwrap();
        serde_json::from_value(out.data.unwrap()).unwrap()
    }

    #[tokio::test]
    async fn completed_run_prefers_terminal_summary() {
        let runner = FakeRunner::new(Behaviour::Finish);
        let report = report_of(&tool_for(&runner)).await;
        assert_eq!(report.status, SubAgentStatus::Completed);
        assert_eq!(report.summary, "found 3 files");
        assert_eq!(report.iterations, 2);

        let requests = runner.requests.lock().unwrap();
        let request = &requests[0];
        assert!(request.session_id.starts_with("sub-"));
        assert_eq!(request.max_iterations, Some(3));
        assert_eq!(request.persona.as_deref(), Some("executor"));
        assert!(request.message.contains("count files"));
        assert!(request.message.contains("repo root"));
        assert!(request.message.contains("`finish_task`"));
    }

    #[tokio::test]
    async fn falls_back_to_last_assistant_text() {
        let runner = FakeRunner::new(Behaviour::TextOnly);
        let report = report_of(&tool_for(&runner)).await;
        assert_eq!(report.summary, "plain answer");
    }

    #[tokio::test]
    async fn failed_run_is_reported() {
        let runner = FakeRunner::new(Behaviour::Fail);
        let report = report_of(&tool_for(&runner)).await;
        assert_eq!(report.status, SubAgentStatus::Failed);
        assert_eq!(report.summary, NO_SUMMARY);
        assert!(report.error.unwrap().contains("model unreachable"));
    }

    #[tokio::test]
    async fn panicking_run_is_crashed_not_raised() {
        let runner = FakeRunner::new(Behaviour::Panic);
        let tool = tool_for(&runner);
        let out = tool
            .execute(serde_json::json!({"task": "explode"}))
            .await
            .unwrap();
        assert!(!out.success);
        let report: SubAgentReport = serde_json::from_value(out.data.unwrap()).unwrap();
        assert_eq!(report.status, SubAgentStatus::Crashed);
        assert_eq!(report.error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn dropped_runner_is_crashed() {
        let runner = FakeRunner::new(Behaviour::Finish);
        let tool = tool_for(&runner);
        drop(runner);
        let report = report_of(&tool).await;
        assert_eq!(report.status, SubAgentStatus::Crashed);
    }

    #[tokio::test]
    async fn missing_task_is_invalid() {
        let runner = FakeRunner::new(Behaviour::Finish);
        let err = tool_for(&runner)
            .execute(serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments(_)));
    }

    #[test]
    fn summary_default_when_nothing_usable() {
        let messages = vec![Message::user("task")];
        assert_eq!(extract_summary(&messages, "finish_task"), NO_SUMMARY);
    }
}
