//! The agent loop state machine.
//!
//! ```text
//! INIT -> PLANNING -> EXECUTING -> OBSERVING -> { PLANNING | COMPACTING | COMPLETED }
//! COMPACTING -> PLANNING
//! any non-terminal state -> FAILED
//! ```
//!
//! One run owns one [`AgentLoopContext`]. Each state completes, including
//! its persistence call, before the next one starts. The session is saved
//! after every state that changed its messages and once more when the run
//! returns. The working session is also published through
//! [`SessionContext`] so nested calls (tools, sub-agents) can read it.

use async_trait::async_trait;
use std::sync::{Arc, Weak};
use thinkloop_config::LoopConfig;
use thinkloop_core::error::{Error, Result};
use thinkloop_core::message::Message;
use thinkloop_core::provider::{AbortSignal, InvokeOptions, ModelInvoker, PersonaConfig};
use thinkloop_core::runner::{LoopRequest, LoopResult, LoopRunner};
use thinkloop_core::session::Session;
use thinkloop_core::session_context::SessionContext;
use thinkloop_core::store::SessionStore;
use thinkloop_core::tool::{ToolRegistry, ToolSet};
use thinkloop_tools::SubAgentSettings;
use tracing::{debug, info, warn};

use crate::decision::{Decision, DecisionSignals, decide};
use crate::merge::process_result_to_session;
use crate::normalizer::ThinkMarkers;
use crate::observer::{LoopObserver, NoopObserver, Phase};
use crate::processor::Processor;
use crate::state::{AgentLoopContext, LoopState};

/// Per-run settings resolved at INIT.
struct RunSettings {
    execute_persona: PersonaConfig,
    compress_persona: PersonaConfig,
    tools: ToolSet,
    options: InvokeOptions,
}

/// The outer Plan/Execute/Observe/Compact loop.
pub struct AgentLoop {
    /// Session persistence
    store: Arc<dyn SessionStore>,

    /// Capabilities exposed to Execute
    tools: Arc<ToolRegistry>,

    /// Loop settings and the persona catalogue
    config: LoopConfig,

    /// Step functions
    processor: Processor,

    /// Informational hooks
    observer: Arc<dyn LoopObserver>,

    /// Cancellation flag handed to the model invoker
    abort: Option<AbortSignal>,
}

impl AgentLoop {
    /// Create a loop. Fails with a configuration error when the config is
    /// invalid (e.g. a phase names an unknown persona).
    pub fn new(
        invoker: Arc<dyn ModelInvoker>,
        store: Arc<dyn SessionStore>,
        tools: Arc<ToolRegistry>,
        config: LoopConfig,
    ) -> Result<Self> {
        config.validate()?;
        let processor = Processor::new(invoker, config.terminal_tool.clone())
            .with_markers(ThinkMarkers::new(&config.think_open, &config.think_close))
            .with_max_tool_steps(config.max_tool_steps);
        Ok(Self {
            store,
            tools,
            config,
            processor,
            observer: Arc::new(NoopObserver),
            abort: None,
        })
    }

    pub fn with_observer(mut self, observer: Arc<dyn LoopObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Publish tool executions on `bus`.
    pub fn with_event_bus(mut self, bus: Arc<thinkloop_core::event::EventBus>) -> Self {
        self.processor = self.processor.with_event_bus(bus);
        self
    }

    pub fn with_abort_signal(mut self, signal: AbortSignal) -> Self {
        self.abort = Some(signal);
        self
    }

    pub fn config(&self) -> &LoopConfig {
        &self.config
    }

    pub fn tools(&self) -> &Arc<ToolRegistry> {
        &self.tools
    }

    /// Register the sub-agent tool, bound to this loop.
    pub fn register_sub_agent(self: &Arc<Self>) -> Result<()> {
        let sub = &self.config.sub_agent;
        if self.config.persona(&sub.persona).is_none() {
            return Err(Error::config(format!(
                "sub-agent persona '{}' is not configured",
                sub.persona
            )));
        }
        let settings = SubAgentSettings {
            agent_name: sub.agent_name.clone(),
            persona: sub.persona.clone(),
            max_iterations: sub.max_iterations,
            tools: self.config.sub_agent_tools(),
            terminal_tool: self.config.terminal_tool.clone(),
        };
        let weak: Weak<AgentLoop> = Arc::downgrade(self);
        let runner: Weak<dyn LoopRunner> = weak;
        thinkloop_tools::register_sub_agent(&self.tools, runner, settings)?;
        Ok(())
    }

    /// Run the loop for one user message. Never returns `Err`; failures are
    /// reported in the result.
    pub async fn run(&self, request: LoopRequest) -> LoopResult {
        info!(
            session_id = %request.session_id,
            agent = %request.agent_name,
            "Starting agent loop"
        );
        self.observer
            .on_loop_start(&request.session_id, &request.agent_name);

        let ctx = AgentLoopContext::new(
            Session::new(&request.session_id, &request.agent_name),
            request.max_iterations.unwrap_or(self.config.max_iterations),
            self.config.compact_threshold,
        );
        let initial = ctx.session.clone();
        let ctx = SessionContext::run(initial, self.drive(&request, ctx)).await;
        self.finalize(ctx).await
    }

    async fn drive(&self, request: &LoopRequest, mut ctx: AgentLoopContext) -> AgentLoopContext {
        let mut run: Option<RunSettings> = None;

        while !ctx.state.is_terminal() {
            let outcome = match ctx.state {
                LoopState::Init => self.init(&mut ctx, request).await.map(|settings| {
                    run = Some(settings);
                    LoopState::Planning
                }),
                LoopState::Planning => match run.as_ref() {
                    Some(run) => self.planning(&mut ctx, run).await,
                    None => Err(missing_settings(ctx.state)),
                },
                LoopState::Executing => match run.as_ref() {
                    Some(run) => self.executing(&mut ctx, run).await,
                    None => Err(missing_settings(ctx.state)),
                },
                LoopState::Observing => Ok(self.observing(&mut ctx)),
                LoopState::Compacting => match run.as_ref() {
                    Some(run) => self.compacting(&mut ctx, run).await,
                    None => Err(missing_settings(ctx.state)),
                },
                LoopState::Completed | LoopState::Failed => break,
            };

            let next = match outcome {
                Ok(next) => next,
                Err(e) => {
                    warn!(
                        session_id = %ctx.session.id,
                        state = %ctx.state,
                        error = %e,
                        "Agent loop failed"
                    );
                    self.observer.on_error(&ctx.session.id, ctx.state, &e);
                    ctx.error = Some(e);
                    LoopState::Failed
                }
            };
            self.transition(&mut ctx, next);
        }
        ctx
    }

    /// INIT: resolve per-run settings, fetch or create the session, append
    /// the user message and persist.
    async fn init(&self, ctx: &mut AgentLoopContext, request: &LoopRequest) -> Result<RunSettings> {
        let persona_name = request
            .persona
            .as_deref()
            .unwrap_or(&self.config.phases.execute);
        let execute_persona = self.persona(persona_name)?.clone();
        let compress_persona = self.persona(&self.config.phases.compress)?.clone();

        let tools = match request.tool_names.as_ref().or(self.config.tools.as_ref()) {
            Some(names) => self.tools.get_by_names(names.as_slice()),
            None => self.tools.all(),
        };

        let session = self
            .store
            .get_or_create(&request.session_id, &request.agent_name)
            .await?;
        self.set_session(ctx, session.add_message(Message::user(&request.message)));
        self.persist(ctx).await?;

        debug!(
            session_id = %ctx.session.id,
            persona = %execute_persona.name,
            tools = ?tools,
            max_iterations = ctx.max_iterations,
            "Run initialized"
        );

        Ok(RunSettings {
            execute_persona,
            compress_persona,
            tools,
            options: InvokeOptions {
                max_retries: self.config.max_retries,
                timeout: self.config.timeout(),
                abort: self.abort.clone(),
            },
        })
    }

    /// PLANNING: budget check, compaction check, then plan or reason.
    async fn planning(&self, ctx: &mut AgentLoopContext, run: &RunSettings) -> Result<LoopState> {
        if ctx.iteration >= ctx.max_iterations {
            info!(
                session_id = %ctx.session.id,
                iterations = ctx.iteration,
                "Iteration budget reached"
            );
            return Ok(LoopState::Completed);
        }
        if ctx.session.len() >= ctx.compact_threshold {
            return Ok(LoopState::Compacting);
        }

        ctx.iteration += 1;
        self.observer
            .on_iteration_start(&ctx.session.id, ctx.iteration);
        debug!(session_id = %ctx.session.id, iteration = ctx.iteration, "Agent loop iteration");

        let (phase, persona_name) = if ctx.iteration == 1 {
            (Phase::Plan, &self.config.phases.plan)
        } else {
            (Phase::Reason, &self.config.phases.reason)
        };
        let persona = self.persona(persona_name)?;
        let handler = self.observer.stream_handler(phase);

        let result = match phase {
            Phase::Plan => {
                self.processor
                    .plan(persona, ctx.session.messages(), handler.as_ref(), &run.options)
                    .await?
            }
            _ => {
                self.processor
                    .reason(persona, ctx.session.messages(), handler.as_ref(), &run.options)
                    .await?
            }
        };

        let next = process_result_to_session(&ctx.session, &result);
        self.set_session(ctx, next);
        self.persist(ctx).await?;
        Ok(LoopState::Executing)
    }

    /// EXECUTING: the acting step with tools.
    async fn executing(&self, ctx: &mut AgentLoopContext, run: &RunSettings) -> Result<LoopState> {
        let handler = self.observer.stream_handler(Phase::Execute);
        let result = self
            .processor
            .execute(
                &run.execute_persona,
                ctx.session.messages(),
                &run.tools,
                handler.as_ref(),
                &run.options,
            )
            .await?;

        ctx.last_finish_reason = result.finish_reason;
        ctx.last_tool_call_count = result.tool_calls.len();

        let next = process_result_to_session(&ctx.session, &result);
        self.set_session(ctx, next);
        self.persist(ctx).await?;

        if let Some(limit) = self.config.max_context_tokens {
            let estimated = ctx.session.estimated_tokens();
            if estimated > limit {
                debug!(session_id = %ctx.session.id, estimated, limit, "Context over token budget");
                ctx.needs_compaction = true;
            }
        }

        debug!(
            session_id = %ctx.session.id,
            finish_reason = ?ctx.last_finish_reason,
            tool_calls = ctx.last_tool_call_count,
            "Execute step done"
        );
        Ok(LoopState::Observing)
    }

    /// OBSERVING: apply the decision policy.
    fn observing(&self, ctx: &mut AgentLoopContext) -> LoopState {
        let signals = DecisionSignals {
            needs_compaction: ctx.needs_compaction,
            message_count: ctx.session.len(),
            compact_threshold: ctx.compact_threshold,
            finish_reason: ctx.last_finish_reason,
        };
        let decision = decide(&signals, ctx.session.last_message());

        info!(
            session_id = %ctx.session.id,
            iteration = ctx.iteration,
            decision = %decision,
            "Decision"
        );
        self.observer
            .on_decision(&ctx.session.id, ctx.iteration, decision);
        self.observer
            .on_iteration_end(&ctx.session.id, ctx.iteration);

        match decision {
            Decision::Continue => LoopState::Planning,
            Decision::Compact => LoopState::Compacting,
            Decision::Stop => LoopState::Completed,
        }
    }

    /// COMPACTING: keep the most recent 70% of the threshold and persist.
    async fn compacting(&self, ctx: &mut AgentLoopContext, run: &RunSettings) -> Result<LoopState> {
        let keep = ctx.compaction_target();
        let before = ctx.session.len();
        let condensed = self
            .processor
            .compress(&run.compress_persona, ctx.session.messages(), ctx.compact_threshold)
            .await;
        if condensed.len() > before {
            return Err(Error::Compaction(format!(
                "compress step grew the history from {before} to {} messages",
                condensed.len()
            )));
        }
        let compacted = ctx.session.compress_messages(keep);
        if compacted.len() > keep {
            return Err(Error::Compaction(format!(
                "kept {} messages, expected at most {keep}",
                compacted.len()
            )));
        }

        self.set_session(ctx, compacted);
        self.persist(ctx)
            .await
            .map_err(|e| Error::Compaction(e.to_string()))?;
        ctx.needs_compaction = false;

        info!(
            session_id = %ctx.session.id,
            before,
            after = ctx.session.len(),
            "Session compacted"
        );
        Ok(LoopState::Planning)
    }

    /// COMPLETED/FAILED: record iterations, best-effort save, report.
    async fn finalize(&self, ctx: AgentLoopContext) -> LoopResult {
        let AgentLoopContext {
            session,
            state,
            iteration,
            error,
            ..
        } = ctx;
        let session = session.increment_iterations(iteration);

        // Nothing was loaded when the run failed before the session existed
        if !session.is_empty() {
            if let Err(e) = self.store.save(&session).await {
                warn!(session_id = %session.id, error = %e, "Failed to save session on exit");
            }
        }

        let result = LoopResult {
            success: state == LoopState::Completed,
            session,
            iterations: iteration,
            error,
        };
        info!(
            session_id = %result.session.id,
            success = result.success,
            iterations = result.iterations,
            messages = result.session.len(),
            "Agent loop finished"
        );
        self.observer.on_loop_end(&result);
        result
    }

    fn transition(&self, ctx: &mut AgentLoopContext, next: LoopState) {
        if !ctx.state.can_transition_to(next) {
            warn!(from = %ctx.state, to = %next, "Unexpected state transition");
        }
        debug!(session_id = %ctx.session.id, from = %ctx.state, to = %next, "State change");
        self.observer
            .on_state_change(&ctx.session.id, ctx.state, next);
        ctx.state = next;
    }

    fn set_session(&self, ctx: &mut AgentLoopContext, session: Session) {
        ctx.session = session;
        if let Err(e) = SessionContext::replace(ctx.session.clone()) {
            debug!(error = %e, "No session scope to update");
        }
    }

    async fn persist(&self, ctx: &AgentLoopContext) -> Result<()> {
        self.store.save(&ctx.session).await?;
        Ok(())
    }

    fn persona(&self, name: &str) -> Result<&PersonaConfig> {
        self.config
            .persona(name)
            .ok_or_else(|| Error::config(format!("unknown persona '{name}'")))
    }
}

fn missing_settings(state: LoopState) -> Error {
    Error::Internal(format!("state {state} reached before INIT resolved the run"))
}

#[async_trait]
impl LoopRunner for AgentLoop {
    async fn run_loop(&self, request: LoopRequest) -> LoopResult {
        self.run(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{ScriptedInvoker, finish, silent, text};
    use std::sync::Mutex;
    use thinkloop_core::error::StoreError;
    use thinkloop_core::provider::FinishReason;
    use thinkloop_store::InMemorySessionStore;
    use thinkloop_tools::default_registry;

    fn agent(script: Vec<Vec<thinkloop_core::provider::RawStreamEvent>>) -> (AgentLoop, Arc<ScriptedInvoker>) {
        let invoker = Arc::new(ScriptedInvoker::new(script));
        let tools = Arc::new(default_registry("finish_task").unwrap());
        let agent = AgentLoop::new(
            invoker.clone(),
            Arc::new(InMemorySessionStore::new()),
            tools,
            LoopConfig::default(),
        )
        .unwrap();
        (agent, invoker)
    }

    #[tokio::test]
    async fn plan_then_reason_personas() {
        let (agent, invoker) = agent(vec![
            silent(),
            vec![text("working"), finish(FinishReason::ToolCalls)],
            silent(),
            vec![text("done"), finish(FinishReason::Stop)],
        ]);
        let result = agent
            .run(LoopRequest::new("s1", "agent", "do it").with_max_iterations(3))
            .await;

        assert!(result.success);
        assert_eq!(result.iterations, 2);
        assert_eq!(
            invoker.personas(),
            vec!["planner", "executor", "reasoner", "executor"]
        );
        assert_eq!(result.session.metadata.total_iterations, 2);
    }

    #[tokio::test]
    async fn unknown_persona_override_fails_at_init() {
        let (agent, invoker) = agent(vec![]);
        let result = agent
            .run(LoopRequest::new("s1", "agent", "hi").with_persona("ghost"))
            .await;
        assert!(!result.success);
        assert!(matches!(result.error, Some(Error::Config { .. })));
        assert_eq!(invoker.calls(), 0);
    }

    #[tokio::test]
    async fn model_failure_fails_the_run_and_keeps_partial_session() {
        let invoker = Arc::new(ScriptedInvoker::failing());
        let store = Arc::new(InMemorySessionStore::new());
        let agent = AgentLoop::new(
            invoker,
            store.clone(),
            Arc::new(ToolRegistry::new()),
            LoopConfig::default(),
        )
        .unwrap();

        let result = agent.run(LoopRequest::new("s1", "agent", "hi")).await;
        assert!(!result.success);
        assert!(matches!(result.error, Some(Error::Model(_))));
        assert_eq!(result.messages().len(), 1);

        let saved = store.get("s1").await.unwrap().unwrap();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved.metadata.total_iterations, 1);
    }

    struct BrokenStore;

    #[async_trait]
    impl SessionStore for BrokenStore {
        fn name(&self) -> &str {
            "broken"
        }
        async fn get_or_create(&self, _id: &str, _agent: &str) -> std::result::Result<Session, StoreError> {
            Err(StoreError::Storage("disk gone".into()))
        }
        async fn save(&self, _session: &Session) -> std::result::Result<(), StoreError> {
            Err(StoreError::Storage("disk gone".into()))
        }
        async fn get(&self, _id: &str) -> std::result::Result<Option<Session>, StoreError> {
            Ok(None)
        }
    }

    #[tokio::test]
    async fn store_failure_at_init_is_reported() {
        let agent = AgentLoop::new(
            Arc::new(ScriptedInvoker::new(vec![])),
            Arc::new(BrokenStore),
            Arc::new(ToolRegistry::new()),
            LoopConfig::default(),
        )
        .unwrap();
        let result = agent.run(LoopRequest::new("s1", "agent", "hi")).await;
        assert!(!result.success);
        assert!(matches!(result.error, Some(Error::Store(_))));
        assert_eq!(result.iterations, 0);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = LoopConfig {
            max_iterations: 0,
            ..LoopConfig::default()
        };
        let err = AgentLoop::new(
            Arc::new(ScriptedInvoker::new(vec![])),
            Arc::new(InMemorySessionStore::new()),
            Arc::new(ToolRegistry::new()),
            config,
        )
        .err()
        .unwrap();
        assert!(matches!(err, Error::Config { .. }));
    }

    #[derive(Default)]
    struct StateLog(Mutex<Vec<(LoopState, LoopState)>>);

    impl LoopObserver for StateLog {
        fn on_state_change(&self, _session_id: &str, from: LoopState, to: LoopState) {
            self.0.lock().unwrap().push((from, to));
        }
    }

    #[tokio::test]
    async fn observer_sees_every_transition() {
        let (agent, _) = agent(vec![silent(), vec![text("hi"), finish(FinishReason::Stop)]]);
        let log = Arc::new(StateLog::default());
        let agent = agent.with_observer(log.clone());
        agent.run(LoopRequest::new("s1", "agent", "hello")).await;

        use LoopState::*;
        assert_eq!(
            *log.0.lock().unwrap(),
            vec![
                (Init, Planning),
                (Planning, Executing),
                (Executing, Observing),
                (Observing, Completed),
            ]
        );
    }

    #[tokio::test]
    async fn session_context_tracks_working_session() {
        use thinkloop_core::tool::{Tool, ToolOutput};
        use thinkloop_core::error::ToolError;

        struct Peek(Mutex<Option<usize>>);

        #[async_trait]
        impl Tool for Peek {
            fn name(&self) -> &str {
                "peek"
            }
            fn description(&self) -> &str {
                "Reports the current session size"
            }
            fn parameters_schema(&self) -> serde_json::Value {
                serde_json::json!({"type": "object"})
            }
            async fn execute(&self, _args: serde_json::Value) -> std::result::Result<ToolOutput, ToolError> {
                let len = SessionContext::current().unwrap().len();
                *self.0.lock().unwrap() = Some(len);
                Ok(ToolOutput::ok(len.to_string()))
            }
        }

        let peek = Arc::new(Peek(Mutex::new(None)));
        let registry = Arc::new(ToolRegistry::new());
        registry.register(peek.clone()).unwrap();
        let invoker = Arc::new(ScriptedInvoker::new(vec![
            vec![text("plan"), finish(FinishReason::Stop)],
            vec![
                crate::test_helpers::tool_call("c1", "peek", serde_json::json!({})),
                finish(FinishReason::ToolCalls),
            ],
            vec![text("ok"), finish(FinishReason::Stop)],
        ]));
        let agent = AgentLoop::new(
            invoker,
            Arc::new(InMemorySessionStore::new()),
            registry,
            LoopConfig::default(),
        )
        .unwrap();

        let result = agent
            .run(LoopRequest::new("s1", "agent", "look").with_max_iterations(1))
            .await;
        assert!(result.success);
        // user + plan were in the session when the tool ran
        assert_eq!(*peek.0.lock().unwrap(), Some(2));
    }

    #[test]
    fn register_sub_agent_binds_tool_to_this_loop() {
        let (agent, _invoker) = agent(vec![]);
        let agent = Arc::new(agent);
        agent.register_sub_agent().unwrap();

        let names = agent.tools().names();
        assert!(names.contains(&thinkloop_tools::SPAWN_SUB_AGENT.to_string()));
        assert!(names.contains(&"finish_task".to_string()));
    }

    #[tokio::test]
    async fn compaction_keeps_the_run_going() {
        let config = LoopConfig {
            compact_threshold: 2,
            max_iterations: 2,
            ..LoopConfig::default()
        };
        let invoker = Arc::new(ScriptedInvoker::new(vec![
            silent(),
            vec![text("first"), finish(FinishReason::ToolCalls)],
            silent(),
            vec![text("second"), finish(FinishReason::Stop)],
        ]));
        let agent = AgentLoop::new(
            invoker.clone(),
            Arc::new(InMemorySessionStore::new()),
            Arc::new(ToolRegistry::new()),
            config,
        )
        .unwrap();

        let result = agent.run(LoopRequest::new("s1", "agent", "hi")).await;
        assert!(result.success, "error: {:?}", result.error);
        assert!(result.session.metadata.last_compaction_at.is_some());
        assert_eq!(invoker.calls(), 4);
    }
}
