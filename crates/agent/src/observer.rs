//! Loop observer hooks.
//!
//! Observers are informational only: they cannot alter control flow, and
//! their return values are never consulted. Streaming callbacks for the
//! plan, reason and execute phases come from [`LoopObserver::stream_handler`].

use std::sync::Arc;
use thinkloop_core::error::Error;
use thinkloop_core::event::{DomainEvent, EventBus};
use thinkloop_core::runner::LoopResult;

use crate::decision::Decision;
use crate::dispatcher::{NoopHandler, StreamHandler};
use crate::state::LoopState;

/// Which processor step a stream belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Plan,
    Reason,
    Execute,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Plan => "plan",
            Self::Reason => "reason",
            Self::Execute => "execute",
        }
    }
}

#[allow(unused_variables)]
pub trait LoopObserver: Send + Sync {
    fn on_loop_start(&self, session_id: &str, agent_name: &str) {}
    fn on_state_change(&self, session_id: &str, from: LoopState, to: LoopState) {}
    fn on_iteration_start(&self, session_id: &str, iteration: u32) {}
    fn on_iteration_end(&self, session_id: &str, iteration: u32) {}
    fn on_decision(&self, session_id: &str, iteration: u32, decision: Decision) {}
    fn on_loop_end(&self, result: &LoopResult) {}
    fn on_error(&self, session_id: &str, state: LoopState, error: &Error) {}

    /// Streaming callbacks for one processor phase.
    fn stream_handler(&self, phase: Phase) -> Arc<dyn StreamHandler> {
        Arc::new(NoopHandler)
    }
}

/// Observer that ignores everything.
pub struct NoopObserver;

impl LoopObserver for NoopObserver {}

/// Bridges loop hooks onto the domain [`EventBus`].
pub struct EventBusObserver {
    bus: Arc<EventBus>,
}

impl EventBusObserver {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self { bus }
    }
}

impl LoopObserver for EventBusObserver {
    fn on_loop_start(&self, session_id: &str, agent_name: &str) {
        self.bus.publish(DomainEvent::LoopStarted {
            session_id: session_id.to_string(),
            agent_name: agent_name.to_string(),
            timestamp: chrono::Utc::now(),
        });
    }

    fn on_state_change(&self, session_id: &str, from: LoopState, to: LoopState) {
        self.bus.publish(DomainEvent::StateChanged {
            session_id: session_id.to_string(),
            from: from.to_string(),
            to: to.to_string(),
            timestamp: chrono::Utc::now(),
        });
    }

    fn on_loop_end(&self, result: &LoopResult) {
        self.bus.publish(DomainEvent::LoopFinished {
            session_id: result.session.id.clone(),
            success: result.success,
            iterations: result.iterations,
            timestamp: chrono::Utc::now(),
        });
    }

    fn on_error(&self, session_id: &str, state: LoopState, error: &Error) {
        self.bus.publish(DomainEvent::ErrorOccurred {
            context: format!("{session_id}:{state}"),
            error_message: error.to_string(),
            timestamp: chrono::Utc::now(),
        });
    }
}

/// Fans every hook out to several observers in order.
#[derive(Default)]
pub struct CompositeObserver {
    observers: Vec<Arc<dyn LoopObserver>>,
}

impl CompositeObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, observer: Arc<dyn LoopObserver>) -> Self {
        self.observers.push(observer);
        self
    }
}

impl LoopObserver for CompositeObserver {
    fn on_loop_start(&self, session_id: &str, agent_name: &str) {
        self.observers
            .iter()
            .for_each(|o| o.on_loop_start(session_id, agent_name));
    }

    fn on_state_change(&self, session_id: &str, from: LoopState, to: LoopState) {
        self.observers
            .iter()
            .for_each(|o| o.on_state_change(session_id, from, to));
    }

    fn on_iteration_start(&self, session_id: &str, iteration: u32) {
        self.observers
            .iter()
            .for_each(|o| o.on_iteration_start(session_id, iteration));
    }

    fn on_iteration_end(&self, session_id: &str, iteration: u32) {
        self.observers
            .iter()
            .for_each(|o| o.on_iteration_end(session_id, iteration));
    }

    fn on_decision(&self, session_id: &str, iteration: u32, decision: Decision) {
        self.observers
            .iter()
            .for_each(|o| o.on_decision(session_id, iteration, decision));
    }

    fn on_loop_end(&self, result: &LoopResult) {
        self.observers.iter().for_each(|o| o.on_loop_end(result));
    }

    fn on_error(&self, session_id: &str, state: LoopState, error: &Error) {
        self.observers
            .iter()
            .for_each(|o| o.on_error(session_id, state, error));
    }

    /// The first observer's handler; streaming has a single consumer.
    fn stream_handler(&self, phase: Phase) -> Arc<dyn StreamHandler> {
        match self.observers.first() {
            Some(o) => o.stream_handler(phase),
            None => Arc::new(NoopHandler),
        }
    }
}
