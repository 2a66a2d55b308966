//! The agent loop: the heart of thinkloop.
//!
//! The loop follows a **Plan → Execute → Observe → (Compact)** cycle:
//!
//! 1. **Init**: fetch or create the session and append the user message
//! 2. **Plan / Reason**: whole-task planning on the first iteration,
//!    observation-driven reasoning afterwards (no tools)
//! 3. **Execute**: call the model with tools, run the tools it asks for,
//!    repeat up to the step cap or until the terminal tool is called
//! 4. **Observe**: the decision policy picks continue, compact or stop
//! 5. **Compact**: trim the history to the most recent messages
//!
//! Model output is normalized into one canonical event vocabulary
//! ([`StreamEvent`]) before anything else sees it.

pub mod decision;
pub mod dispatcher;
pub mod loop_runner;
pub mod merge;
pub mod normalizer;
pub mod observer;
pub mod processor;
pub mod state;
pub mod stream_event;
#[cfg(any(test, feature = "test-util"))]
pub mod test_helpers;

pub use decision::{Decision, DecisionSignals, decide};
pub use dispatcher::{NoopHandler, StreamDispatcher, StreamHandler, StreamSummary};
pub use loop_runner::AgentLoop;
pub use merge::process_result_to_session;
pub use normalizer::{StreamNormalizer, ThinkMarkers, normalize};
pub use observer::{CompositeObserver, EventBusObserver, LoopObserver, NoopObserver, Phase};
pub use processor::{Processor, ProcessorStepResult};
pub use state::{AgentLoopContext, LoopState};
pub use stream_event::StreamEvent;
