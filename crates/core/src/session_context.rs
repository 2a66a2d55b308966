//! Scoped "current session" for deeply nested async calls.
//!
//! Backed by a tokio task-local, so the value follows the future across
//! suspension points, nested scopes shadow outer ones, and unrelated call
//! trees (concurrent loop runs) never observe each other's session.

use std::cell::RefCell;
use std::future::Future;

use crate::error::ContextError;
use crate::session::Session;

tokio::task_local! {
    static CURRENT_SESSION: RefCell<Session>;
}

/// Access point for the session of the enclosing [`SessionContext::run`] scope.
pub struct SessionContext;

impl SessionContext {
    /// Run `fut` with `session` as the current session. The previous value
    /// (or none) is restored when the future completes, fails or is dropped.
    pub async fn run<F>(session: Session, fut: F) -> F::Output
    where
        F: Future,
    {
        CURRENT_SESSION.scope(RefCell::new(session), fut).await
    }

    /// The active session, or [`ContextError::NoActiveSession`] outside any scope.
    pub fn current() -> Result<Session, ContextError> {
        CURRENT_SESSION
            .try_with(|cell| cell.borrow().clone())
            .map_err(|_| ContextError::NoActiveSession)
    }

    /// The active session, if any.
    pub fn try_current() -> Option<Session> {
        CURRENT_SESSION.try_with(|cell| cell.borrow().clone()).ok()
    }

    /// Make `session` the current one for the rest of the innermost scope.
    pub fn replace(session: Session) -> Result<(), ContextError> {
        CURRENT_SESSION
            .try_with(|cell| {
                cell.replace(session);
            })
            .map_err(|_| ContextError::NoActiveSession)
    }
}
