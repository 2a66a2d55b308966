//! Session persistence contract.
//!
//! The storage medium is up to the implementation (memory, file, database);
//! the agent loop only relies on these three operations.

use async_trait::async_trait;

use crate::error::StoreError;
use crate::session::Session;

/// The session persistence collaborator.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// The backend name (e.g., "in_memory", "file").
    fn name(&self) -> &str;

    /// Fetch the session with `session_id`, or create (and store) an empty one.
    async fn get_or_create(
        &self,
        session_id: &str,
        agent_name: &str,
    ) -> std::result::Result<Session, StoreError>;

    /// Durably save `session`, replacing any previous version.
    async fn save(&self, session: &Session) -> std::result::Result<(), StoreError>;

    /// Fetch a session by id.
    async fn get(&self, session_id: &str) -> std::result::Result<Option<Session>, StoreError>;
}
