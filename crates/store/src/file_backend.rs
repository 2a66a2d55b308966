//! File-based session backend: one pretty-printed JSON file per session.
//!
//! Storage location: `~/.thinkloop/sessions/<session-id>.json`
//!
//! Writes go to a temporary sibling first and are renamed into place, so a
//! crash mid-write leaves the previous version readable.

use async_trait::async_trait;
use std::path::PathBuf;
use thinkloop_core::error::StoreError;
use thinkloop_core::session::Session;
use thinkloop_core::store::SessionStore;
use tracing::{debug, warn};

/// A directory of JSON session files.
pub struct FileSessionStore {
    dir: PathBuf,
}

impl FileSessionStore {
    /// Create a store rooted at `dir`. The directory is created on first save.
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    /// Default directory: `~/.thinkloop/sessions`
    pub fn default_dir() -> PathBuf {
        let home = std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string());
        PathBuf::from(home).join(".thinkloop").join("sessions")
    }

    /// Path of the file holding `session_id`.
    ///
    /// Bytes outside `[A-Za-z0-9-]` are written as `_XX` (uppercase hex), so
    /// ids cannot escape the directory and distinct ids never share a file.
    pub fn path_for(&self, session_id: &str) -> PathBuf {
        let mut file = String::with_capacity(session_id.len());
        for byte in session_id.bytes() {
            if byte.is_ascii_alphanumeric() || byte == b'-' {
                file.push(char::from(byte));
            } else {
                file.push_str(&format!("_{byte:02X}"));
            }
        }
        self.dir.join(format!("{file}.json"))
    }

    async fn read(&self, session_id: &str) -> Result<Option<Session>, StoreError> {
        let path = self.path_for(session_id);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(StoreError::Storage(format!(
                    "Failed to read {}: {e}",
                    path.display()
                )));
            }
        };

        match serde_json::from_str::<Session>(&content) {
            Ok(session) if session.id == session_id => Ok(Some(session)),
            Ok(session) => {
                warn!(session_id, stored_id = %session.id, "Session file belongs to another id");
                Err(StoreError::Corrupted(session_id.to_string()))
            }
            Err(e) => {
                warn!(session_id, error = %e, "Session file is corrupted");
                Err(StoreError::Corrupted(session_id.to_string()))
            }
        }
    }
}

#[async_trait]
impl SessionStore for FileSessionStore {
    fn name(&self) -> &str {
        "file"
    }

    async fn get_or_create(&self, session_id: &str, agent_name: &str) -> Result<Session, StoreError> {
        if let Some(session) = self.read(session_id).await? {
            return Ok(session);
        }
        let session = Session::new(session_id, agent_name);
        self.save(&session).await?;
        Ok(session)
    }

    async fn save(&self, session: &Session) -> Result<(), StoreError> {
        tokio::fs::create_dir_all(&self.dir).await.map_err(|e| {
            StoreError::Storage(format!("Failed to create session directory: {e}"))
        })?;

        let json = serde_json::to_string_pretty(session)
            .map_err(|e| StoreError::Encoding(e.to_string()))?;

        let path = self.path_for(&session.id);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json)
            .await
            .map_err(|e| StoreError::Storage(format!("Failed to write session file: {e}")))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| StoreError::Storage(format!("Failed to replace session file: {e}")))?;

        debug!(session_id = %session.id, messages = session.len(), "Session saved");
        Ok(())
    }

    async fn get(&self, session_id: &str) -> Result<Option<Session>, StoreError> {
        self.read(session_id).await
    }
}
