//! Session lifecycle and persistence.
//!
//! A [`Session`] owns one [`Conversation`] plus metadata. The
//! [`SessionManager`] persists each session as a single JSON document under
//! `<working_dir>/.coda/sessions/<id>.json`, written atomically
//! (temp file + rename) so a crash mid-write never corrupts an existing
//! record. The agent loop persists at turn boundaries only, so a crash
//! mid-turn loses at most the in-flight turn.

use crate::conversation::Conversation;
use crate::error::AgentError;
use crate::types::{ModelConfig, SessionId};
use log::warn;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use time::OffsetDateTime;

const SESSIONS_SUBDIR: &str = ".coda/sessions";

/// One conversation plus its metadata.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub working_dir: PathBuf,
    pub model: ModelConfig,
    pub conversation: Conversation,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// Lightweight listing entry, cheap enough for a session picker.
#[derive(Clone, Debug)]
pub struct SessionSummary {
    pub id: SessionId,
    pub updated_at: OffsetDateTime,
    pub message_count: usize,
}

/// Creates, persists, and resumes sessions for one working directory.
#[derive(Clone, Debug)]
pub struct SessionManager {
    working_dir: PathBuf,
}

impl SessionManager {
    #[must_use]
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: working_dir.into(),
        }
    }

    fn sessions_dir(&self) -> PathBuf {
        self.working_dir.join(SESSIONS_SUBDIR)
    }

    fn session_path(&self, id: &SessionId) -> PathBuf {
        self.sessions_dir().join(format!("{id}.json"))
    }

    /// Create a fresh session. Nothing is written until [`Self::persist`].
    #[must_use]
    pub fn create(&self, model: ModelConfig) -> Session {
        let now = OffsetDateTime::now_utc();
        Session {
            id: SessionId::new(),
            working_dir: self.working_dir.clone(),
            model,
            conversation: Conversation::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Write the session record durably.
    ///
    /// # Errors
    /// Returns [`AgentError::Persistence`] on any I/O or encoding failure.
    /// The in-memory session is never modified on failure.
    pub async fn persist(&self, session: &mut Session) -> Result<(), AgentError> {
        session.updated_at = OffsetDateTime::now_utc();

        let dir = self.sessions_dir();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| AgentError::Persistence(format!("create {}: {e}", dir.display())))?;

        let body = serde_json::to_vec_pretty(session)
            .map_err(|e| AgentError::Persistence(format!("encode session {}: {e}", session.id)))?;

        let path = self.session_path(&session.id);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &body)
            .await
            .map_err(|e| AgentError::Persistence(format!("write {}: {e}", tmp.display())))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| AgentError::Persistence(format!("rename {}: {e}", path.display())))?;
        Ok(())
    }

    /// Load a session by id.
    ///
    /// A missing or unreadable record both resolve to
    /// [`AgentError::SessionNotFound`]: a corrupt file cannot reconstruct
    /// conversation state exactly, which is the contract of resume.
    ///
    /// # Errors
    /// Returns [`AgentError::SessionNotFound`] as above.
    pub async fn resume(&self, id: &SessionId) -> Result<Session, AgentError> {
        let path = self.session_path(id);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("session {id} unreadable at {}: {e}", path.display());
                return Err(AgentError::SessionNotFound { id: id.clone() });
            }
        };
        match serde_json::from_slice::<Session>(&bytes) {
            Ok(session) => Ok(session),
            Err(e) => {
                warn!("session {id} corrupted: {e}");
                Err(AgentError::SessionNotFound { id: id.clone() })
            }
        }
    }

    /// List stored sessions, most recently updated first. Unreadable
    /// entries are skipped with a warning rather than failing the listing.
    pub async fn list(&self) -> Vec<SessionSummary> {
        let dir = self.sessions_dir();
        let Ok(mut entries) = tokio::fs::read_dir(&dir).await else {
            return Vec::new();
        };

        let mut summaries = Vec::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match read_summary(&path).await {
                Ok(summary) => summaries.push(summary),
                Err(e) => warn!("skipping session file {}: {e}", path.display()),
            }
        }
        summaries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        summaries
    }

    /// Resume the most recently updated session, if any.
    ///
    /// # Errors
    /// Propagates [`AgentError::SessionNotFound`] if the newest record
    /// disappears between listing and loading.
    pub async fn latest(&self) -> Result<Option<Session>, AgentError> {
        match self.list().await.first() {
            Some(summary) => self.resume(&summary.id).await.map(Some),
            None => Ok(None),
        }
    }
}

async fn read_summary(path: &Path) -> anyhow::Result<SessionSummary> {
    let bytes = tokio::fs::read(path).await?;
    let session: Session = serde_json::from_slice(&bytes)?;
    Ok(SessionSummary {
        id: session.id,
        updated_at: session.updated_at,
        message_count: session.conversation.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::Message;

    fn model() -> ModelConfig {
        ModelConfig::new("anthropic", "claude-sonnet-4-5-20250929")
    }

    #[tokio::test]
    async fn persist_and_resume_roundtrip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manager = SessionManager::new(dir.path());

        let mut session = manager.create(model());
        session.conversation.append(Message::user("hello"));
        session.conversation.append(Message::assistant("hi"));
        manager.persist(&mut session).await.expect("persist");

        let restored = manager.resume(&session.id).await.expect("resume");
        assert_eq!(restored.id, session.id);
        assert_eq!(restored.conversation.len(), 2);
        assert_eq!(restored.model.model, session.model.model);
        assert_eq!(
            restored.conversation.snapshot()[0].text().as_deref(),
            Some("hello")
        );
    }

    #[tokio::test]
    async fn resume_missing_session_is_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manager = SessionManager::new(dir.path());

        let id = SessionId::new();
        let err = manager.resume(&id).await.expect_err("missing");
        assert!(matches!(err, AgentError::SessionNotFound { id: found } if found == id));
    }

    #[tokio::test]
    async fn corrupt_record_is_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manager = SessionManager::new(dir.path());

        let id = SessionId::new();
        let sessions = dir.path().join(SESSIONS_SUBDIR);
        tokio::fs::create_dir_all(&sessions).await.expect("mkdir");
        tokio::fs::write(sessions.join(format!("{id}.json")), b"{ not json")
            .await
            .expect("write");

        let err = manager.resume(&id).await.expect_err("corrupt");
        assert!(matches!(err, AgentError::SessionNotFound { .. }));
    }

    #[tokio::test]
    async fn list_orders_by_recency_and_skips_garbage() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manager = SessionManager::new(dir.path());

        let mut first = manager.create(model());
        first.conversation.append(Message::user("one"));
        manager.persist(&mut first).await.expect("persist");

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        let mut second = manager.create(model());
        second.conversation.append(Message::user("two"));
        second.conversation.append(Message::assistant("ok"));
        manager.persist(&mut second).await.expect("persist");

        tokio::fs::write(dir.path().join(SESSIONS_SUBDIR).join("junk.json"), b"???")
            .await
            .expect("write junk");

        let listed = manager.list().await;
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, second.id);
        assert_eq!(listed[0].message_count, 2);
        assert_eq!(listed[1].id, first.id);
    }

    #[tokio::test]
    async fn latest_resumes_newest() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manager = SessionManager::new(dir.path());

        assert!(manager.latest().await.expect("empty latest").is_none());

        let mut session = manager.create(model());
        session.conversation.append(Message::user("hi"));
        manager.persist(&mut session).await.expect("persist");

        let found = manager.latest().await.expect("latest").expect("some");
        assert_eq!(found.id, session.id);
    }

    #[tokio::test]
    async fn repeated_persist_overwrites_in_place() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manager = SessionManager::new(dir.path());

        let mut session = manager.create(model());
        session.conversation.append(Message::user("v1"));
        manager.persist(&mut session).await.expect("persist");
        session.conversation.append(Message::assistant("v2"));
        manager.persist(&mut session).await.expect("persist again");

        let restored = manager.resume(&session.id).await.expect("resume");
        assert_eq!(restored.conversation.len(), 2);
        assert_eq!(manager.list().await.len(), 1);
    }
}
