//! Read and complete consultation records.
//!
//! The call coordinator owns exactly one write: `CONFIRMED -> COMPLETED`.
//! Everything else about a session belongs to the booking workflow.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use diesel::prelude::*;
use parking_lot::Mutex;

use crate::db::pool::DbPool;
use crate::db::schema::consultation_sessions;
use crate::error::DirectoryError;
use crate::models::session::{SessionRecord, SessionRow, SessionStatus};

/// Result of a completion attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionOutcome {
    /// This call moved the session from CONFIRMED to COMPLETED.
    Completed,
    /// Another call got there first.
    AlreadyCompleted,
    /// The session is PENDING or CANCELLED and was left alone.
    NotCompletable(SessionStatus),
    NotFound,
}

impl CompletionOutcome {
    pub fn is_already_completed(&self) -> bool {
        matches!(self, Self::AlreadyCompleted)
    }
}

/// Access to the authoritative consultation record.
#[async_trait]
pub trait SessionDirectory: Send + Sync {
    async fn find_by_id(&self, session_id: &str) -> Result<Option<SessionRecord>, DirectoryError>;

    async fn resolve(&self, room_token: &str) -> Result<Option<SessionRecord>, DirectoryError>;

    /// Conditionally complete a session. Safe to call concurrently and
    /// repeatedly; at most one call ever observes `Completed`.
    async fn mark_completed(&self, session_id: &str) -> Result<CompletionOutcome, DirectoryError>;
}

// ---------------------------------------------------------------------------
// Postgres implementation
// ---------------------------------------------------------------------------

pub struct PgSessionDirectory {
    db: DbPool,
}

impl PgSessionDirectory {
    pub fn new(db: DbPool) -> Self {
        Self { db }
    }
}

fn into_record(row: SessionRow) -> Result<SessionRecord, DirectoryError> {
    let session_id = row.id.clone();
    SessionRecord::try_from(row).map_err(|e| DirectoryError::Corrupt {
        session_id,
        status: e.0,
    })
}

#[async_trait]
impl SessionDirectory for PgSessionDirectory {
    async fn find_by_id(&self, session_id: &str) -> Result<Option<SessionRecord>, DirectoryError> {
        let mut conn = self.db.get().await?;
        let row: Option<SessionRow> = diesel_async::RunQueryDsl::get_result(
            consultation_sessions::table
                .find(session_id)
                .select(SessionRow::as_select()),
            &mut conn,
        )
        .await
        .optional()?;

        row.map(into_record).transpose()
    }

    async fn resolve(&self, room_token: &str) -> Result<Option<SessionRecord>, DirectoryError> {
        let mut conn = self.db.get().await?;
        let row: Option<SessionRow> = diesel_async::RunQueryDsl::get_result(
            consultation_sessions::table
                .filter(consultation_sessions::room_token.eq(room_token))
                .select(SessionRow::as_select()),
            &mut conn,
        )
        .await
        .optional()?;

        row.map(into_record).transpose()
    }

    async fn mark_completed(&self, session_id: &str) -> Result<CompletionOutcome, DirectoryError> {
        let mut conn = self.db.get().await?;
        let now = Utc::now();

        // Single conditional write; the status predicate makes it idempotent.
        let updated = diesel_async::RunQueryDsl::execute(
            diesel::update(
                consultation_sessions::table
                    .find(session_id)
                    .filter(consultation_sessions::status.eq(SessionStatus::Confirmed.as_str())),
            )
            .set((
                consultation_sessions::status.eq(SessionStatus::Completed.as_str()),
                consultation_sessions::completed_at.eq(Some(now)),
                consultation_sessions::updated_at.eq(now),
            )),
            &mut conn,
        )
        .await?;

        if updated == 1 {
            return Ok(CompletionOutcome::Completed);
        }

        let status: Option<String> = diesel_async::RunQueryDsl::get_result(
            consultation_sessions::table
                .find(session_id)
                .select(consultation_sessions::status),
            &mut conn,
        )
        .await
        .optional()?;

        match status {
            None => Ok(CompletionOutcome::NotFound),
            Some(text) => match text.parse::<SessionStatus>() {
                Ok(SessionStatus::Completed) => Ok(CompletionOutcome::AlreadyCompleted),
                Ok(other) => Ok(CompletionOutcome::NotCompletable(other)),
                Err(e) => Err(DirectoryError::Corrupt {
                    session_id: session_id.to_string(),
                    status: e.0,
                }),
            },
        }
    }
}

// ---------------------------------------------------------------------------
// In-memory implementation (for local runs / tests)
// ---------------------------------------------------------------------------

/// Map-backed directory. The conditional update happens under one lock, which
/// gives the same at-most-once guarantee as the SQL predicate.
#[derive(Default)]
pub struct MemoryDirectory {
    sessions: Mutex<HashMap<String, SessionRecord>>,
    transitions: AtomicUsize,
    unavailable: AtomicBool,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, record: SessionRecord) {
        self.sessions.lock().insert(record.id.clone(), record);
    }

    pub fn status_of(&self, session_id: &str) -> Option<SessionStatus> {
        self.sessions.lock().get(session_id).map(|s| s.status)
    }

    /// Number of CONFIRMED -> COMPLETED writes performed so far.
    pub fn completed_transitions(&self) -> usize {
        self.transitions.load(Ordering::SeqCst)
    }

    /// Make every call fail with `DirectoryError::Unavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), DirectoryError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(DirectoryError::Unavailable("memory directory offline".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl SessionDirectory for MemoryDirectory {
    async fn find_by_id(&self, session_id: &str) -> Result<Option<SessionRecord>, DirectoryError> {
        self.check_available()?;
        Ok(self.sessions.lock().get(session_id).cloned())
    }

    async fn resolve(&self, room_token: &str) -> Result<Option<SessionRecord>, DirectoryError> {
        self.check_available()?;
        Ok(self
            .sessions
            .lock()
            .values()
            .find(|s| s.room_token.as_deref() == Some(room_token))
            .cloned())
    }

    async fn mark_completed(&self, session_id: &str) -> Result<CompletionOutcome, DirectoryError> {
        self.check_available()?;
        let mut sessions = self.sessions.lock();
        let Some(session) = sessions.get_mut(session_id) else {
            return Ok(CompletionOutcome::NotFound);
        };
        match session.status {
            SessionStatus::Confirmed => {
                session.status = SessionStatus::Completed;
                self.transitions.fetch_add(1, Ordering::SeqCst);
                Ok(CompletionOutcome::Completed)
            }
            SessionStatus::Completed => Ok(CompletionOutcome::AlreadyCompleted),
            other => Ok(CompletionOutcome::NotCompletable(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn confirmed(id: &str, token: &str) -> SessionRecord {
        SessionRecord {
            id: id.to_string(),
            requester_id: "usr_f".to_string(),
            responder_id: "usr_e".to_string(),
            room_token: Some(token.to_string()),
            status: SessionStatus::Confirmed,
        }
    }

    #[tokio::test]
    async fn resolve_finds_session_by_room_token() {
        let dir = MemoryDirectory::new();
        dir.insert(confirmed("ses_1", "r1"));

        let found = dir.resolve("r1").await.unwrap().unwrap();
        assert_eq!(found.id, "ses_1");
        assert!(dir.resolve("r2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn second_completion_reports_already_completed() {
        let dir = MemoryDirectory::new();
        dir.insert(confirmed("ses_1", "r1"));

        assert_eq!(dir.mark_completed("ses_1").await.unwrap(), CompletionOutcome::Completed);
        let again = dir.mark_completed("ses_1").await.unwrap();
        assert!(again.is_already_completed());
        assert_eq!(dir.completed_transitions(), 1);
    }

    #[tokio::test]
    async fn pending_and_cancelled_are_not_completed() {
        let dir = MemoryDirectory::new();
        let mut pending = confirmed("ses_p", "rp");
        pending.status = SessionStatus::Pending;
        let mut cancelled = confirmed("ses_c", "rc");
        cancelled.status = SessionStatus::Cancelled;
        dir.insert(pending);
        dir.insert(cancelled);

        assert_eq!(
            dir.mark_completed("ses_p").await.unwrap(),
            CompletionOutcome::NotCompletable(SessionStatus::Pending)
        );
        assert_eq!(
            dir.mark_completed("ses_c").await.unwrap(),
            CompletionOutcome::NotCompletable(SessionStatus::Cancelled)
        );
        assert_eq!(dir.mark_completed("ses_missing").await.unwrap(), CompletionOutcome::NotFound);
        assert_eq!(dir.completed_transitions(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_completions_transition_once() {
        let dir = Arc::new(MemoryDirectory::new());
        dir.insert(confirmed("ses_1", "r1"));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let dir = dir.clone();
                tokio::spawn(async move { dir.mark_completed("ses_1").await.unwrap() })
            })
            .collect();

        let mut completed = 0;
        for h in handles {
            if h.await.unwrap() == CompletionOutcome::Completed {
                completed += 1;
            }
        }
        assert_eq!(completed, 1);
        assert_eq!(dir.completed_transitions(), 1);
        assert_eq!(dir.status_of("ses_1"), Some(SessionStatus::Completed));
    }

    #[tokio::test]
    async fn unavailable_directory_fails_every_call() {
        let dir = MemoryDirectory::new();
        dir.insert(confirmed("ses_1", "r1"));
        dir.set_unavailable(true);

        assert!(dir.find_by_id("ses_1").await.is_err());
        assert!(dir.resolve("r1").await.is_err());
        assert!(dir.mark_completed("ses_1").await.is_err());
    }
}
