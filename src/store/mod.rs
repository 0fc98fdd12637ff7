//! Versioned storage of session and attempt aggregates.
//!
//! The store is the single source of truth and the only suspension point
//! in session processing. Every update is a compare-and-swap keyed by the
//! aggregate's `version`; a stale write is rejected with a conflict so the
//! caller can re-read and retry, never silently merged.

use async_trait::async_trait;

use crate::error::Result;
use crate::models::exam_session::{ExamSession, ExamType};
use crate::models::mock_test::MockTest;

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Store: Send + Sync {
    /// Storage-availability probe surfaced by the health endpoint.
    async fn ping(&self) -> Result<()>;

    // Sessions ------------------------------------------------------------

    /// Inserts a fresh session. Fails with a conflict when an active
    /// session already exists for the same mock test.
    async fn insert_session(&self, session: &ExamSession) -> Result<ExamSession>;

    async fn get_session(&self, session_id: &str) -> Result<ExamSession>;

    /// Compare-and-swap update: the write succeeds only when the stored
    /// version matches `session.version`, and the stored copy comes back
    /// with the version bumped.
    async fn update_session(&self, session: &ExamSession) -> Result<ExamSession>;

    async fn list_active_sessions(&self) -> Result<Vec<ExamSession>>;

    async fn list_flagged_sessions(
        &self,
        exam_type: Option<ExamType>,
        page: i64,
        limit: i64,
    ) -> Result<(Vec<ExamSession>, i64)>;

    // Attempts ------------------------------------------------------------

    /// Inserts a fresh attempt. Fails with a conflict when the exam ID is
    /// already taken.
    async fn insert_attempt(&self, attempt: &MockTest) -> Result<MockTest>;

    async fn get_attempt(&self, id: &str) -> Result<MockTest>;

    async fn find_attempt_by_exam_id(&self, exam_id: &str) -> Result<MockTest>;

    /// Compare-and-swap update, same contract as `update_session`.
    async fn update_attempt(&self, attempt: &MockTest) -> Result<MockTest>;

    /// Most recent submitted or completed attempt for the cooldown check.
    async fn last_submitted_attempt(
        &self,
        user_id: &str,
        exam_type: ExamType,
    ) -> Result<Option<MockTest>>;
}
