//! In-memory store used by tests and single-node deployments without a
//! database. Mirrors the Postgres contract exactly, including version
//! checks and the single-active-session constraint.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::models::exam_session::{ExamSession, ExamType, SessionStatus};
use crate::models::mock_test::{AttemptStatus, MockTest};

use super::Store;

#[derive(Default)]
struct Inner {
    sessions: HashMap<String, ExamSession>,
    attempts: HashMap<String, MockTest>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("memory store mutex poisoned")
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn insert_session(&self, session: &ExamSession) -> Result<ExamSession> {
        let mut inner = self.lock();
        if inner.sessions.contains_key(&session.session_id) {
            return Err(Error::Conflict(format!(
                "Session {} already exists",
                session.session_id
            )));
        }
        let active_exists = inner.sessions.values().any(|s| {
            s.mock_test_id == session.mock_test_id && s.status == SessionStatus::Active
        });
        if active_exists {
            return Err(Error::Conflict(format!(
                "An active session already exists for mock test {}",
                session.mock_test_id
            )));
        }
        let mut stored = session.clone();
        stored.version = 1;
        inner
            .sessions
            .insert(stored.session_id.clone(), stored.clone());
        Ok(stored)
    }

    async fn get_session(&self, session_id: &str) -> Result<ExamSession> {
        self.lock()
            .sessions
            .get(session_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("Session {} not found", session_id)))
    }

    async fn update_session(&self, session: &ExamSession) -> Result<ExamSession> {
        let mut inner = self.lock();
        let current = inner
            .sessions
            .get(&session.session_id)
            .ok_or_else(|| Error::NotFound(format!("Session {} not found", session.session_id)))?;
        if current.version != session.version {
            return Err(Error::Conflict(format!(
                "Stale version {} for session {} (stored {})",
                session.version, session.session_id, current.version
            )));
        }
        let mut stored = session.clone();
        stored.version += 1;
        inner
            .sessions
            .insert(stored.session_id.clone(), stored.clone());
        Ok(stored)
    }

    async fn list_active_sessions(&self) -> Result<Vec<ExamSession>> {
        Ok(self
            .lock()
            .sessions
            .values()
            .filter(|s| s.status == SessionStatus::Active)
            .cloned()
            .collect())
    }

    async fn list_flagged_sessions(
        &self,
        exam_type: Option<ExamType>,
        page: i64,
        limit: i64,
    ) -> Result<(Vec<ExamSession>, i64)> {
        let inner = self.lock();
        let mut flagged: Vec<ExamSession> = inner
            .sessions
            .values()
            .filter(|s| s.flagged && exam_type.map_or(true, |t| s.exam_type == t))
            .cloned()
            .collect();
        flagged.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        let total = flagged.len() as i64;
        let skip = ((page.max(1) - 1) * limit).max(0) as usize;
        let items = flagged
            .into_iter()
            .skip(skip)
            .take(limit.max(0) as usize)
            .collect();
        Ok((items, total))
    }

    async fn insert_attempt(&self, attempt: &MockTest) -> Result<MockTest> {
        let mut inner = self.lock();
        if inner.attempts.contains_key(&attempt.id) {
            return Err(Error::Conflict(format!(
                "Attempt {} already exists",
                attempt.id
            )));
        }
        let exam_id_taken = inner
            .attempts
            .values()
            .any(|a| a.exam_id == attempt.exam_id);
        if exam_id_taken {
            return Err(Error::Conflict(format!(
                "Exam ID {} already exists",
                attempt.exam_id
            )));
        }
        let mut stored = attempt.clone();
        stored.version = 1;
        inner.attempts.insert(stored.id.clone(), stored.clone());
        Ok(stored)
    }

    async fn get_attempt(&self, id: &str) -> Result<MockTest> {
        self.lock()
            .attempts
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("Mock test {} not found", id)))
    }

    async fn find_attempt_by_exam_id(&self, exam_id: &str) -> Result<MockTest> {
        self.lock()
            .attempts
            .values()
            .find(|a| a.exam_id == exam_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("Exam ID {} not found", exam_id)))
    }

    async fn update_attempt(&self, attempt: &MockTest) -> Result<MockTest> {
        let mut inner = self.lock();
        let current = inner
            .attempts
            .get(&attempt.id)
            .ok_or_else(|| Error::NotFound(format!("Mock test {} not found", attempt.id)))?;
        if current.version != attempt.version {
            return Err(Error::Conflict(format!(
                "Stale version {} for mock test {} (stored {})",
                attempt.version, attempt.id, current.version
            )));
        }
        let mut stored = attempt.clone();
        stored.version += 1;
        inner.attempts.insert(stored.id.clone(), stored.clone());
        Ok(stored)
    }

    async fn last_submitted_attempt(
        &self,
        user_id: &str,
        exam_type: ExamType,
    ) -> Result<Option<MockTest>> {
        let inner = self.lock();
        let mut matches: Vec<&MockTest> = inner
            .attempts
            .values()
            .filter(|a| {
                a.user_id == user_id
                    && a.exam_type == exam_type
                    && matches!(
                        a.status,
                        AttemptStatus::Submitted | AttemptStatus::Completed
                    )
                    && a.last_attempt_date.is_some()
            })
            .collect();
        matches.sort_by(|a, b| b.last_attempt_date.cmp(&a.last_attempt_date));
        Ok(matches.first().map(|a| (*a).clone()))
    }
}
