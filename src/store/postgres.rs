//! Postgres-backed store. Aggregates are persisted as jsonb documents with
//! the fields the queries need (status, flags, exam type, version) lifted
//! into columns; a partial unique index enforces the one-active-session
//! invariant and the `version` column carries the compare-and-swap.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value as JsonValue;
use sqlx::postgres::PgPoolOptions;
use sqlx::{FromRow, PgPool};

use crate::error::{Error, Result};
use crate::models::exam_session::{ExamSession, ExamType, SessionStatus};
use crate::models::mock_test::MockTest;

use super::Store;

#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

#[derive(FromRow)]
struct DocRow {
    doc: JsonValue,
}

#[derive(FromRow)]
struct CountRow {
    count: i64,
}

impl PostgresStore {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(50)
            .acquire_timeout(std::time::Duration::from_secs(30))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Internal(format!("Migration failed: {}", e)))
    }
}

fn to_doc<T: Serialize>(value: &T) -> Result<JsonValue> {
    Ok(serde_json::to_value(value)?)
}

fn from_doc<T: DeserializeOwned>(doc: JsonValue) -> Result<T> {
    Ok(serde_json::from_value(doc)?)
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => db.code().as_deref() == Some("23505"),
        _ => false,
    }
}

#[async_trait]
impl Store for PostgresStore {
    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn insert_session(&self, session: &ExamSession) -> Result<ExamSession> {
        let mut stored = session.clone();
        stored.version = 1;
        let doc = to_doc(&stored)?;

        let result = sqlx::query(
            r#"
            INSERT INTO exam_sessions
                (session_id, mock_test_id, user_id, exam_type, status, flagged, version, doc, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(&stored.session_id)
        .bind(&stored.mock_test_id)
        .bind(&stored.user_id)
        .bind(stored.exam_type.to_string())
        .bind(stored.status.to_string())
        .bind(stored.flagged)
        .bind(stored.version as i64)
        .bind(&doc)
        .bind(stored.created_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(stored),
            Err(e) if is_unique_violation(&e) => Err(Error::Conflict(format!(
                "An active session already exists for mock test {}",
                session.mock_test_id
            ))),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_session(&self, session_id: &str) -> Result<ExamSession> {
        let row = sqlx::query_as::<_, DocRow>(
            r#"SELECT doc FROM exam_sessions WHERE session_id = $1"#,
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| Error::NotFound(format!("Session {} not found", session_id)))?;
        from_doc(row.doc)
    }

    async fn update_session(&self, session: &ExamSession) -> Result<ExamSession> {
        let mut stored = session.clone();
        stored.version = session.version + 1;
        let doc = to_doc(&stored)?;

        let result = sqlx::query(
            r#"
            UPDATE exam_sessions
            SET status = $1, flagged = $2, version = $3, doc = $4
            WHERE session_id = $5 AND version = $6
            "#,
        )
        .bind(stored.status.to_string())
        .bind(stored.flagged)
        .bind(stored.version as i64)
        .bind(&doc)
        .bind(&stored.session_id)
        .bind(session.version as i64)
        .execute(&self.pool)
        .await;

        let affected = match result {
            Ok(r) => r.rows_affected(),
            // Suspending a session while another one is still active for the
            // same mock test can only happen through the partial index.
            Err(e) if is_unique_violation(&e) => {
                return Err(Error::Conflict(format!(
                    "Conflicting active session for mock test {}",
                    stored.mock_test_id
                )))
            }
            Err(e) => return Err(e.into()),
        };

        if affected == 0 {
            // Distinguish a vanished row from a stale version.
            self.get_session(&stored.session_id).await?;
            return Err(Error::Conflict(format!(
                "Stale version {} for session {}",
                session.version, stored.session_id
            )));
        }
        Ok(stored)
    }

    async fn list_active_sessions(&self) -> Result<Vec<ExamSession>> {
        let rows = sqlx::query_as::<_, DocRow>(
            r#"SELECT doc FROM exam_sessions WHERE status = $1"#,
        )
        .bind(SessionStatus::Active.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(|r| from_doc(r.doc)).collect()
    }

    async fn list_flagged_sessions(
        &self,
        exam_type: Option<ExamType>,
        page: i64,
        limit: i64,
    ) -> Result<(Vec<ExamSession>, i64)> {
        let exam_type = exam_type.map(|t| t.to_string());
        let offset = (page.max(1) - 1) * limit;

        let rows = sqlx::query_as::<_, DocRow>(
            r#"
            SELECT doc FROM exam_sessions
            WHERE flagged = TRUE
              AND ($1::text IS NULL OR exam_type = $1)
            ORDER BY created_at DESC
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(exam_type.clone())
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        let total = sqlx::query_as::<_, CountRow>(
            r#"
            SELECT COUNT(*) AS count FROM exam_sessions
            WHERE flagged = TRUE
              AND ($1::text IS NULL OR exam_type = $1)
            "#,
        )
        .bind(exam_type)
        .fetch_one(&self.pool)
        .await?
        .count;

        let sessions = rows
            .into_iter()
            .map(|r| from_doc(r.doc))
            .collect::<Result<Vec<_>>>()?;
        Ok((sessions, total))
    }

    async fn insert_attempt(&self, attempt: &MockTest) -> Result<MockTest> {
        let mut stored = attempt.clone();
        stored.version = 1;
        let doc = to_doc(&stored)?;

        let result = sqlx::query(
            r#"
            INSERT INTO mock_tests
                (id, user_id, exam_type, exam_id, status, version, doc, last_attempt_date, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(&stored.id)
        .bind(&stored.user_id)
        .bind(stored.exam_type.to_string())
        .bind(&stored.exam_id)
        .bind(stored.status.to_string())
        .bind(stored.version as i64)
        .bind(&doc)
        .bind(stored.last_attempt_date)
        .bind(stored.created_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(stored),
            Err(e) if is_unique_violation(&e) => Err(Error::Conflict(format!(
                "Exam ID {} already exists",
                attempt.exam_id
            ))),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_attempt(&self, id: &str) -> Result<MockTest> {
        let row = sqlx::query_as::<_, DocRow>(r#"SELECT doc FROM mock_tests WHERE id = $1"#)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Mock test {} not found", id)))?;
        from_doc(row.doc)
    }

    async fn find_attempt_by_exam_id(&self, exam_id: &str) -> Result<MockTest> {
        let row = sqlx::query_as::<_, DocRow>(r#"SELECT doc FROM mock_tests WHERE exam_id = $1"#)
            .bind(exam_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Exam ID {} not found", exam_id)))?;
        from_doc(row.doc)
    }

    async fn update_attempt(&self, attempt: &MockTest) -> Result<MockTest> {
        let mut stored = attempt.clone();
        stored.version = attempt.version + 1;
        let doc = to_doc(&stored)?;

        let affected = sqlx::query(
            r#"
            UPDATE mock_tests
            SET status = $1, version = $2, doc = $3, last_attempt_date = $4
            WHERE id = $5 AND version = $6
            "#,
        )
        .bind(stored.status.to_string())
        .bind(stored.version as i64)
        .bind(&doc)
        .bind(stored.last_attempt_date)
        .bind(&stored.id)
        .bind(attempt.version as i64)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if affected == 0 {
            self.get_attempt(&stored.id).await?;
            return Err(Error::Conflict(format!(
                "Stale version {} for mock test {}",
                attempt.version, stored.id
            )));
        }
        Ok(stored)
    }

    async fn last_submitted_attempt(
        &self,
        user_id: &str,
        exam_type: ExamType,
    ) -> Result<Option<MockTest>> {
        let row = sqlx::query_as::<_, DocRow>(
            r#"
            SELECT doc FROM mock_tests
            WHERE user_id = $1
              AND exam_type = $2
              AND status IN ('submitted', 'completed')
              AND last_attempt_date IS NOT NULL
            ORDER BY last_attempt_date DESC
            LIMIT 1
            "#,
        )
        .bind(user_id)
        .bind(exam_type.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| from_doc(r.doc)).transpose()
    }
}
