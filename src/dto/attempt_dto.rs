use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::models::exam_session::ExamType;
use crate::models::mock_test::{AttemptStatus, MockTest, UnlockRequest};

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct InitializeAttemptRequest {
    pub exam_type: ExamType,
}

#[derive(Debug, Serialize)]
pub struct AttemptInfoResponse {
    pub can_attempt: bool,
    pub next_attempt_date: Option<DateTime<Utc>>,
    pub seconds_until_next_attempt: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AttemptInfoQuery {
    pub exam_type: ExamType,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct UpdateSubjectsRequest {
    #[validate(length(min = 1, max = 9))]
    pub subjects: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct SaveResponseRequest {
    #[validate(length(min = 1))]
    pub question_id: String,
    pub selected_answer: Option<String>,
    #[serde(default)]
    pub is_bookmarked: bool,
    #[serde(default)]
    pub time_spent_secs: i64,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct UpdateProgressRequest {
    #[validate(length(min = 1))]
    pub current_subject: Option<String>,
    #[validate(length(min = 1))]
    pub completed_subject: Option<String>,
    pub time_remaining_secs: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubmitAttemptRequest {
    #[serde(default)]
    pub delay_result_processing: bool,
}

#[derive(Debug, Serialize)]
pub struct SubmitAttemptResponse {
    pub exam_id: String,
    pub status: AttemptStatus,
    pub submitted_at: DateTime<Utc>,
    pub results_available_at: Option<DateTime<Utc>>,
    pub next_attempt_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct RequestUnlockRequest {
    #[validate(length(min = 1))]
    pub session_id: String,
    #[validate(length(max = 1024))]
    pub note: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RequestUnlockResponse {
    pub unlock_request: UnlockRequest,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct ReviewUnlockRequest {
    pub approve: bool,
    #[validate(length(max = 1024))]
    pub note: Option<String>,
    /// The one sanctioned way `time_remaining` may increase.
    pub restore_time_secs: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct ReviewUnlockResponse {
    pub unlock_request: UnlockRequest,
    pub new_session_id: Option<String>,
}

/// Results projection for the public exam-ID lookup. Scoring itself lives
/// outside this service; the projection reports attempt progress only.
#[derive(Debug, Serialize)]
pub struct ResultsResponse {
    pub exam_id: String,
    pub exam_type: ExamType,
    pub status: AttemptStatus,
    pub submitted_at: Option<DateTime<Utc>>,
    pub subject_combination: Vec<String>,
    pub completed_subjects: Vec<String>,
    pub responses_recorded: usize,
}

impl From<&MockTest> for ResultsResponse {
    fn from(attempt: &MockTest) -> Self {
        Self {
            exam_id: attempt.exam_id.clone(),
            exam_type: attempt.exam_type,
            status: attempt.status,
            submitted_at: attempt.submitted_at,
            subject_combination: attempt.subject_combination.clone(),
            completed_subjects: attempt.completed_subjects.clone(),
            responses_recorded: attempt.responses.len(),
        }
    }
}
