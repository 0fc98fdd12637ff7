use std::sync::Arc;

use chrono::Duration;
use uuid::Uuid;

use crate::dto::attempt_dto::{AttemptInfoResponse, SaveResponseRequest};
use crate::error::{Error, Result};
use crate::models::exam_session::ExamType;
use crate::models::mock_test::{
    is_valid_exam_id, AttemptStatus, AttemptViolation, MockTest, ResponseEntry, UnlockRequest,
    UnlockStatus,
};
use crate::store::Store;
use crate::utils::ids::generate_exam_id;
use crate::utils::time::now;

const JAMB_SUBJECT_COUNT: usize = 4;
const MAX_WAEC_SUBJECTS: usize = 9;

#[derive(Debug, Clone)]
pub struct AttemptPolicy {
    pub cooldown_days: i64,
    pub result_delay_secs: i64,
    pub exam_id_retries: u32,
    pub store_retry_limit: u32,
}

impl Default for AttemptPolicy {
    fn default() -> Self {
        Self {
            cooldown_days: 7,
            result_delay_secs: 3600,
            exam_id_retries: 5,
            store_retry_limit: 3,
        }
    }
}

/// Exam-attempt lifecycle. Owns everything on `MockTest` except the
/// violation and unlock mirrors, which the session state machine writes
/// through the narrow helpers at the bottom.
#[derive(Clone)]
pub struct AttemptService {
    store: Arc<dyn Store>,
    policy: AttemptPolicy,
}

impl AttemptService {
    pub fn new(store: Arc<dyn Store>, policy: AttemptPolicy) -> Self {
        Self { store, policy }
    }

    async fn mutate<T, F>(&self, id: &str, mutate: F) -> Result<(MockTest, T)>
    where
        F: Fn(&mut MockTest) -> Result<T> + Send + Sync,
        T: Send,
    {
        let mut tries = self.policy.store_retry_limit.max(1);
        loop {
            let mut attempt = self.store.get_attempt(id).await?;
            let out = mutate(&mut attempt)?;
            attempt.updated_at = now();
            match self.store.update_attempt(&attempt).await {
                Ok(stored) => return Ok((stored, out)),
                Err(e) if e.is_conflict() => {
                    tries -= 1;
                    if tries == 0 {
                        return Err(Error::Internal(format!(
                            "Gave up updating mock test {} after stale-version retries",
                            id
                        )));
                    }
                    tracing::debug!(mock_test_id = id, "stale attempt write, retrying");
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn owned(attempt: &MockTest, user_id: &str) -> Result<()> {
        if attempt.user_id != user_id {
            return Err(Error::Forbidden(
                "Mock test belongs to another user".to_string(),
            ));
        }
        Ok(())
    }

    pub async fn attempt_info(
        &self,
        user_id: &str,
        exam_type: ExamType,
    ) -> Result<AttemptInfoResponse> {
        let last = self.store.last_submitted_attempt(user_id, exam_type).await?;
        let next = last
            .and_then(|a| a.last_attempt_date)
            .map(|d| d + Duration::days(self.policy.cooldown_days));
        match next {
            Some(date) if date > now() => Ok(AttemptInfoResponse {
                can_attempt: false,
                next_attempt_date: Some(date),
                seconds_until_next_attempt: Some((date - now()).num_seconds().max(0)),
            }),
            _ => Ok(AttemptInfoResponse {
                can_attempt: true,
                next_attempt_date: None,
                seconds_until_next_attempt: None,
            }),
        }
    }

    /// Creates a draft attempt with a fresh exam ID, enforcing the
    /// once-per-cooldown rule.
    pub async fn initialize(&self, user_id: &str, exam_type: ExamType) -> Result<MockTest> {
        let info = self.attempt_info(user_id, exam_type).await?;
        if !info.can_attempt {
            return Err(Error::Conflict(format!(
                "Next attempt allowed from {}",
                info.next_attempt_date
                    .map(|d| d.to_rfc3339())
                    .unwrap_or_default()
            )));
        }

        // The store's uniqueness constraint is authoritative; retry a few
        // collisions, then fail loudly instead of looping.
        let mut remaining = self.policy.exam_id_retries.max(1);
        loop {
            let exam_id = generate_exam_id(exam_type);
            let attempt = MockTest::new(
                Uuid::new_v4().to_string(),
                user_id.to_string(),
                exam_type,
                exam_id.clone(),
                now(),
            );
            match self.store.insert_attempt(&attempt).await {
                Ok(stored) => {
                    tracing::info!(
                        mock_test_id = %stored.id,
                        exam_id = %stored.exam_id,
                        %exam_type,
                        "initialized mock test"
                    );
                    return Ok(stored);
                }
                Err(e) if e.is_conflict() => {
                    remaining -= 1;
                    if remaining == 0 {
                        return Err(Error::Internal(format!(
                            "Exhausted exam ID generation retries for {}",
                            exam_type
                        )));
                    }
                    tracing::warn!(exam_id = %exam_id, "exam ID collision, regenerating");
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub async fn get_owned(&self, id: &str, user_id: &str) -> Result<MockTest> {
        let attempt = self.store.get_attempt(id).await?;
        Self::owned(&attempt, user_id)?;
        Ok(attempt)
    }

    pub async fn update_subject_combination(
        &self,
        id: &str,
        user_id: &str,
        subjects: Vec<String>,
    ) -> Result<MockTest> {
        let user_id = user_id.to_string();
        let (attempt, _) = self
            .mutate(id, move |attempt| {
                Self::owned(attempt, &user_id)?;
                if attempt.status != AttemptStatus::Draft {
                    return Err(Error::Conflict(format!(
                        "Subject combination can only change while draft (status: {})",
                        attempt.status
                    )));
                }
                validate_subjects(attempt.exam_type, &subjects)?;
                attempt.subject_combination = subjects.clone();
                attempt.subject_combination_changed_at = Some(now());
                Ok(())
            })
            .await?;
        Ok(attempt)
    }

    pub async fn start(&self, id: &str, user_id: &str) -> Result<MockTest> {
        let user_id = user_id.to_string();
        let (attempt, _) = self
            .mutate(id, move |attempt| {
                Self::owned(attempt, &user_id)?;
                begin(attempt)
            })
            .await?;
        Ok(attempt)
    }

    /// Checks that a proctoring session may open against this attempt:
    /// already in progress, or a draft with a chosen subject combination.
    pub fn ensure_startable(attempt: &MockTest) -> Result<()> {
        if attempt.status == AttemptStatus::InProgress {
            return Ok(());
        }
        ready_to_begin(attempt)
    }

    /// Called by the session state machine when a proctoring session opens
    /// against a draft attempt.
    pub async fn begin_for_session(&self, id: &str) -> Result<MockTest> {
        let (attempt, _) = self
            .mutate(id, |attempt| {
                if attempt.status == AttemptStatus::InProgress {
                    return Ok(());
                }
                begin(attempt)
            })
            .await?;
        Ok(attempt)
    }

    pub async fn save_response(
        &self,
        id: &str,
        user_id: &str,
        req: SaveResponseRequest,
    ) -> Result<MockTest> {
        let user_id = user_id.to_string();
        let (attempt, _) = self
            .mutate(id, move |attempt| {
                Self::owned(attempt, &user_id)?;
                if attempt.status != AttemptStatus::InProgress {
                    return Err(Error::Conflict(format!(
                        "Responses are frozen (status: {})",
                        attempt.status
                    )));
                }
                let entry = ResponseEntry {
                    question_id: req.question_id.clone(),
                    selected_answer: req.selected_answer.clone(),
                    is_bookmarked: req.is_bookmarked,
                    time_spent_secs: req.time_spent_secs,
                };
                match attempt
                    .responses
                    .iter_mut()
                    .find(|r| r.question_id == req.question_id)
                {
                    Some(existing) => *existing = entry,
                    None => attempt.responses.push(entry),
                }
                Ok(())
            })
            .await?;
        Ok(attempt)
    }

    pub async fn update_progress(
        &self,
        id: &str,
        user_id: &str,
        current_subject: Option<String>,
        completed_subject: Option<String>,
        time_remaining_secs: Option<i64>,
    ) -> Result<MockTest> {
        let user_id = user_id.to_string();
        let (attempt, _) = self
            .mutate(id, move |attempt| {
                Self::owned(attempt, &user_id)?;
                if attempt.status != AttemptStatus::InProgress {
                    return Err(Error::Conflict(format!(
                        "Mock test is not in progress (status: {})",
                        attempt.status
                    )));
                }
                if let Some(subject) = &current_subject {
                    attempt.current_subject = Some(subject.clone());
                }
                if let Some(subject) = &completed_subject {
                    if !attempt.completed_subjects.contains(subject) {
                        attempt.completed_subjects.push(subject.clone());
                    }
                }
                if let Some(remaining) = time_remaining_secs {
                    if remaining < 0 {
                        return Err(Error::BadRequest(
                            "time_remaining_secs must be non-negative".to_string(),
                        ));
                    }
                    let current = attempt.time_remaining_secs.unwrap_or(attempt.total_time_secs);
                    if remaining > current {
                        return Err(Error::Conflict(format!(
                            "Time remaining may not increase ({} -> {})",
                            current, remaining
                        )));
                    }
                    attempt.time_remaining_secs = Some(remaining);
                }
                Ok(())
            })
            .await?;
        Ok(attempt)
    }

    pub async fn submit(
        &self,
        id: &str,
        user_id: &str,
        delay_result_processing: bool,
    ) -> Result<MockTest> {
        let user_id = user_id.to_string();
        let cooldown = Duration::days(self.policy.cooldown_days);
        let result_delay = Duration::seconds(self.policy.result_delay_secs);
        let (attempt, _) = self
            .mutate(id, move |attempt| {
                Self::owned(attempt, &user_id)?;
                if attempt.status != AttemptStatus::InProgress {
                    return Err(Error::Conflict(format!(
                        "Only an in-progress mock test can be submitted (status: {})",
                        attempt.status
                    )));
                }
                let ts = now();
                attempt.status = AttemptStatus::Submitted;
                attempt.submitted_at = Some(ts);
                attempt.end_time = Some(ts);
                attempt.last_attempt_date = Some(ts);
                attempt.next_attempt_date = Some(ts + cooldown);
                if delay_result_processing {
                    attempt.results_available_at = Some(ts + result_delay);
                }
                Ok(())
            })
            .await?;
        tracing::info!(
            mock_test_id = %attempt.id,
            exam_id = %attempt.exam_id,
            "mock test submitted"
        );
        Ok(attempt)
    }

    /// Public result lookup by exam ID; results stay withheld until the
    /// configured delay after submission has passed.
    pub async fn check_results(&self, exam_id: &str) -> Result<MockTest> {
        if !is_valid_exam_id(exam_id) {
            return Err(Error::BadRequest(
                "Invalid exam ID format. ID must be 12 alphanumeric characters beginning with J or W."
                    .to_string(),
            ));
        }
        let attempt = self.store.find_attempt_by_exam_id(exam_id).await?;

        let prefix = exam_id.chars().next().unwrap_or_default();
        if Some(attempt.exam_type) != ExamType::from_exam_id_prefix(prefix) {
            return Err(Error::BadRequest(
                "Exam ID does not match exam type".to_string(),
            ));
        }
        if !matches!(
            attempt.status,
            AttemptStatus::Submitted | AttemptStatus::Completed
        ) {
            return Err(Error::Conflict("Test not yet submitted".to_string()));
        }
        if let Some(available_at) = attempt.results_available_at {
            if now() < available_at {
                return Err(Error::Conflict(format!(
                    "Results available from {}",
                    available_at.to_rfc3339()
                )));
            }
        }
        Ok(attempt)
    }

    // ---- Mirrors written by the session state machine ----

    pub async fn append_violation_mirror(
        &self,
        id: &str,
        session_id: &str,
        count: u32,
        note: Option<String>,
    ) -> Result<MockTest> {
        let session_id = session_id.to_string();
        let (attempt, _) = self
            .mutate(id, move |attempt| {
                attempt.violations.push(AttemptViolation {
                    timestamp: now(),
                    session_id: session_id.clone(),
                    count,
                    note: note.clone(),
                });
                Ok(())
            })
            .await?;
        Ok(attempt)
    }

    pub async fn append_unlock_request(
        &self,
        id: &str,
        session_id: &str,
        note: Option<String>,
    ) -> Result<UnlockRequest> {
        let session_id = session_id.to_string();
        let (_, request) = self
            .mutate(id, move |attempt| {
                if attempt.pending_unlock_for_session(&session_id).is_some() {
                    return Err(Error::Conflict(format!(
                        "An unlock request is already pending for session {}",
                        session_id
                    )));
                }
                let request = UnlockRequest {
                    id: Uuid::new_v4().to_string(),
                    timestamp: now(),
                    session_id: session_id.clone(),
                    status: UnlockStatus::Pending,
                    note: note.clone(),
                    reviewed_by: None,
                    reviewed_at: None,
                };
                attempt.unlock_requests.push(request.clone());
                Ok(request)
            })
            .await?;
        Ok(request)
    }

    pub async fn resolve_unlock_request(
        &self,
        id: &str,
        request_id: &str,
        approve: bool,
        reviewer_id: &str,
        restore_time_secs: Option<i64>,
    ) -> Result<(MockTest, UnlockRequest)> {
        let request_id = request_id.to_string();
        let reviewer_id = reviewer_id.to_string();
        self.mutate(id, move |attempt| {
            if let Some(restore) = restore_time_secs {
                if !approve {
                    return Err(Error::BadRequest(
                        "restore_time_secs is only valid on approval".to_string(),
                    ));
                }
                if attempt.status != AttemptStatus::InProgress {
                    return Err(Error::Conflict(format!(
                        "Cannot restore time on a {} mock test",
                        attempt.status
                    )));
                }
                if restore < 0 || restore > attempt.total_time_secs {
                    return Err(Error::BadRequest(
                        "restore_time_secs out of range".to_string(),
                    ));
                }
            }

            let request = attempt
                .unlock_requests
                .iter_mut()
                .find(|r| r.id == request_id)
                .ok_or_else(|| {
                    Error::NotFound(format!("Unlock request {} not found", request_id))
                })?;
            if request.status != UnlockStatus::Pending {
                return Err(Error::Conflict(
                    "Unlock request has already been reviewed".to_string(),
                ));
            }
            request.status = if approve {
                UnlockStatus::Approved
            } else {
                UnlockStatus::Rejected
            };
            request.reviewed_by = Some(reviewer_id.clone());
            request.reviewed_at = Some(now());
            let resolved = request.clone();

            if let Some(restore) = restore_time_secs {
                // The single sanctioned increase of time_remaining.
                attempt.time_remaining_secs = Some(restore);
            }
            Ok(resolved)
        })
        .await
    }
}

fn ready_to_begin(attempt: &MockTest) -> Result<()> {
    if attempt.status != AttemptStatus::Draft {
        return Err(Error::Conflict(format!(
            "Mock test cannot start from status {}",
            attempt.status
        )));
    }
    if attempt.subject_combination.is_empty() {
        return Err(Error::Conflict(
            "Subject combination must be chosen before starting".to_string(),
        ));
    }
    Ok(())
}

fn begin(attempt: &mut MockTest) -> Result<()> {
    ready_to_begin(attempt)?;
    let ts = now();
    attempt.status = AttemptStatus::InProgress;
    attempt.start_time = Some(ts);
    attempt.time_remaining_secs = Some(attempt.total_time_secs);
    attempt.current_subject = attempt.subject_combination.first().cloned();
    Ok(())
}

fn validate_subjects(exam_type: ExamType, subjects: &[String]) -> Result<()> {
    let mut seen = std::collections::HashSet::new();
    for subject in subjects {
        if subject.trim().is_empty() {
            return Err(Error::BadRequest("Subject names must be non-empty".into()));
        }
        if !seen.insert(subject.trim().to_ascii_lowercase()) {
            return Err(Error::BadRequest(format!("Duplicate subject: {}", subject)));
        }
    }
    match exam_type {
        ExamType::Jamb => {
            if subjects.len() != JAMB_SUBJECT_COUNT {
                return Err(Error::BadRequest(format!(
                    "JAMB requires exactly {} subjects",
                    JAMB_SUBJECT_COUNT
                )));
            }
            let has_english = subjects
                .iter()
                .any(|s| s.to_ascii_lowercase().contains("english"));
            if !has_english {
                return Err(Error::BadRequest(
                    "JAMB combination must include English".to_string(),
                ));
            }
        }
        ExamType::Waec => {
            if subjects.is_empty() || subjects.len() > MAX_WAEC_SUBJECTS {
                return Err(Error::BadRequest(format!(
                    "WAEC allows between 1 and {} subjects",
                    MAX_WAEC_SUBJECTS
                )));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn service() -> AttemptService {
        AttemptService::new(Arc::new(MemoryStore::new()), AttemptPolicy::default())
    }

    fn jamb_subjects() -> Vec<String> {
        vec![
            "English Language".into(),
            "Mathematics".into(),
            "Physics".into(),
            "Chemistry".into(),
        ]
    }

    #[tokio::test]
    async fn initialize_produces_valid_unique_exam_ids() {
        let svc = service();
        let a = svc.initialize("user-1", ExamType::Jamb).await.unwrap();
        let b = svc.initialize("user-2", ExamType::Waec).await.unwrap();
        assert!(is_valid_exam_id(&a.exam_id));
        assert!(a.exam_id.starts_with('J'));
        assert!(b.exam_id.starts_with('W'));
        assert_ne!(a.exam_id, b.exam_id);
        assert_eq!(a.status, AttemptStatus::Draft);
    }

    #[tokio::test]
    async fn subjects_change_only_while_draft_and_records_timestamp() {
        let svc = service();
        let attempt = svc.initialize("user-1", ExamType::Jamb).await.unwrap();
        let updated = svc
            .update_subject_combination(&attempt.id, "user-1", jamb_subjects())
            .await
            .unwrap();
        assert!(updated.subject_combination_changed_at.is_some());

        svc.start(&attempt.id, "user-1").await.unwrap();
        let err = svc
            .update_subject_combination(&attempt.id, "user-1", jamb_subjects())
            .await
            .unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn jamb_combination_must_include_english() {
        let svc = service();
        let attempt = svc.initialize("user-1", ExamType::Jamb).await.unwrap();
        let err = svc
            .update_subject_combination(
                &attempt.id,
                "user-1",
                vec![
                    "Mathematics".into(),
                    "Physics".into(),
                    "Chemistry".into(),
                    "Biology".into(),
                ],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BadRequest(_)));
    }

    #[tokio::test]
    async fn time_remaining_never_increases() {
        let svc = service();
        let attempt = svc.initialize("user-1", ExamType::Jamb).await.unwrap();
        svc.update_subject_combination(&attempt.id, "user-1", jamb_subjects())
            .await
            .unwrap();
        svc.start(&attempt.id, "user-1").await.unwrap();

        svc.update_progress(&attempt.id, "user-1", None, None, Some(9000))
            .await
            .unwrap();
        let err = svc
            .update_progress(&attempt.id, "user-1", None, None, Some(9500))
            .await
            .unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn completed_subjects_are_append_only() {
        let svc = service();
        let attempt = svc.initialize("user-1", ExamType::Jamb).await.unwrap();
        svc.update_subject_combination(&attempt.id, "user-1", jamb_subjects())
            .await
            .unwrap();
        svc.start(&attempt.id, "user-1").await.unwrap();

        svc.update_progress(
            &attempt.id,
            "user-1",
            Some("Mathematics".into()),
            Some("English Language".into()),
            None,
        )
        .await
        .unwrap();
        let again = svc
            .update_progress(
                &attempt.id,
                "user-1",
                None,
                Some("English Language".into()),
                None,
            )
            .await
            .unwrap();
        assert_eq!(again.completed_subjects, vec!["English Language"]);
    }

    #[tokio::test]
    async fn submit_freezes_responses_and_schedules_cooldown() {
        let svc = service();
        let attempt = svc.initialize("user-1", ExamType::Jamb).await.unwrap();
        svc.update_subject_combination(&attempt.id, "user-1", jamb_subjects())
            .await
            .unwrap();
        svc.start(&attempt.id, "user-1").await.unwrap();
        svc.save_response(
            &attempt.id,
            "user-1",
            SaveResponseRequest {
                question_id: "q1".into(),
                selected_answer: Some("A".into()),
                is_bookmarked: false,
                time_spent_secs: 12,
            },
        )
        .await
        .unwrap();

        let submitted = svc.submit(&attempt.id, "user-1", true).await.unwrap();
        assert_eq!(submitted.status, AttemptStatus::Submitted);
        assert!(submitted.results_available_at.is_some());
        assert!(submitted.next_attempt_date.unwrap() > now());

        let err = svc
            .save_response(
                &attempt.id,
                "user-1",
                SaveResponseRequest {
                    question_id: "q2".into(),
                    selected_answer: Some("B".into()),
                    is_bookmarked: false,
                    time_spent_secs: 3,
                },
            )
            .await
            .unwrap_err();
        assert!(err.is_conflict());

        // Cooldown now blocks a fresh attempt for the same user/exam.
        let err = svc.initialize("user-1", ExamType::Jamb).await.unwrap_err();
        assert!(err.is_conflict());
        // Other exam types are unaffected.
        svc.initialize("user-1", ExamType::Waec).await.unwrap();
    }

    #[tokio::test]
    async fn results_are_withheld_until_available_at() {
        let svc = service();
        let attempt = svc.initialize("user-1", ExamType::Jamb).await.unwrap();
        svc.update_subject_combination(&attempt.id, "user-1", jamb_subjects())
            .await
            .unwrap();
        svc.start(&attempt.id, "user-1").await.unwrap();
        let submitted = svc.submit(&attempt.id, "user-1", true).await.unwrap();

        let err = svc.check_results(&submitted.exam_id).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn results_lookup_validates_exam_id_shape() {
        let svc = service();
        let err = svc.check_results("short").await.unwrap_err();
        assert!(matches!(err, Error::BadRequest(_)));
        let err = svc.check_results("XABCDEFGH123").await.unwrap_err();
        assert!(matches!(err, Error::BadRequest(_)));
    }

    #[tokio::test]
    async fn duplicate_pending_unlock_for_session_conflicts() {
        let svc = service();
        let attempt = svc.initialize("user-1", ExamType::Jamb).await.unwrap();
        svc.append_unlock_request(&attempt.id, "SESS_x", Some("please".into()))
            .await
            .unwrap();
        let err = svc
            .append_unlock_request(&attempt.id, "SESS_x", None)
            .await
            .unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn unlock_review_is_single_shot() {
        let svc = service();
        let attempt = svc.initialize("user-1", ExamType::Jamb).await.unwrap();
        let request = svc
            .append_unlock_request(&attempt.id, "SESS_x", None)
            .await
            .unwrap();
        let (_, resolved) = svc
            .resolve_unlock_request(&attempt.id, &request.id, true, "admin-1", None)
            .await
            .unwrap();
        assert_eq!(resolved.status, UnlockStatus::Approved);
        assert_eq!(resolved.reviewed_by.as_deref(), Some("admin-1"));

        let err = svc
            .resolve_unlock_request(&attempt.id, &request.id, false, "admin-1", None)
            .await
            .unwrap_err();
        assert!(err.is_conflict());
    }
}
