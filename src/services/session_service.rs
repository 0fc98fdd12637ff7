use std::sync::Arc;

use crate::dto::session_dto::{
    CreateSessionRequest, HeartbeatRequest, RecordViolationRequest, UpdateMetricsRequest,
    WebcamFrame,
};
use crate::error::{Error, Result};
use crate::models::exam_session::{
    ExamSession, ExamType, IpChange, SessionStatus, Violation, ViolationDetails, ViolationKind,
    ViolationSeverity,
};
use crate::models::mock_test::UnlockRequest;
use crate::proctoring::classifier::{classify, forces_suspension};
use crate::proctoring::risk::risk_score;
use crate::services::attempt_service::AttemptService;
use crate::store::Store;
use crate::utils::ids::generate_session_id;
use crate::utils::time::now;

pub const HEARTBEAT_TIMEOUT_REASON: &str = "heartbeat_timeout";

const LOW_CONFIDENCE_THRESHOLD: f64 = 0.3;

#[derive(Debug, Clone)]
pub struct SessionPolicy {
    /// Scores strictly above this suspend the session.
    pub suspend_risk_threshold: u8,
    pub heartbeat_max_missed: u32,
    pub store_retry_limit: u32,
    /// Sessions with more violations than this are flagged for review even
    /// when nothing individually was critical.
    pub flag_violation_count: usize,
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self {
            suspend_risk_threshold: 70,
            heartbeat_max_missed: 3,
            store_retry_limit: 3,
            flag_violation_count: 10,
        }
    }
}

#[derive(Debug)]
pub struct ReviewUnlockOutcome {
    pub unlock_request: UnlockRequest,
    pub new_session: Option<ExamSession>,
}

/// The session state machine. Every mutation is a read-modify-CAS against
/// the store, retried a bounded number of times on stale versions, so a
/// concurrent violation and heartbeat timeout can never produce a lost
/// update.
#[derive(Clone)]
pub struct SessionService {
    store: Arc<dyn Store>,
    attempts: AttemptService,
    policy: SessionPolicy,
}

impl SessionService {
    pub fn new(store: Arc<dyn Store>, attempts: AttemptService, policy: SessionPolicy) -> Self {
        Self {
            store,
            attempts,
            policy,
        }
    }

    async fn mutate<T, F>(&self, session_id: &str, mutate: F) -> Result<(ExamSession, T)>
    where
        F: Fn(&mut ExamSession) -> Result<T> + Send + Sync,
        T: Send,
    {
        let mut tries = self.policy.store_retry_limit.max(1);
        loop {
            let mut session = self.store.get_session(session_id).await?;
            let out = mutate(&mut session)?;
            session.updated_at = now();
            match self.store.update_session(&session).await {
                Ok(stored) => return Ok((stored, out)),
                Err(e) if e.is_conflict() => {
                    tries -= 1;
                    if tries == 0 {
                        return Err(Error::Internal(format!(
                            "Gave up updating session {} after stale-version retries",
                            session_id
                        )));
                    }
                    tracing::debug!(session_id, "stale session write, retrying");
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn recompute_risk(session: &mut ExamSession) {
        session.risk_score = risk_score(
            &session.proctoring,
            session.violations.len(),
            session.ip_changes.len(),
        );
    }

    fn suspend(session: &mut ExamSession, reason: &str) {
        session.status = SessionStatus::Suspended;
        session.flagged = true;
        session.flag_reason = Some(reason.to_string());
    }

    fn suspend_if_risky(session: &mut ExamSession, threshold: u8) -> bool {
        if session.status == SessionStatus::Active && session.risk_score > threshold {
            Self::suspend(session, "risk_threshold_exceeded");
            return true;
        }
        false
    }

    fn reject_terminal(session: &ExamSession) -> Result<()> {
        if session.status.is_terminal() {
            return Err(Error::Conflict(format!(
                "Session {} has ended ({})",
                session.session_id, session.status
            )));
        }
        Ok(())
    }

    fn require_active(session: &ExamSession) -> Result<()> {
        Self::reject_terminal(session)?;
        if session.status != SessionStatus::Active {
            return Err(Error::Conflict(format!(
                "Session {} is not active ({})",
                session.session_id, session.status
            )));
        }
        Ok(())
    }

    /// Opens a proctoring session for an attempt. The store rejects the
    /// insert when an active session already exists for the mock test, so
    /// concurrent creates yield exactly one winner.
    pub async fn create(&self, user_id: &str, req: &CreateSessionRequest) -> Result<ExamSession> {
        let attempt = self.store.get_attempt(&req.mock_test_id).await?;
        if attempt.user_id != user_id {
            return Err(Error::Forbidden(
                "Mock test belongs to another user".to_string(),
            ));
        }
        if attempt.exam_type != req.exam_type {
            return Err(Error::BadRequest(format!(
                "Exam type {} does not match mock test {}",
                req.exam_type, attempt.exam_type
            )));
        }
        AttemptService::ensure_startable(&attempt)?;

        let session = ExamSession::new(
            generate_session_id(),
            req.mock_test_id.clone(),
            user_id.to_string(),
            req.exam_type,
            &req.browser_info,
            req.ip_address.clone(),
            now(),
        );
        let stored = self.store.insert_session(&session).await?;

        // A session opening against a draft attempt moves it in-progress.
        // The attempt can still move under us between the startable check
        // and the insert; the session must not stay active in that case.
        if let Err(e) = self.attempts.begin_for_session(&attempt.id).await {
            self.discard(&stored.session_id).await;
            return Err(e);
        }

        tracing::info!(
            session_id = %stored.session_id,
            mock_test_id = %stored.mock_test_id,
            exam_type = %stored.exam_type,
            "exam session created"
        );
        Ok(stored)
    }

    /// Best-effort teardown for a session whose attempt refused to start.
    async fn discard(&self, session_id: &str) {
        let result = self
            .mutate(session_id, |session| {
                let ts = now();
                session.status = SessionStatus::Terminated;
                session.end_time = Some(ts);
                session.duration_secs = Some((ts - session.start_time).num_seconds().max(0));
                Ok(())
            })
            .await;
        if let Err(e) = result {
            tracing::error!(session_id, error = ?e, "failed to discard unstartable session");
        }
    }

    pub async fn get(&self, session_id: &str) -> Result<ExamSession> {
        self.store.get_session(session_id).await
    }

    pub async fn record_violation(&self, req: &RecordViolationRequest) -> Result<ExamSession> {
        let kind = req.kind.clone();
        let description = req.description.clone();
        let details = req.details.clone().map(narrow_details);
        let policy = self.policy.clone();

        let (session, suspended) = self
            .mutate(&req.session_id, move |session| {
                Self::require_active(session)?;

                let severity = classify(&kind);
                session.violations.push(Violation {
                    kind: kind.clone(),
                    severity,
                    description: description.clone(),
                    timestamp: now(),
                    details: details.clone(),
                });

                // A violation is also proof of life.
                session.heartbeat_last_received = now();
                session.heartbeat_missed_count = 0;

                Self::recompute_risk(session);

                let mut suspended = false;
                if forces_suspension(severity) {
                    Self::suspend(session, &format!("critical_violation:{}", kind));
                    suspended = true;
                } else if Self::suspend_if_risky(session, policy.suspend_risk_threshold) {
                    suspended = true;
                } else if session.violations.len() > policy.flag_violation_count {
                    session.flagged = true;
                    session
                        .flag_reason
                        .get_or_insert_with(|| format!("multiple_violations:{}", kind));
                }
                Ok(suspended)
            })
            .await?;

        if suspended {
            tracing::warn!(
                session_id = %session.session_id,
                risk_score = session.risk_score,
                reason = session.flag_reason.as_deref().unwrap_or(""),
                "session suspended"
            );
            self.mirror_violations(&session).await;
        }
        Ok(session)
    }

    /// Client-driven liveness signal. A heartbeat against a suspended
    /// session is acknowledged but changes nothing: resuming requires an
    /// explicit review decision.
    pub async fn heartbeat(&self, req: &HeartbeatRequest) -> Result<ExamSession> {
        let current = self.store.get_session(&req.session_id).await?;
        Self::reject_terminal(&current)?;
        if current.status == SessionStatus::Suspended {
            return Ok(current);
        }

        let ip_address = req.ip_address.clone();
        let webcam = req.webcam.clone();
        let is_fullscreen = req.is_fullscreen;
        let policy = self.policy.clone();

        let (session, suspended) = self
            .mutate(&req.session_id, move |session| {
                Self::require_active(session)?;

                session.heartbeat_last_received = now();
                session.heartbeat_missed_count = 0;

                if let Some(ip) = &ip_address {
                    apply_ip_change(session, ip);
                }
                if let Some(frame) = &webcam {
                    apply_webcam_frame(session, frame);
                }
                if let Some(fullscreen) = is_fullscreen {
                    session.proctoring.is_fullscreen_mode = fullscreen;
                }

                Self::recompute_risk(session);
                Ok(Self::suspend_if_risky(session, policy.suspend_risk_threshold))
            })
            .await?;

        if suspended {
            tracing::warn!(
                session_id = %session.session_id,
                risk_score = session.risk_score,
                "session suspended during heartbeat"
            );
            self.mirror_violations(&session).await;
        }
        Ok(session)
    }

    /// Monitor-driven escalation for a session that stopped heartbeating.
    /// Idempotent across racing ticks: the CAS serializes increments and a
    /// tick that observes a non-active status is a no-op.
    pub async fn heartbeat_timeout(&self, session_id: &str) -> Result<ExamSession> {
        let mut tries = self.policy.store_retry_limit.max(1);
        loop {
            let mut session = self.store.get_session(session_id).await?;
            if session.status != SessionStatus::Active {
                return Ok(session);
            }

            session.heartbeat_missed_count += 1;
            let suspended = session.heartbeat_missed_count >= self.policy.heartbeat_max_missed;
            if suspended {
                Self::suspend(&mut session, HEARTBEAT_TIMEOUT_REASON);
            }
            session.updated_at = now();

            match self.store.update_session(&session).await {
                Ok(stored) => {
                    if suspended {
                        tracing::warn!(
                            session_id,
                            missed = stored.heartbeat_missed_count,
                            "session suspended after missed heartbeats"
                        );
                        self.mirror_violations(&stored).await;
                    } else {
                        tracing::debug!(
                            session_id,
                            missed = stored.heartbeat_missed_count,
                            "heartbeat missed"
                        );
                    }
                    return Ok(stored);
                }
                Err(e) if e.is_conflict() => {
                    tries -= 1;
                    if tries == 0 {
                        return Err(Error::Internal(format!(
                            "Gave up recording heartbeat timeout for session {}",
                            session_id
                        )));
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub async fn update_metrics(&self, req: &UpdateMetricsRequest) -> Result<ExamSession> {
        if req.counters.is_empty() {
            return Err(Error::BadRequest("No recognized metric in update".into()));
        }
        let delta = req.counters.clone();
        let policy = self.policy.clone();

        let (session, suspended) = self
            .mutate(&req.session_id, move |session| {
                Self::require_active(session)?;
                delta.apply_to(&mut session.proctoring);
                session.heartbeat_last_received = now();
                Self::recompute_risk(session);
                Ok(Self::suspend_if_risky(session, policy.suspend_risk_threshold))
            })
            .await?;

        if suspended {
            tracing::warn!(
                session_id = %session.session_id,
                risk_score = session.risk_score,
                "session suspended after metric update"
            );
            self.mirror_violations(&session).await;
        }
        Ok(session)
    }

    /// Closes the session: completed on a normal end, terminated when
    /// forced. Pre-empts any in-flight monitor timeout via the stored
    /// status.
    pub async fn end(
        &self,
        session_id: &str,
        reason: Option<String>,
        forced: bool,
        delay_result_processing: bool,
    ) -> Result<ExamSession> {
        let (session, _) = self
            .mutate(session_id, move |session| {
                Self::reject_terminal(session)?;
                let ts = now();
                session.status = if forced {
                    SessionStatus::Terminated
                } else {
                    SessionStatus::Completed
                };
                session.end_time = Some(ts);
                session.duration_secs = Some((ts - session.start_time).num_seconds().max(0));
                if let Some(reason) = &reason {
                    if forced {
                        session.flagged = true;
                        session.flag_reason = Some(reason.clone());
                    }
                }
                if delay_result_processing {
                    session.delayed_result_processing = true;
                    session.result_processing_delayed_until =
                        Some(ts + chrono::Duration::hours(1));
                }
                Self::recompute_risk(session);
                Ok(())
            })
            .await?;

        if !session.violations.is_empty() {
            self.mirror_violations(&session).await;
        }
        tracing::info!(
            session_id = %session.session_id,
            status = %session.status,
            duration_secs = session.duration_secs.unwrap_or(0),
            final_risk_score = session.risk_score,
            "exam session ended"
        );
        Ok(session)
    }

    /// Student appeal against a suspension; only valid from `suspended`.
    /// The request lands on the owning mock test, the session itself does
    /// not change.
    pub async fn request_unlock(
        &self,
        session_id: &str,
        user_id: &str,
        note: Option<String>,
    ) -> Result<UnlockRequest> {
        let session = self.store.get_session(session_id).await?;
        if session.user_id != user_id {
            return Err(Error::Forbidden(
                "Session belongs to another user".to_string(),
            ));
        }
        Self::reject_terminal(&session)?;
        if session.status != SessionStatus::Suspended {
            return Err(Error::Conflict(format!(
                "Unlock can only be requested for a suspended session (status: {})",
                session.status
            )));
        }
        let request = self
            .attempts
            .append_unlock_request(&session.mock_test_id, session_id, note)
            .await?;
        tracing::info!(
            session_id,
            request_id = %request.id,
            "unlock requested"
        );
        Ok(request)
    }

    /// Admin decision on an unlock request. Approval terminates the old
    /// session and opens a fresh one with clean counters; rejection leaves
    /// the old session terminated for good.
    pub async fn review_unlock(
        &self,
        mock_test_id: &str,
        request_id: &str,
        approve: bool,
        reviewer_id: &str,
        restore_time_secs: Option<i64>,
    ) -> Result<ReviewUnlockOutcome> {
        let (attempt, request) = self
            .attempts
            .resolve_unlock_request(
                mock_test_id,
                request_id,
                approve,
                reviewer_id,
                restore_time_secs,
            )
            .await?;

        // The appealed session is finished either way.
        let decision = if approve {
            "unlock_approved"
        } else {
            "unlock_rejected"
        };
        let prior = self.store.get_session(&request.session_id).await?;
        if !prior.status.is_terminal() {
            self.mutate(&request.session_id, move |session| {
                if session.status.is_terminal() {
                    return Ok(());
                }
                let ts = now();
                session.status = SessionStatus::Terminated;
                session.end_time = Some(ts);
                session.duration_secs = Some((ts - session.start_time).num_seconds().max(0));
                session.flag_reason = Some(decision.to_string());
                Ok(())
            })
            .await?;
        }

        let new_session = if approve {
            // Fresh identity and clean counters; only the browser
            // environment carries over.
            let browser_info = crate::models::exam_session::BrowserInfo {
                name: prior.proctoring.browser_name.clone(),
                version: prior.proctoring.browser_version.clone(),
                user_agent: prior.proctoring.user_agent.clone(),
                is_lockdown_browser: prior.proctoring.is_lockdown_browser,
                is_remote_monitor: prior.proctoring.is_remote_monitor,
                is_fullscreen_mode: prior.proctoring.is_fullscreen_mode,
                webcam_requested: prior.proctoring.webcam_enabled,
            };
            let session = ExamSession::new(
                generate_session_id(),
                prior.mock_test_id.clone(),
                attempt.user_id.clone(),
                prior.exam_type,
                &browser_info,
                prior.current_ip.clone(),
                now(),
            );
            Some(self.store.insert_session(&session).await?)
        } else {
            None
        };

        tracing::info!(
            mock_test_id,
            request_id,
            approve,
            new_session_id = new_session.as_ref().map(|s| s.session_id.as_str()),
            "unlock request reviewed"
        );
        Ok(ReviewUnlockOutcome {
            unlock_request: request,
            new_session,
        })
    }

    pub async fn list_flagged(
        &self,
        exam_type: Option<ExamType>,
        page: i64,
        limit: i64,
    ) -> Result<(Vec<ExamSession>, i64)> {
        self.store
            .list_flagged_sessions(exam_type, page.max(1), limit.clamp(1, 100))
            .await
    }

    pub async fn list_active(&self) -> Result<Vec<ExamSession>> {
        self.store.list_active_sessions().await
    }

    /// Admin review of a flagged session: may suspend, terminate, or
    /// resume it, and always records the review.
    pub async fn mark_reviewed(
        &self,
        session_id: &str,
        new_status: Option<SessionStatus>,
        notes: Option<String>,
    ) -> Result<ExamSession> {
        let (session, _) = self
            .mutate(session_id, move |session| {
                Self::reject_terminal(session)?;
                match new_status {
                    Some(SessionStatus::Active) => {
                        if session.status != SessionStatus::Suspended {
                            return Err(Error::Conflict(
                                "Only a suspended session can be resumed".to_string(),
                            ));
                        }
                        session.status = SessionStatus::Active;
                        // Give the client a full window before the monitor
                        // counts misses again.
                        session.heartbeat_last_received = now();
                        session.heartbeat_missed_count = 0;
                    }
                    Some(SessionStatus::Suspended) => {
                        Self::suspend(session, "admin_review");
                    }
                    Some(SessionStatus::Terminated) => {
                        let ts = now();
                        session.status = SessionStatus::Terminated;
                        session.end_time = Some(ts);
                        session.duration_secs =
                            Some((ts - session.start_time).num_seconds().max(0));
                        session.flagged = true;
                        session.flag_reason = Some("admin_review".to_string());
                    }
                    Some(SessionStatus::Completed) => {
                        return Err(Error::BadRequest(
                            "Review cannot mark a session completed".to_string(),
                        ));
                    }
                    None => {}
                }
                if let Some(notes) = &notes {
                    session.review_notes = Some(notes.clone());
                }
                session.reviewed_at = Some(now());
                Ok(())
            })
            .await?;
        tracing::info!(session_id, status = %session.status, "session reviewed");
        Ok(session)
    }

    async fn mirror_violations(&self, session: &ExamSession) {
        let note = session.flag_reason.clone();
        if let Err(e) = self
            .attempts
            .append_violation_mirror(
                &session.mock_test_id,
                &session.session_id,
                session.violations.len() as u32,
                note,
            )
            .await
        {
            // Best effort: the session record itself is authoritative.
            tracing::error!(
                session_id = %session.session_id,
                error = ?e,
                "failed to mirror violations onto mock test"
            );
        }
    }
}

/// Narrows a raw violation payload into a typed variant when possible.
fn narrow_details(raw: serde_json::Value) -> ViolationDetails {
    serde_json::from_value(raw.clone()).unwrap_or(ViolationDetails::Raw(raw))
}

fn same_subnet(a: &str, b: &str) -> bool {
    let prefix = |ip: &str| {
        ip.split('.')
            .take(3)
            .map(str::to_string)
            .collect::<Vec<_>>()
            .join(".")
    };
    prefix(a) == prefix(b)
}

fn apply_ip_change(session: &mut ExamSession, new_ip: &str) {
    let Some(old_ip) = session.current_ip.clone() else {
        session.current_ip = Some(new_ip.to_string());
        return;
    };
    if old_ip == new_ip {
        return;
    }

    session.ip_changes.push(IpChange {
        old_ip: old_ip.clone(),
        new_ip: new_ip.to_string(),
        timestamp: now(),
    });

    // A different subnet mid-exam reads as a relayed or moved connection.
    if !same_subnet(&old_ip, new_ip) {
        session.violations.push(Violation {
            kind: ViolationKind::SuspiciousNetwork,
            severity: ViolationSeverity::High,
            description: Some("IP address changed significantly during exam".to_string()),
            timestamp: now(),
            details: Some(ViolationDetails::IpChange {
                old_ip,
                new_ip: new_ip.to_string(),
            }),
        });
    }
    session.current_ip = Some(new_ip.to_string());
}

fn apply_webcam_frame(session: &mut ExamSession, frame: &WebcamFrame) {
    let counters = &mut session.proctoring;
    counters.face_detection_frames_analyzed += 1;
    counters.face_detection_accuracy = frame.confidence;

    let frames = counters.face_detection_frames_analyzed as f64;
    counters.average_confidence =
        (counters.average_confidence * (frames - 1.0) + frame.confidence) / frames;

    if !frame.face_detected && frame.confidence < LOW_CONFIDENCE_THRESHOLD {
        counters.webcam_interruptions += 1;
        session.violations.push(Violation {
            kind: ViolationKind::FaceNotDetected,
            severity: classify(&ViolationKind::FaceNotDetected),
            description: Some("Face not detected in webcam".to_string()),
            timestamp: now(),
            details: Some(ViolationDetails::Webcam {
                confidence: frame.confidence,
                face_count: frame.face_count,
            }),
        });
    }

    if frame.multiple_faces {
        session.violations.push(Violation {
            kind: ViolationKind::MultipleFaces,
            severity: classify(&ViolationKind::MultipleFaces),
            description: Some("Multiple faces detected in webcam".to_string()),
            timestamp: now(),
            details: Some(ViolationDetails::Webcam {
                confidence: frame.confidence,
                face_count: frame.face_count,
            }),
        });
        session.flagged = true;
        session
            .flag_reason
            .get_or_insert_with(|| "multiple_faces_detected".to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::exam_session::CounterDelta;
    use crate::models::mock_test::UnlockStatus;
    use crate::services::attempt_service::{AttemptPolicy, AttemptService};
    use crate::store::{MemoryStore, MockStore};

    fn harness() -> (SessionService, AttemptService) {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let attempts = AttemptService::new(store.clone(), AttemptPolicy::default());
        let sessions = SessionService::new(store, attempts.clone(), SessionPolicy::default());
        (sessions, attempts)
    }

    async fn ready_attempt(attempts: &AttemptService, user: &str) -> String {
        let attempt = attempts.initialize(user, ExamType::Jamb).await.unwrap();
        attempts
            .update_subject_combination(
                &attempt.id,
                user,
                vec![
                    "English Language".into(),
                    "Mathematics".into(),
                    "Physics".into(),
                    "Chemistry".into(),
                ],
            )
            .await
            .unwrap();
        attempt.id
    }

    fn create_request(mock_test_id: &str) -> CreateSessionRequest {
        CreateSessionRequest {
            mock_test_id: mock_test_id.to_string(),
            exam_type: ExamType::Jamb,
            browser_info: crate::models::exam_session::BrowserInfo {
                is_lockdown_browser: true,
                ..Default::default()
            },
            ip_address: Some("192.168.1.10".to_string()),
        }
    }

    fn violation(session_id: &str, kind: ViolationKind) -> RecordViolationRequest {
        RecordViolationRequest {
            session_id: session_id.to_string(),
            kind,
            description: None,
            details: None,
        }
    }

    #[tokio::test]
    async fn create_rejects_second_active_session() {
        let (sessions, attempts) = harness();
        let mt = ready_attempt(&attempts, "user-1").await;

        let first = sessions.create("user-1", &create_request(&mt)).await.unwrap();
        assert_eq!(first.status, SessionStatus::Active);
        // Session start moved the attempt in-progress.
        assert_eq!(
            attempts.get_owned(&mt, "user-1").await.unwrap().status,
            crate::models::mock_test::AttemptStatus::InProgress
        );

        let err = sessions
            .create("user-1", &create_request(&mt))
            .await
            .unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn concurrent_creates_yield_exactly_one_winner() {
        let (sessions, attempts) = harness();
        let mt = ready_attempt(&attempts, "user-1").await;

        let mut handles = Vec::new();
        for _ in 0..8 {
            let svc = sessions.clone();
            let req = create_request(&mt);
            handles.push(tokio::spawn(async move { svc.create("user-1", &req).await }));
        }
        let mut winners = 0;
        let mut conflicts = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => winners += 1,
                Err(e) if e.is_conflict() => conflicts += 1,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!(winners, 1);
        assert_eq!(conflicts, 7);
    }

    #[tokio::test]
    async fn create_requires_a_startable_attempt() {
        let (sessions, attempts) = harness();
        let attempt = attempts.initialize("user-1", ExamType::Jamb).await.unwrap();

        // No subject combination chosen yet: the create is refused and no
        // active session is left behind to block a retry.
        let err = sessions
            .create("user-1", &create_request(&attempt.id))
            .await
            .unwrap_err();
        assert!(err.is_conflict());
        assert!(sessions.list_active().await.unwrap().is_empty());

        attempts
            .update_subject_combination(
                &attempt.id,
                "user-1",
                vec![
                    "English Language".into(),
                    "Mathematics".into(),
                    "Physics".into(),
                    "Chemistry".into(),
                ],
            )
            .await
            .unwrap();
        let session = sessions
            .create("user-1", &create_request(&attempt.id))
            .await
            .unwrap();
        assert_eq!(session.status, SessionStatus::Active);
    }

    #[tokio::test]
    async fn attempt_racing_to_submitted_does_not_strand_a_session() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Mutex;

        use crate::models::mock_test::{AttemptStatus, MockTest};

        let mut ready = MockTest::new(
            "mt-1".into(),
            "user-1".into(),
            ExamType::Jamb,
            "J1B2C3D4E5F6".into(),
            now(),
        );
        ready.subject_combination = vec![
            "English Language".into(),
            "Mathematics".into(),
            "Physics".into(),
            "Chemistry".into(),
        ];
        let mut submitted = ready.clone();
        submitted.status = AttemptStatus::Submitted;

        // First read sees a startable draft, the second (inside
        // begin_for_session) sees the attempt already submitted.
        let mut mock = MockStore::new();
        let reads = AtomicUsize::new(0);
        mock.expect_get_attempt().returning(move |_| {
            if reads.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(ready.clone())
            } else {
                Ok(submitted.clone())
            }
        });

        let inserted: Arc<Mutex<Option<ExamSession>>> = Arc::new(Mutex::new(None));
        let slot = inserted.clone();
        mock.expect_insert_session().times(1).returning(move |s| {
            *slot.lock().unwrap() = Some(s.clone());
            Ok(s.clone())
        });
        let slot = inserted.clone();
        mock.expect_get_session()
            .returning(move |_| Ok(slot.lock().unwrap().clone().unwrap()));
        mock.expect_update_session().times(1).returning(|s| {
            assert_eq!(s.status, SessionStatus::Terminated);
            Ok(s.clone())
        });

        let store: Arc<dyn Store> = Arc::new(mock);
        let attempts = AttemptService::new(store.clone(), AttemptPolicy::default());
        let sessions = SessionService::new(store, attempts, SessionPolicy::default());

        let err = sessions
            .create("user-1", &create_request("mt-1"))
            .await
            .unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn critical_violation_suspends_immediately() {
        let (sessions, attempts) = harness();
        let mt = ready_attempt(&attempts, "user-1").await;
        let session = sessions.create("user-1", &create_request(&mt)).await.unwrap();

        let updated = sessions
            .record_violation(&violation(&session.session_id, ViolationKind::DeveloperTools))
            .await
            .unwrap();
        assert_eq!(updated.status, SessionStatus::Suspended);
        assert!(updated.flagged);
        assert!(updated
            .flag_reason
            .as_deref()
            .unwrap()
            .starts_with("critical_violation"));

        // The coarse mirror landed on the attempt.
        let attempt = attempts.get_owned(&mt, "user-1").await.unwrap();
        assert_eq!(attempt.violations.len(), 1);
        assert_eq!(attempt.violations[0].session_id, session.session_id);
    }

    #[tokio::test]
    async fn low_severity_violations_accumulate_without_suspending() {
        let (sessions, attempts) = harness();
        let mt = ready_attempt(&attempts, "user-1").await;
        let session = sessions.create("user-1", &create_request(&mt)).await.unwrap();

        let mut last = None;
        let mut previous_score = 0;
        for _ in 0..3 {
            let s = sessions
                .record_violation(&violation(&session.session_id, ViolationKind::RightClick))
                .await
                .unwrap();
            assert!(s.risk_score >= previous_score, "risk never decreases");
            previous_score = s.risk_score;
            last = Some(s);
        }
        let last = last.unwrap();
        assert_eq!(last.status, SessionStatus::Active);
        assert_eq!(last.violations.len(), 3);
    }

    #[tokio::test]
    async fn metrics_cross_threshold_and_suspend() {
        let (sessions, attempts) = harness();
        let mt = ready_attempt(&attempts, "user-1").await;
        let session = sessions.create("user-1", &create_request(&mt)).await.unwrap();

        // 30 (tab cap) + 25 (blur cap) < threshold: still active.
        let req = UpdateMetricsRequest {
            session_id: session.session_id.clone(),
            counters: CounterDelta {
                tab_switch_attempts: Some(4),
                window_blur_events: Some(10),
                ..Default::default()
            },
        };
        let s = sessions.update_metrics(&req).await.unwrap();
        assert_eq!(s.status, SessionStatus::Active);
        assert_eq!(s.risk_score, 55);

        // Developer-tools attempts push it over the suspend threshold.
        let req = UpdateMetricsRequest {
            session_id: session.session_id.clone(),
            counters: CounterDelta {
                developer_tools_attempts: Some(1),
                ..Default::default()
            },
        };
        let s = sessions.update_metrics(&req).await.unwrap();
        assert_eq!(s.status, SessionStatus::Suspended);
        assert_eq!(s.flag_reason.as_deref(), Some("risk_threshold_exceeded"));
    }

    #[tokio::test]
    async fn tab_switch_contribution_is_capped_below_threshold() {
        let (sessions, attempts) = harness();
        let mt = ready_attempt(&attempts, "user-1").await;
        let session = sessions.create("user-1", &create_request(&mt)).await.unwrap();

        let req = UpdateMetricsRequest {
            session_id: session.session_id.clone(),
            counters: CounterDelta {
                tab_switch_attempts: Some(4),
                ..Default::default()
            },
        };
        let s = sessions.update_metrics(&req).await.unwrap();
        assert_eq!(s.risk_score, 30);
        assert_eq!(s.status, SessionStatus::Active);
    }

    #[tokio::test]
    async fn heartbeat_resets_missed_count_and_is_idempotent() {
        let (sessions, attempts) = harness();
        let mt = ready_attempt(&attempts, "user-1").await;
        let session = sessions.create("user-1", &create_request(&mt)).await.unwrap();

        sessions.heartbeat_timeout(&session.session_id).await.unwrap();
        let s = sessions.get(&session.session_id).await.unwrap();
        assert_eq!(s.heartbeat_missed_count, 1);

        let hb = HeartbeatRequest {
            session_id: session.session_id.clone(),
            ip_address: None,
            webcam: None,
            is_fullscreen: None,
        };
        let s = sessions.heartbeat(&hb).await.unwrap();
        assert_eq!(s.heartbeat_missed_count, 0);
        let s = sessions.heartbeat(&hb).await.unwrap();
        assert_eq!(s.heartbeat_missed_count, 0);
    }

    #[tokio::test]
    async fn missed_heartbeats_suspend_at_the_cap() {
        let (sessions, attempts) = harness();
        let mt = ready_attempt(&attempts, "user-1").await;
        let session = sessions.create("user-1", &create_request(&mt)).await.unwrap();

        for _ in 0..3 {
            sessions.heartbeat_timeout(&session.session_id).await.unwrap();
        }
        let s = sessions.get(&session.session_id).await.unwrap();
        assert_eq!(s.status, SessionStatus::Suspended);
        assert_eq!(s.flag_reason.as_deref(), Some(HEARTBEAT_TIMEOUT_REASON));

        // Later ticks are no-ops, not errors.
        let s = sessions.heartbeat_timeout(&session.session_id).await.unwrap();
        assert_eq!(s.status, SessionStatus::Suspended);
        assert_eq!(s.heartbeat_missed_count, 3);
    }

    #[tokio::test]
    async fn heartbeat_does_not_resume_a_suspended_session() {
        let (sessions, attempts) = harness();
        let mt = ready_attempt(&attempts, "user-1").await;
        let session = sessions.create("user-1", &create_request(&mt)).await.unwrap();
        sessions
            .record_violation(&violation(&session.session_id, ViolationKind::DeveloperTools))
            .await
            .unwrap();

        let hb = HeartbeatRequest {
            session_id: session.session_id.clone(),
            ip_address: None,
            webcam: None,
            is_fullscreen: None,
        };
        let s = sessions.heartbeat(&hb).await.unwrap();
        assert_eq!(s.status, SessionStatus::Suspended);
    }

    #[tokio::test]
    async fn terminal_sessions_reject_all_mutation() {
        let (sessions, attempts) = harness();
        let mt = ready_attempt(&attempts, "user-1").await;
        let session = sessions.create("user-1", &create_request(&mt)).await.unwrap();
        sessions
            .end(&session.session_id, None, false, false)
            .await
            .unwrap();

        let before = sessions.get(&session.session_id).await.unwrap();
        assert_eq!(before.status, SessionStatus::Completed);

        let err = sessions
            .record_violation(&violation(&session.session_id, ViolationKind::TabSwitch))
            .await
            .unwrap_err();
        assert!(err.is_conflict());

        let hb = HeartbeatRequest {
            session_id: session.session_id.clone(),
            ip_address: None,
            webcam: None,
            is_fullscreen: None,
        };
        assert!(sessions.heartbeat(&hb).await.unwrap_err().is_conflict());

        let req = UpdateMetricsRequest {
            session_id: session.session_id.clone(),
            counters: CounterDelta {
                tab_switch_attempts: Some(1),
                ..Default::default()
            },
        };
        assert!(sessions.update_metrics(&req).await.unwrap_err().is_conflict());
        assert!(sessions
            .end(&session.session_id, None, true, false)
            .await
            .unwrap_err()
            .is_conflict());

        let after = sessions.get(&session.session_id).await.unwrap();
        assert_eq!(after.version, before.version, "no stored field changed");
    }

    #[tokio::test]
    async fn ip_change_across_subnets_logs_violation() {
        let (sessions, attempts) = harness();
        let mt = ready_attempt(&attempts, "user-1").await;
        let session = sessions.create("user-1", &create_request(&mt)).await.unwrap();

        // Same /24: recorded, no violation.
        let hb = HeartbeatRequest {
            session_id: session.session_id.clone(),
            ip_address: Some("192.168.1.22".to_string()),
            webcam: None,
            is_fullscreen: None,
        };
        let s = sessions.heartbeat(&hb).await.unwrap();
        assert_eq!(s.ip_changes.len(), 1);
        assert!(s.violations.is_empty());

        // Different subnet: violation logged.
        let hb = HeartbeatRequest {
            session_id: session.session_id.clone(),
            ip_address: Some("10.1.2.3".to_string()),
            webcam: None,
            is_fullscreen: None,
        };
        let s = sessions.heartbeat(&hb).await.unwrap();
        assert_eq!(s.ip_changes.len(), 2);
        assert_eq!(s.violations.len(), 1);
        assert_eq!(s.violations[0].kind, ViolationKind::SuspiciousNetwork);
        assert_eq!(s.current_ip.as_deref(), Some("10.1.2.3"));
    }

    #[tokio::test]
    async fn unlock_flow_creates_fresh_clean_session() {
        let (sessions, attempts) = harness();
        let mt = ready_attempt(&attempts, "user-1").await;
        let session = sessions.create("user-1", &create_request(&mt)).await.unwrap();
        sessions
            .record_violation(&violation(&session.session_id, ViolationKind::DeveloperTools))
            .await
            .unwrap();

        let request = sessions
            .request_unlock(&session.session_id, "user-1", Some("accidental".into()))
            .await
            .unwrap();
        assert_eq!(request.status, UnlockStatus::Pending);

        // Only one pending request per session.
        assert!(sessions
            .request_unlock(&session.session_id, "user-1", None)
            .await
            .unwrap_err()
            .is_conflict());

        let outcome = sessions
            .review_unlock(&mt, &request.id, true, "admin-1", None)
            .await
            .unwrap();
        let fresh = outcome.new_session.expect("approved review opens a session");
        assert_ne!(fresh.session_id, session.session_id);
        assert_eq!(fresh.status, SessionStatus::Active);
        assert_eq!(fresh.risk_score, 0);
        assert!(fresh.violations.is_empty());

        let old = sessions.get(&session.session_id).await.unwrap();
        assert_eq!(old.status, SessionStatus::Terminated);
    }

    #[tokio::test]
    async fn rejected_unlock_leaves_session_terminated() {
        let (sessions, attempts) = harness();
        let mt = ready_attempt(&attempts, "user-1").await;
        let session = sessions.create("user-1", &create_request(&mt)).await.unwrap();
        sessions
            .record_violation(&violation(&session.session_id, ViolationKind::DeveloperTools))
            .await
            .unwrap();
        let request = sessions
            .request_unlock(&session.session_id, "user-1", None)
            .await
            .unwrap();

        let outcome = sessions
            .review_unlock(&mt, &request.id, false, "admin-1", None)
            .await
            .unwrap();
        assert!(outcome.new_session.is_none());
        assert_eq!(outcome.unlock_request.status, UnlockStatus::Rejected);
        let old = sessions.get(&session.session_id).await.unwrap();
        assert_eq!(old.status, SessionStatus::Terminated);
    }

    #[tokio::test]
    async fn unlock_requires_suspended_session() {
        let (sessions, attempts) = harness();
        let mt = ready_attempt(&attempts, "user-1").await;
        let session = sessions.create("user-1", &create_request(&mt)).await.unwrap();
        let err = sessions
            .request_unlock(&session.session_id, "user-1", None)
            .await
            .unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn review_can_resume_a_suspended_session() {
        let (sessions, attempts) = harness();
        let mt = ready_attempt(&attempts, "user-1").await;
        let session = sessions.create("user-1", &create_request(&mt)).await.unwrap();
        for _ in 0..3 {
            sessions.heartbeat_timeout(&session.session_id).await.unwrap();
        }

        let resumed = sessions
            .mark_reviewed(
                &session.session_id,
                Some(SessionStatus::Active),
                Some("false positive".into()),
            )
            .await
            .unwrap();
        assert_eq!(resumed.status, SessionStatus::Active);
        assert_eq!(resumed.heartbeat_missed_count, 0);
        assert_eq!(resumed.review_notes.as_deref(), Some("false positive"));
    }

    #[tokio::test]
    async fn persistent_store_conflicts_surface_as_internal() {
        let mut mock = MockStore::new();
        let session = ExamSession::new(
            "SESS_x".into(),
            "mt-1".into(),
            "user-1".into(),
            ExamType::Jamb,
            &crate::models::exam_session::BrowserInfo::default(),
            None,
            now(),
        );
        let returned = session.clone();
        mock.expect_get_session()
            .returning(move |_| Ok(returned.clone()));
        mock.expect_update_session()
            .returning(|_| Err(Error::Conflict("stale".into())));

        let store: Arc<dyn Store> = Arc::new(mock);
        let attempts = AttemptService::new(store.clone(), AttemptPolicy::default());
        let sessions = SessionService::new(store, attempts, SessionPolicy::default());

        let err = sessions
            .record_violation(&violation("SESS_x", ViolationKind::TabSwitch))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
    }
}
