use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use validator::Validate;

use crate::models::exam_session::{
    BrowserInfo, CounterDelta, ExamSession, ExamType, SessionStatus, ViolationKind,
};

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CreateSessionRequest {
    #[validate(length(min = 1))]
    pub mock_test_id: String,
    pub exam_type: ExamType,
    #[serde(default)]
    pub browser_info: BrowserInfo,
    pub ip_address: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CreateSessionResponse {
    pub session_id: String,
    pub session: ExamSession,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct RecordViolationRequest {
    #[validate(length(min = 1))]
    pub session_id: String,
    pub kind: ViolationKind,
    #[validate(length(max = 512))]
    pub description: Option<String>,
    /// Raw payload; the service narrows it to a typed variant when it
    /// recognizes the kind.
    pub details: Option<JsonValue>,
}

#[derive(Debug, Serialize)]
pub struct SessionStateResponse {
    pub status: SessionStatus,
    pub risk_score: u8,
    pub flagged: bool,
    pub flag_reason: Option<String>,
}

impl From<&ExamSession> for SessionStateResponse {
    fn from(session: &ExamSession) -> Self {
        Self {
            status: session.status,
            risk_score: session.risk_score,
            flagged: session.flagged,
            flag_reason: session.flag_reason.clone(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebcamFrame {
    #[serde(default)]
    pub face_detected: bool,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub multiple_faces: bool,
    pub face_count: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct HeartbeatRequest {
    #[validate(length(min = 1))]
    pub session_id: String,
    pub ip_address: Option<String>,
    pub webcam: Option<WebcamFrame>,
    pub is_fullscreen: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct UpdateMetricsRequest {
    #[validate(length(min = 1))]
    pub session_id: String,
    #[serde(flatten)]
    pub counters: CounterDelta,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct EndSessionRequest {
    #[validate(length(min = 1))]
    pub session_id: String,
    #[validate(length(max = 256))]
    pub reason: Option<String>,
    #[serde(default)]
    pub forced: bool,
    #[serde(default)]
    pub delay_result_processing: bool,
}

#[derive(Debug, Serialize)]
pub struct EndSessionResponse {
    pub status: SessionStatus,
    pub duration_secs: i64,
    pub final_risk_score: u8,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FlaggedSessionsQuery {
    pub exam_type: Option<ExamType>,
    pub page: Option<i64>,
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct FlaggedSessionsResponse {
    pub sessions: Vec<ExamSession>,
    pub pagination: Pagination,
}

#[derive(Debug, Serialize)]
pub struct Pagination {
    pub total: i64,
    pub page: i64,
    pub limit: i64,
    pub pages: i64,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct ReviewSessionRequest {
    pub status: Option<SessionStatus>,
    #[validate(length(max = 1024))]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SebTokenQuery {
    pub expires: i64,
    pub sig: String,
}

#[derive(Debug, Serialize)]
pub struct SebConfigUrlResponse {
    pub url: String,
    pub expires: i64,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub storage: &'static str,
    pub timestamp: DateTime<Utc>,
}
