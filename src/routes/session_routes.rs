use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    Extension,
};
use validator::Validate;

use crate::dto::session_dto::{
    CreateSessionRequest, CreateSessionResponse, EndSessionRequest, EndSessionResponse,
    FlaggedSessionsQuery, FlaggedSessionsResponse, HeartbeatRequest, Pagination,
    RecordViolationRequest, ReviewSessionRequest, SebTokenQuery, SessionStateResponse,
    UpdateMetricsRequest,
};
use crate::error::{Error, Result};
use crate::middleware::auth::Claims;
use crate::models::exam_session::{ExamSession, SessionStatus};
use crate::AppState;

fn ensure_session_access(claims: &Claims, session: &ExamSession) -> Result<()> {
    if claims.is_admin() || session.user_id == claims.sub {
        Ok(())
    } else {
        Err(Error::Forbidden(
            "Session belongs to another user".to_string(),
        ))
    }
}

#[axum::debug_handler]
pub async fn create_session(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<CreateSessionRequest>,
) -> Result<Response> {
    req.validate()?;
    let session = state.sessions.create(&claims.sub, &req).await?;
    Ok((
        StatusCode::CREATED,
        Json(CreateSessionResponse {
            session_id: session.session_id.clone(),
            session,
        }),
    )
        .into_response())
}

#[axum::debug_handler]
pub async fn get_session(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(session_id): Path<String>,
) -> Result<Response> {
    let session = state.sessions.get(&session_id).await?;
    ensure_session_access(&claims, &session)?;
    Ok(Json(session).into_response())
}

#[axum::debug_handler]
pub async fn record_violation(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<RecordViolationRequest>,
) -> Result<Response> {
    req.validate()?;
    let session = state.sessions.get(&req.session_id).await?;
    ensure_session_access(&claims, &session)?;
    let session = state.sessions.record_violation(&req).await?;
    Ok(Json(SessionStateResponse::from(&session)).into_response())
}

#[axum::debug_handler]
pub async fn heartbeat(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<HeartbeatRequest>,
) -> Result<Response> {
    req.validate()?;
    let session = state.sessions.get(&req.session_id).await?;
    ensure_session_access(&claims, &session)?;
    let session = state.sessions.heartbeat(&req).await?;
    Ok(Json(SessionStateResponse::from(&session)).into_response())
}

#[axum::debug_handler]
pub async fn update_metrics(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<UpdateMetricsRequest>,
) -> Result<Response> {
    req.validate()?;
    let session = state.sessions.get(&req.session_id).await?;
    ensure_session_access(&claims, &session)?;
    let session = state.sessions.update_metrics(&req).await?;
    Ok(Json(SessionStateResponse::from(&session)).into_response())
}

#[axum::debug_handler]
pub async fn end_session(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<EndSessionRequest>,
) -> Result<Response> {
    req.validate()?;
    let session = state.sessions.get(&req.session_id).await?;
    ensure_session_access(&claims, &session)?;
    let session = state
        .sessions
        .end(
            &req.session_id,
            req.reason.clone(),
            req.forced,
            req.delay_result_processing,
        )
        .await?;
    Ok(Json(EndSessionResponse {
        status: session.status,
        duration_secs: session.duration_secs.unwrap_or(0),
        final_risk_score: session.risk_score,
    })
    .into_response())
}

#[axum::debug_handler]
pub async fn seb_config_url(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(session_id): Path<String>,
) -> Result<Response> {
    let session = state.sessions.get(&session_id).await?;
    ensure_session_access(&claims, &session)?;
    let issued = state.seb.issue_config_url(&session)?;
    Ok(Json(issued).into_response())
}

/// The signed URL itself is the credential here; this route carries no
/// bearer token because the lockdown browser fetches it before any login
/// state exists inside it.
#[axum::debug_handler]
pub async fn seb_config_download(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Query(token): Query<SebTokenQuery>,
) -> Result<Response> {
    state.seb.verify(&session_id, token.expires, &token.sig)?;
    let session = state.sessions.get(&session_id).await?;
    if session.status != SessionStatus::Active {
        return Err(Error::Conflict(format!(
            "SEB config is only served for an active session (status: {})",
            session.status
        )));
    }
    let plist = state.seb.build_seb_plist(&session);
    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "application/x-seb".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"exam-{}.seb\"", session.mock_test_id),
            ),
        ],
        plist,
    )
        .into_response())
}

#[axum::debug_handler]
pub async fn list_flagged(
    State(state): State<AppState>,
    Query(query): Query<FlaggedSessionsQuery>,
) -> Result<Response> {
    let page = query.page.unwrap_or(1).max(1);
    let limit = query.limit.unwrap_or(20).clamp(1, 100);
    let (sessions, total) = state.sessions.list_flagged(query.exam_type, page, limit).await?;
    Ok(Json(FlaggedSessionsResponse {
        sessions,
        pagination: Pagination {
            total,
            page,
            limit,
            pages: (total + limit - 1) / limit,
        },
    })
    .into_response())
}

#[axum::debug_handler]
pub async fn review_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(req): Json<ReviewSessionRequest>,
) -> Result<Response> {
    req.validate()?;
    let session = state
        .sessions
        .mark_reviewed(&session_id, req.status, req.notes.clone())
        .await?;
    Ok(Json(SessionStateResponse::from(&session)).into_response())
}
