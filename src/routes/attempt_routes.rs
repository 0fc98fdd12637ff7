use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    Extension,
};
use validator::Validate;

use crate::dto::attempt_dto::{
    AttemptInfoQuery, InitializeAttemptRequest, RequestUnlockRequest, RequestUnlockResponse,
    ResultsResponse, ReviewUnlockRequest, ReviewUnlockResponse, SaveResponseRequest,
    SubmitAttemptRequest, SubmitAttemptResponse, UpdateProgressRequest, UpdateSubjectsRequest,
};
use crate::error::{Error, Result};
use crate::middleware::auth::Claims;
use crate::utils::time::now;
use crate::AppState;

#[axum::debug_handler]
pub async fn attempt_info(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Query(query): Query<AttemptInfoQuery>,
) -> Result<Response> {
    let info = state.attempts.attempt_info(&claims.sub, query.exam_type).await?;
    Ok(Json(info).into_response())
}

#[axum::debug_handler]
pub async fn initialize_attempt(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<InitializeAttemptRequest>,
) -> Result<Response> {
    req.validate()?;
    let attempt = state.attempts.initialize(&claims.sub, req.exam_type).await?;
    Ok((StatusCode::CREATED, Json(attempt)).into_response())
}

#[axum::debug_handler]
pub async fn get_attempt(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<String>,
) -> Result<Response> {
    let attempt = state.attempts.get_owned(&id, &claims.sub).await?;
    Ok(Json(attempt).into_response())
}

#[axum::debug_handler]
pub async fn update_subjects(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<String>,
    Json(req): Json<UpdateSubjectsRequest>,
) -> Result<Response> {
    req.validate()?;
    let attempt = state
        .attempts
        .update_subject_combination(&id, &claims.sub, req.subjects)
        .await?;
    Ok(Json(attempt).into_response())
}

#[axum::debug_handler]
pub async fn start_attempt(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<String>,
) -> Result<Response> {
    let attempt = state.attempts.start(&id, &claims.sub).await?;
    Ok(Json(attempt).into_response())
}

#[axum::debug_handler]
pub async fn save_response(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<String>,
    Json(req): Json<SaveResponseRequest>,
) -> Result<Response> {
    req.validate()?;
    let attempt = state.attempts.save_response(&id, &claims.sub, req).await?;
    Ok(Json(attempt).into_response())
}

#[axum::debug_handler]
pub async fn update_progress(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<String>,
    Json(req): Json<UpdateProgressRequest>,
) -> Result<Response> {
    req.validate()?;
    let attempt = state
        .attempts
        .update_progress(
            &id,
            &claims.sub,
            req.current_subject,
            req.completed_subject,
            req.time_remaining_secs,
        )
        .await?;
    Ok(Json(attempt).into_response())
}

#[axum::debug_handler]
pub async fn submit_attempt(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<String>,
    Json(req): Json<SubmitAttemptRequest>,
) -> Result<Response> {
    let attempt = state
        .attempts
        .submit(&id, &claims.sub, req.delay_result_processing)
        .await?;
    Ok(Json(SubmitAttemptResponse {
        exam_id: attempt.exam_id.clone(),
        status: attempt.status,
        submitted_at: attempt.submitted_at.unwrap_or_else(now),
        results_available_at: attempt.results_available_at,
        next_attempt_date: attempt.next_attempt_date,
    })
    .into_response())
}

#[axum::debug_handler]
pub async fn request_unlock(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<String>,
    Json(req): Json<RequestUnlockRequest>,
) -> Result<Response> {
    req.validate()?;
    let session = state.sessions.get(&req.session_id).await?;
    if session.mock_test_id != id {
        return Err(Error::BadRequest(
            "Session does not belong to this mock test".to_string(),
        ));
    }
    let unlock_request = state
        .sessions
        .request_unlock(&req.session_id, &claims.sub, req.note)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(RequestUnlockResponse { unlock_request }),
    )
        .into_response())
}

/// Public result lookup by exam ID. The ID format is checked before any
/// storage access so malformed probes fail fast.
#[axum::debug_handler]
pub async fn check_results(
    State(state): State<AppState>,
    Path(exam_id): Path<String>,
) -> Result<Response> {
    let attempt = state.attempts.check_results(&exam_id).await?;
    Ok(Json(ResultsResponse::from(&attempt)).into_response())
}

#[axum::debug_handler]
pub async fn review_unlock(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path((id, request_id)): Path<(String, String)>,
    Json(req): Json<ReviewUnlockRequest>,
) -> Result<Response> {
    req.validate()?;
    let outcome = state
        .sessions
        .review_unlock(
            &id,
            &request_id,
            req.approve,
            &claims.sub,
            req.restore_time_secs,
        )
        .await?;
    Ok(Json(ReviewUnlockResponse {
        unlock_request: outcome.unlock_request,
        new_session_id: outcome.new_session.map(|s| s.session_id),
    })
    .into_response())
}
