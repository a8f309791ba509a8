//! Explicit processing requests and job administration.

use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::net::SocketAddr;

use super::{client_id, AppState, CredentialCheck, FeedCredentials};
use crate::auth::{digests_match, hash_secret};
use crate::database::{JobStatus, ProcessingJob};
use crate::error::AppError;
use crate::trigger::RequestOutcome;

const ADMIN_HEADER: &str = "x-admin-key";
const DEFAULT_HISTORY_LIMIT: i64 = 50;
const MAX_HISTORY_LIMIT: i64 = 500;

#[derive(Debug, Serialize)]
struct QueuedResponse {
    job_id: String,
    status: &'static str,
    trigger_source: &'static str,
    cancelled_jobs: usize,
}

/// POST /api/posts/:guid/process
pub async fn process_episode(
    State(state): State<AppState>,
    Path(guid): Path<String>,
    Query(creds): Query<FeedCredentials>,
    connect: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let client = client_id(connect.as_ref(), &headers);
    let mut check = CredentialCheck::resolve(&state, &client, &creds)?;
    let outcome = state
        .engine
        .request_manual(&guid, &check.outcome, Utc::now())?;
    check.settle(&state, &client, matches!(outcome, RequestOutcome::Unauthorized));
    request_response(&guid, outcome, check.retry_after)
}

/// POST /api/posts/:guid/reprocess
pub async fn reprocess_episode(
    State(state): State<AppState>,
    Path(guid): Path<String>,
    Query(creds): Query<FeedCredentials>,
    connect: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let client = client_id(connect.as_ref(), &headers);
    let mut check = CredentialCheck::resolve(&state, &client, &creds)?;
    let outcome = state
        .engine
        .request_reprocess(&guid, &check.outcome, Utc::now())?;
    check.settle(&state, &client, matches!(outcome, RequestOutcome::Unauthorized));
    request_response(&guid, outcome, check.retry_after)
}

fn request_response(
    guid: &str,
    outcome: RequestOutcome,
    locked_for: Option<u64>,
) -> Result<Response, AppError> {
    match outcome {
        RequestOutcome::Queued { job, cancelled } => Ok((
            StatusCode::ACCEPTED,
            Json(QueuedResponse {
                job_id: job.id,
                status: job.status.as_str(),
                trigger_source: job.trigger_source.as_str(),
                cancelled_jobs: cancelled,
            }),
        )
            .into_response()),
        RequestOutcome::AlreadyActive { job_id } => Ok((
            StatusCode::CONFLICT,
            Json(json!({
                "error": "Episode already has an active job",
                "job_id": job_id,
            })),
        )
            .into_response()),
        RequestOutcome::NotFound => Err(AppError::NotFound(format!("episode {}", guid))),
        RequestOutcome::Unauthorized => Err(match locked_for {
            Some(retry_after) => AppError::TooManyRequests { retry_after },
            None => AppError::Unauthorized("Invalid or missing feed token".to_string()),
        }),
        RequestOutcome::Forbidden => Err(AppError::Forbidden(
            "This token cannot start processing for this episode".to_string(),
        )),
        RequestOutcome::Disabled => Err(AppError::Conflict(
            "Processing is disabled for this episode".to_string(),
        )),
    }
}

/// GET /api/jobs/active
pub async fn active_jobs(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<ProcessingJob>>, AppError> {
    require_admin(&state, &headers)?;
    Ok(Json(state.db.list_active_jobs(100)?))
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<i64>,
    pub status: Option<String>,
}

/// GET /api/jobs?limit=&status=
///
/// Newest first, including terminal jobs and their error messages.
pub async fn job_history(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
    headers: HeaderMap,
) -> Result<Json<Vec<ProcessingJob>>, AppError> {
    require_admin(&state, &headers)?;
    let limit = query.limit.unwrap_or(DEFAULT_HISTORY_LIMIT).clamp(1, MAX_HISTORY_LIMIT);
    let status = query
        .status
        .as_deref()
        .map(parse_status_filter)
        .transpose()?;
    Ok(Json(state.db.list_jobs(limit, status)?))
}

fn parse_status_filter(raw: &str) -> Result<JobStatus, AppError> {
    [
        JobStatus::Pending,
        JobStatus::Running,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ]
    .into_iter()
    .find(|status| status.as_str() == raw)
    .ok_or_else(|| AppError::BadRequest(format!("unknown job status {:?}", raw)))
}

/// POST /api/jobs/:id/cancel
pub async fn cancel_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, AppError> {
    require_admin(&state, &headers)?;
    if state.engine.cancel_job(&job_id, Utc::now())? {
        Ok(Json(json!({ "job_id": job_id, "status": "cancelled" })))
    } else {
        Err(AppError::NotFound(format!("active job {}", job_id)))
    }
}

fn require_admin(state: &AppState, headers: &HeaderMap) -> Result<(), AppError> {
    let Some(expected) = state.admin_key.as_deref() else {
        return Err(AppError::NotFound("admin API is disabled".to_string()));
    };
    let provided = headers
        .get(ADMIN_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if provided.is_empty() || !digests_match(&hash_secret(provided), &hash_secret(expected)) {
        return Err(AppError::Unauthorized("Invalid admin key".to_string()));
    }
    Ok(())
}
