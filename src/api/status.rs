use axum::extract::{ConnectInfo, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

use super::{
    client_id, set_retry_after, AppState, CredentialCheck, FeedCredentials, LOCKED_OUT_MESSAGE,
};
use crate::error::AppError;
use crate::trigger::StatusOutcome;

#[derive(Debug, Deserialize)]
pub struct StatusQuery {
    pub guid: Option<String>,
    #[serde(flatten)]
    pub creds: FeedCredentials,
}

/// Error answers share the `state` field with successful ones so pollers
/// can branch on a single key.
#[derive(Debug, Serialize)]
struct StatusErrorBody {
    state: &'static str,
    message: String,
}

fn status_error(status: StatusCode, state: &'static str, message: impl Into<String>) -> Response {
    (
        status,
        [(header::CACHE_CONTROL, "no-store")],
        Json(StatusErrorBody {
            state,
            message: message.into(),
        }),
    )
        .into_response()
}

/// GET /api/trigger/status?guid=...
///
/// Read-only view of an episode's processing state. Never queues work.
pub async fn trigger_status(
    State(state): State<AppState>,
    Query(query): Query<StatusQuery>,
    connect: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let Some(guid) = query
        .guid
        .as_deref()
        .map(str::trim)
        .filter(|g| !g.is_empty())
    else {
        return Ok(status_error(StatusCode::BAD_REQUEST, "error", "guid is required"));
    };

    let client = client_id(connect.as_ref(), &headers);
    let mut check = CredentialCheck::resolve(&state, &client, &query.creds)?;
    let outcome = state.engine.status(guid, &check.outcome)?;
    check.settle(&state, &client, matches!(outcome, StatusOutcome::Unauthorized));

    match outcome {
        StatusOutcome::NotFound => Ok(status_error(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("No episode with guid {}", guid),
        )),
        StatusOutcome::Unauthorized => match check.retry_after {
            Some(wait) => {
                let mut response =
                    status_error(StatusCode::TOO_MANY_REQUESTS, "error", LOCKED_OUT_MESSAGE);
                set_retry_after(&mut response, wait);
                Ok(response)
            }
            None => Ok(status_error(
                StatusCode::UNAUTHORIZED,
                "error",
                "Invalid or missing feed token",
            )),
        },
        StatusOutcome::Status(status) => {
            Ok(([(header::CACHE_CONTROL, "no-store")], Json(status)).into_response())
        }
    }
}
