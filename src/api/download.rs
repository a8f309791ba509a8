//! Episode download routes.
//!
//! `HEAD` is a probe and never starts work. `GET` either streams the
//! processed file or answers 202 with a retry hint while it is prepared.

use axum::body::Body;
use axum::extract::{ConnectInfo, Path, Query, Request, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use serde::Serialize;
use std::net::SocketAddr;
use tower::ServiceExt;
use tower_http::services::ServeFile;

use super::{
    client_id, set_retry_after, AppState, CredentialCheck, FeedCredentials, LOCKED_OUT_MESSAGE,
};
use crate::auth::AuthOutcome;
use crate::error::AppError;
use crate::trigger::{Decision, RequestKind};

/// Body of every not-ready answer.
#[derive(Debug, Serialize)]
pub struct NotReadyBody {
    pub state: &'static str,
    pub retry_after_seconds: u64,
    pub message: &'static str,
}

#[derive(Debug, Serialize)]
struct UnauthorizedBody {
    state: &'static str,
    message: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after_seconds: Option<u64>,
}

/// GET /api/posts/:guid/download
pub async fn fetch_episode(
    State(state): State<AppState>,
    Path(guid): Path<String>,
    Query(creds): Query<FeedCredentials>,
    connect: Option<ConnectInfo<SocketAddr>>,
    request: Request,
) -> Result<Response, AppError> {
    handle(&state, RequestKind::Fetch, &guid, &creds, connect, request).await
}

/// HEAD /api/posts/:guid/download
pub async fn probe_episode(
    State(state): State<AppState>,
    Path(guid): Path<String>,
    Query(creds): Query<FeedCredentials>,
    connect: Option<ConnectInfo<SocketAddr>>,
    request: Request,
) -> Result<Response, AppError> {
    handle(&state, RequestKind::Probe, &guid, &creds, connect, request).await
}

/// GET /post/:guid.mp3
pub async fn fetch_legacy(
    State(state): State<AppState>,
    Path(file): Path<String>,
    Query(creds): Query<FeedCredentials>,
    connect: Option<ConnectInfo<SocketAddr>>,
    request: Request,
) -> Result<Response, AppError> {
    let guid = legacy_guid(&file)?;
    handle(&state, RequestKind::Fetch, guid, &creds, connect, request).await
}

/// HEAD /post/:guid.mp3
pub async fn probe_legacy(
    State(state): State<AppState>,
    Path(file): Path<String>,
    Query(creds): Query<FeedCredentials>,
    connect: Option<ConnectInfo<SocketAddr>>,
    request: Request,
) -> Result<Response, AppError> {
    let guid = legacy_guid(&file)?;
    handle(&state, RequestKind::Probe, guid, &creds, connect, request).await
}

/// GET|HEAD /api/posts/:guid/download/original
///
/// The unprocessed source file, for comparing against the cut. Read-only, so
/// combined tokens are accepted too.
pub async fn fetch_original(
    State(state): State<AppState>,
    Path(guid): Path<String>,
    Query(creds): Query<FeedCredentials>,
    connect: Option<ConnectInfo<SocketAddr>>,
    request: Request,
) -> Result<Response, AppError> {
    let client = client_id(connect.as_ref(), request.headers());
    let mut check = CredentialCheck::resolve(&state, &client, &creds)?;
    let episode = state.db.get_episode_by_guid(&guid)?;
    let denied = episode.is_some() && check.outcome == AuthOutcome::Unauthorized;
    check.settle(&state, &client, denied);

    let Some(episode) = episode else {
        return Err(AppError::NotFound(format!("episode {}", guid)));
    };
    let Some(ctx) = check.outcome.context() else {
        return Ok(unauthorized_response(check.retry_after));
    };
    if !ctx.can_read(episode.feed_id) {
        return Err(AppError::Forbidden(
            "This token cannot read this episode".to_string(),
        ));
    }
    let Some(source) = episode.source_audio() else {
        return Err(AppError::NotFound(format!("original audio for {}", guid)));
    };

    let response = ServeFile::new(source)
        .oneshot(request)
        .await
        .unwrap_or_else(|never| match never {});
    Ok(response.map(Body::new))
}

fn legacy_guid(file: &str) -> Result<&str, AppError> {
    file.strip_suffix(".mp3")
        .filter(|guid| !guid.is_empty())
        .ok_or_else(|| AppError::NotFound(file.to_string()))
}

async fn handle(
    state: &AppState,
    kind: RequestKind,
    guid: &str,
    creds: &FeedCredentials,
    connect: Option<ConnectInfo<SocketAddr>>,
    request: Request,
) -> Result<Response, AppError> {
    if kind == RequestKind::Probe {
        // Probes never look at credentials: no limiter entry, no token touch
        let decision = state
            .engine
            .decide(kind, guid, &AuthOutcome::Unauthorized, Utc::now())?;
        return match decision {
            Decision::NotFound => Err(AppError::NotFound(format!("episode {}", guid))),
            other => Ok(decision_response(&other)),
        };
    }

    let client = client_id(connect.as_ref(), request.headers());
    let mut check = CredentialCheck::resolve(state, &client, creds)?;

    let decision = state
        .engine
        .decide(kind, guid, &check.outcome, Utc::now())?;
    check.settle(state, &client, decision == Decision::Unauthorized);

    log::debug!("{:?} {} -> {}", kind, guid, decision.state());

    match decision {
        Decision::ServeArtifact { path } => {
            let response = ServeFile::new(&path)
                .oneshot(request)
                .await
                .unwrap_or_else(|never| match never {});
            Ok(response.map(Body::new))
        }
        Decision::Unauthorized => Ok(unauthorized_response(check.retry_after)),
        Decision::NotFound => Err(AppError::NotFound(format!("episode {}", guid))),
        other => Ok(decision_response(&other)),
    }
}

/// 204 for probes, 202 with `Retry-After` for every not-ready decision.
pub fn decision_response(decision: &Decision) -> Response {
    match decision.retry_after() {
        None => StatusCode::NO_CONTENT.into_response(),
        Some(retry_after) => (
            StatusCode::ACCEPTED,
            [
                (header::RETRY_AFTER, retry_after.to_string()),
                (header::CACHE_CONTROL, "no-store".to_string()),
            ],
            Json(NotReadyBody {
                state: decision.state(),
                retry_after_seconds: retry_after,
                message: decision.message(),
            }),
        )
            .into_response(),
    }
}

/// 401, or 429 with `Retry-After` while the client is locked out.
fn unauthorized_response(retry_after: Option<u64>) -> Response {
    let (status, message) = match retry_after {
        Some(_) => (StatusCode::TOO_MANY_REQUESTS, LOCKED_OUT_MESSAGE),
        None => (StatusCode::UNAUTHORIZED, Decision::Unauthorized.message()),
    };
    let body = Json(UnauthorizedBody {
        state: Decision::Unauthorized.state(),
        message,
        retry_after_seconds: retry_after,
    });
    let mut response = (status, [(header::CACHE_CONTROL, "no-store")], body).into_response();
    if let Some(wait) = retry_after {
        set_retry_after(&mut response, wait);
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trigger::NoTriggerReason;

    #[test]
    fn test_legacy_guid() {
        assert_eq!(legacy_guid("abc-123.mp3").unwrap(), "abc-123");
        assert!(legacy_guid("abc-123").is_err());
        assert!(legacy_guid(".mp3").is_err());
    }

    #[test]
    fn test_not_ready_decisions_carry_retry_after() {
        let decisions = [
            Decision::TriggerAccepted {
                retry_after: 60,
                job_id: "j".to_string(),
            },
            Decision::AlreadyInProgress {
                retry_after: 120,
                job_id: None,
            },
            Decision::CooldownActive { retry_after: 300 },
            Decision::NotReadyNoTrigger {
                retry_after: 1800,
                reason: NoTriggerReason::ReadOnlyToken,
            },
        ];
        for decision in decisions {
            let response = decision_response(&decision);
            assert_eq!(response.status(), StatusCode::ACCEPTED);
            assert_eq!(
                response.headers()[header::RETRY_AFTER],
                decision.retry_after().unwrap().to_string()
            );
            assert_eq!(response.headers()[header::CACHE_CONTROL], "no-store");
        }
    }

    #[test]
    fn test_probe_ack_is_no_content() {
        let response = decision_response(&Decision::ProbeAck);
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert!(response.headers().get(header::RETRY_AFTER).is_none());
    }

    #[test]
    fn test_unauthorized_lockout_header() {
        let locked = unauthorized_response(Some(8));
        assert_eq!(locked.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(locked.headers()[header::RETRY_AFTER], "8");

        let plain = unauthorized_response(None);
        assert_eq!(plain.status(), StatusCode::UNAUTHORIZED);
        assert!(plain.headers().get(header::RETRY_AFTER).is_none());
    }
}
