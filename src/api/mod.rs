//! HTTP surface.
//!
//! Feed clients reach episodes through the download routes. Credentials
//! travel as `feed_token` / `feed_secret` query parameters because podcast
//! players cannot send custom headers.

pub mod download;
pub mod health;
pub mod jobs;
pub mod status;

use axum::extract::ConnectInfo;
use axum::http::{header, HeaderMap, HeaderValue};
use axum::response::Response;
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tower_http::trace::TraceLayer;

use crate::auth::{AuthFailureLimiter, AuthOutcome, Authorizer};
use crate::database::Database;
use crate::error::AppError;
use crate::trigger::TriggerEngine;

/// Application state shared across HTTP handlers
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<Database>,
    pub engine: Arc<TriggerEngine>,
    pub authorizer: Arc<Authorizer>,
    pub limiter: Arc<AuthFailureLimiter>,
    /// Key for `/api/jobs/*`. Those routes are hidden when unset.
    pub admin_key: Option<String>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route(
            "/api/posts/:guid/download",
            get(download::fetch_episode).head(download::probe_episode),
        )
        .route(
            "/api/posts/:guid/download/original",
            get(download::fetch_original),
        )
        .route(
            "/post/:file",
            get(download::fetch_legacy).head(download::probe_legacy),
        )
        .route("/api/trigger/status", get(status::trigger_status))
        .route("/api/posts/:guid/process", post(jobs::process_episode))
        .route("/api/posts/:guid/reprocess", post(jobs::reprocess_episode))
        .route("/api/jobs", get(jobs::job_history))
        .route("/api/jobs/active", get(jobs::active_jobs))
        .route("/api/jobs/:id/cancel", post(jobs::cancel_job))
        .merge(health::health_routes())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Default, Deserialize)]
pub struct FeedCredentials {
    pub feed_token: Option<String>,
    pub feed_secret: Option<String>,
}

impl FeedCredentials {
    fn presented(&self) -> bool {
        self.feed_token.as_deref().is_some_and(|t| !t.is_empty())
            && self.feed_secret.as_deref().is_some_and(|s| !s.is_empty())
    }
}

pub(crate) const LOCKED_OUT_MESSAGE: &str = "Too many failed credential attempts";

pub(crate) fn set_retry_after(response: &mut Response, seconds: u64) {
    response
        .headers_mut()
        .insert(header::RETRY_AFTER, HeaderValue::from(seconds));
}

/// Peer address, falling back to the first `X-Forwarded-For` hop when the
/// connection info is unavailable.
pub(crate) fn client_id(connect: Option<&ConnectInfo<SocketAddr>>, headers: &HeaderMap) -> String {
    if let Some(ConnectInfo(addr)) = connect {
        return addr.ip().to_string();
    }
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Credentials resolved through the failure limiter.
pub(crate) struct CredentialCheck {
    pub outcome: AuthOutcome,
    /// Set while the client is locked out.
    pub retry_after: Option<u64>,
    rejected: bool,
}

impl CredentialCheck {
    /// Locked-out clients are not verified at all.
    pub fn resolve(
        state: &AppState,
        client: &str,
        creds: &FeedCredentials,
    ) -> Result<Self, AppError> {
        if let Some(wait) = state.limiter.retry_after(client, Instant::now()) {
            log::debug!("Client {} locked out for {}s", client, wait);
            return Ok(Self {
                outcome: AuthOutcome::Unauthorized,
                retry_after: Some(wait),
                rejected: false,
            });
        }

        let outcome = state
            .authorizer
            .resolve(creds.feed_token.as_deref(), creds.feed_secret.as_deref())?;
        let rejected = outcome == AuthOutcome::Unauthorized && creds.presented();
        Ok(Self {
            outcome,
            retry_after: None,
            rejected,
        })
    }

    /// Report the result to the limiter once it is known whether the
    /// credential decided the request.
    pub fn settle(&mut self, state: &AppState, client: &str, denied: bool) {
        if self.retry_after.is_some() {
            return;
        }
        match self.outcome {
            AuthOutcome::Authorized(_) => state.limiter.register_success(client),
            AuthOutcome::Unauthorized if denied && self.rejected => {
                self.retry_after = state.limiter.register_failure(client, Instant::now());
            }
            AuthOutcome::Unauthorized => {}
        }
    }
}
