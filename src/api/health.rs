use axum::extract::State;
use axum::{routing::get, Json, Router};
use serde::Serialize;

use super::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub module: &'static str,
    pub version: &'static str,
    pub active_jobs: Option<usize>,
}

/// GET /health
///
/// No credentials. `active_jobs` is null when the store cannot be read.
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let active_jobs = match state.db.list_active_jobs(1000) {
        Ok(jobs) => Some(jobs.len()),
        Err(e) => {
            log::warn!("Health check could not read jobs: {}", e);
            None
        }
    };
    Json(HealthResponse {
        status: if active_jobs.is_some() { "ok" } else { "degraded" },
        module: env!("CARGO_PKG_NAME"),
        version: env!("CARGO_PKG_VERSION"),
        active_jobs,
    })
}

pub fn health_routes() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}
