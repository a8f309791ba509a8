use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

/// Typed application error for the HTTP surface.
///
/// Store and collaborator failures are folded into these variants at the
/// handler boundary; the response body is always `{"error": "..."}`.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("{0}")]
    Database(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    Conflict(String),

    /// Client is locked out by the auth failure limiter.
    #[error("Too many failed credential attempts, retry in {retry_after}s")]
    TooManyRequests { retry_after: u64 },
}

impl AppError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::Forbidden(_) => StatusCode::FORBIDDEN,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::TooManyRequests { .. } => StatusCode::TOO_MANY_REQUESTS,
            AppError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            log::error!("Request failed: {}", self);
        }
        let mut response =
            (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response();
        if let AppError::TooManyRequests { retry_after } = self {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(retry_after));
        }
        response
    }
}

impl From<anyhow::Error> for AppError {
    fn from(e: anyhow::Error) -> Self {
        AppError::Database(e.to_string())
    }
}

impl From<AuthError> for AppError {
    fn from(e: AuthError) -> Self {
        match e {
            AuthError::Store(inner) => AppError::Database(inner.to_string()),
            other => AppError::Unauthorized(other.to_string()),
        }
    }
}

// ── Boundary errors ────────────────────────────────────────────────────────

/// Credential verification failures. Everything except `Store` is an
/// ordinary "not authorized" answer.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing feed_token or feed_secret")]
    MissingCredentials,

    #[error("unknown token")]
    UnknownToken,

    #[error("token revoked")]
    Revoked,

    #[error("secret mismatch")]
    SecretMismatch,

    #[error("token store unavailable: {0}")]
    Store(#[from] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum CutError {
    #[error("nothing left to keep after removing {removed:.1}s of {duration:.1}s")]
    NoKeepIntervals { duration: f64, removed: f64 },

    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("ffmpeg exited with {status}: {stderr}")]
    Ffmpeg { status: String, stderr: String },

    #[error("filtergraph failed ({primary}); fallback failed ({fallback})")]
    BothStrategiesFailed { primary: String, fallback: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum ClassifierError {
    #[error("classifier request failed: {0}")]
    Request(String),

    #[error("classifier returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("classifier response is not valid JSON: {0}")]
    Parse(String),

    #[error("classifier response rejected: {0}")]
    Invalid(String),
}

#[derive(Debug, Error)]
pub enum SegmenterError {
    #[error("audio file not found: {0}")]
    AudioMissing(String),

    #[error("model not found: {0}")]
    ModelMissing(String),

    #[error("failed to spawn whisper-cli: {0}")]
    Spawn(std::io::Error),

    #[error("whisper-cli failed with status: {0}")]
    Failed(String),

    #[error("failed to parse transcript: {0}")]
    Parse(String),

    #[error("invalid segment {sequence_num}: {reason}")]
    Invalid { sequence_num: i64, reason: String },

    #[error("transcription cancelled")]
    Cancelled,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// A pipeline stage failure, rendered as `"<stage>: <detail>"` on the job record.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("{stage}: {detail}")]
    Stage { stage: &'static str, detail: String },

    #[error("cancelled before {0}")]
    Cancelled(&'static str),
}

impl PipelineError {
    pub fn stage(stage: &'static str, detail: impl std::fmt::Display) -> Self {
        PipelineError::Stage {
            stage,
            detail: detail.to_string(),
        }
    }
}
