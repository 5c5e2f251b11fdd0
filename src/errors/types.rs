use std::fmt;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

/// Top-level error type for the proxy.
///
/// Each variant corresponds to one class in the error taxonomy: config load
/// failures are fatal at startup, upstream/drive failures are routed through
/// the configured `proxy-error-strategy`, and decode/cache-miss/playlist-miss
/// failures carry their own fixed HTTP status.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("upstream transport error: {0}")]
    UpstreamTransport(#[from] reqwest::Error),

    #[error("upstream returned status {status}: {body}")]
    UpstreamStatus { status: u16, body: String },

    #[error("drive resource missing: {0}")]
    DriveResourceMissing(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("cache miss, retry")]
    CacheMissRetry,

    #[error("playlist miss: {0}")]
    PlaylistMiss(String),

    #[error("auxiliary progress failed: {0}")]
    Auxiliary(String),

    #[error("too many redirects: {0}")]
    TooManyRedirects(String),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn configuration(msg: impl fmt::Display) -> Self {
        Self::Configuration(msg.to_string())
    }

    pub fn upstream_status(status: u16, body: impl Into<String>) -> Self {
        Self::UpstreamStatus {
            status,
            body: body.into(),
        }
    }

    pub fn drive_resource_missing(msg: impl fmt::Display) -> Self {
        Self::DriveResourceMissing(msg.to_string())
    }

    pub fn decode(msg: impl fmt::Display) -> Self {
        Self::Decode(msg.to_string())
    }

    pub fn playlist_miss(msg: impl fmt::Display) -> Self {
        Self::PlaylistMiss(msg.to_string())
    }

    pub fn auxiliary(msg: impl fmt::Display) -> Self {
        Self::Auxiliary(msg.to_string())
    }

    pub fn internal(msg: impl fmt::Display) -> Self {
        Self::Internal(msg.to_string())
    }

    /// Whether a response built around this error is safe to cache.
    ///
    /// Never true: every branch of the taxonomy represents a failure and
    /// failures are never cached (§4.F "Contract on responses").
    pub fn cacheable(&self) -> bool {
        false
    }

    /// Maps this error to the HTTP status a handler should answer with.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Configuration(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::UpstreamTransport(_) => StatusCode::BAD_GATEWAY,
            Self::UpstreamStatus { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            Self::DriveResourceMissing(_) => StatusCode::BAD_GATEWAY,
            Self::Decode(_) => StatusCode::BAD_REQUEST,
            Self::CacheMissRetry => StatusCode::SERVICE_UNAVAILABLE,
            Self::PlaylistMiss(_) => StatusCode::NOT_FOUND,
            Self::Auxiliary(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::TooManyRedirects(_) => StatusCode::BAD_GATEWAY,
            Self::Json(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        tracing::warn!(error = %self, status = status.as_u16(), "request failed");
        (status, self.to_string()).into_response()
    }
}

impl From<figment::Error> for AppError {
    fn from(err: figment::Error) -> Self {
        Self::Configuration(err.to_string())
    }
}
