//! Error types for the proxy.
//!
//! One taxonomy serves both dialects. Every variant knows the HTTP status and
//! the `error.type` string it renders as, so handlers can simply return
//! `Result<Response>` and let [`IntoResponse`] do the mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ProxyError {
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Malformed request: {message}")]
    MalformedRequest { message: String },

    #[error("Not found: {path}")]
    NotFound { path: String },

    #[error("Upstream unavailable: {message}")]
    UpstreamUnavailable { message: String },

    #[error("No upstream connection available after {waited_ms}ms")]
    PoolExhausted { waited_ms: u128 },

    #[error("Stream interrupted: {message}")]
    StreamInterrupted { message: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("{0}")]
    Other(String),
}

impl ProxyError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedRequest {
            message: msg.into(),
        }
    }

    pub fn not_found(path: impl Into<String>) -> Self {
        Self::NotFound { path: path.into() }
    }

    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::UpstreamUnavailable {
            message: msg.into(),
        }
    }

    pub fn interrupted(msg: impl Into<String>) -> Self {
        Self::StreamInterrupted {
            message: msg.into(),
        }
    }

    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// Status code the client sees for this error.
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::MalformedRequest { .. } => StatusCode::BAD_REQUEST,
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::UpstreamUnavailable { .. } | Self::StreamInterrupted { .. } => {
                StatusCode::BAD_GATEWAY
            }
            Self::PoolExhausted { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::Config { .. } | Self::Http(_) | Self::Toml(_) | Self::Other(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Value of `error.type` in the rendered body.
    #[must_use]
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::MalformedRequest { .. } => "invalid_request_error",
            Self::NotFound { .. } => "not_found_error",
            Self::UpstreamUnavailable { .. } => "upstream_unavailable",
            Self::PoolExhausted { .. } => "pool_exhausted",
            Self::StreamInterrupted { .. } => "stream_interrupted",
            _ => "internal_error",
        }
    }

    /// The uniform JSON error body: `{"error": {"type": .., "message": ..}}`.
    #[must_use]
    pub fn to_body(&self) -> serde_json::Value {
        serde_json::json!({
            "error": {
                "type": self.error_type(),
                "message": self.to_string(),
            }
        })
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        (self.status_code(), Json(self.to_body())).into_response()
    }
}

pub type Result<T> = std::result::Result<T, ProxyError>;
