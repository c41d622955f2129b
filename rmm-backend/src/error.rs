//! Error types for the backend.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

/// Error types for model lifecycle, generation and prompt operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The name is not part of the most recent catalog scan.
    #[error("Model not found: {0}")]
    ModelNotFound(String),

    /// Generation was requested against a model with no loaded instance.
    #[error("Model not loaded: {0}")]
    ModelNotLoaded(String),

    /// The engine could not be instantiated (corrupt file, out of memory, ...).
    #[error("Engine initialization failed: {0}")]
    EngineInit(String),

    /// Fragment production failed. Surfaced in-band once streaming started.
    #[error("Stream error: {0}")]
    Stream(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Template not found: {0}")]
    TemplateNotFound(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Engine communication error: {0}")]
    Communication(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Stable machine-readable name used in HTTP error bodies.
    pub fn error_type(&self) -> &'static str {
        match self {
            Error::ModelNotFound(_) => "model_not_found",
            Error::ModelNotLoaded(_) => "model_not_loaded",
            Error::EngineInit(_) => "engine_init_failed",
            Error::Stream(_) => "stream_error",
            Error::InvalidRequest(_) => "invalid_request",
            Error::TemplateNotFound(_) => "template_not_found",
            Error::SessionNotFound(_) => "session_not_found",
            Error::Communication(_) => "communication_error",
            Error::Io(_) => "io_error",
            Error::Internal(_) => "internal_error",
        }
    }

    /// The underlying message without the variant prefix.
    pub fn message(&self) -> String {
        match self {
            Error::ModelNotFound(msg)
            | Error::ModelNotLoaded(msg)
            | Error::EngineInit(msg)
            | Error::Stream(msg)
            | Error::InvalidRequest(msg)
            | Error::TemplateNotFound(msg)
            | Error::SessionNotFound(msg)
            | Error::Communication(msg)
            | Error::Internal(msg) => msg.clone(),
            Error::Io(e) => e.to_string(),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Error::ModelNotFound(_) => StatusCode::NOT_FOUND,
            Error::ModelNotLoaded(_) => StatusCode::BAD_REQUEST,
            Error::EngineInit(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::Stream(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Error::TemplateNotFound(_) => StatusCode::NOT_FOUND,
            Error::SessionNotFound(_) => StatusCode::NOT_FOUND,
            Error::Communication(_) => StatusCode::BAD_GATEWAY,
            Error::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();
        self.into_response_with_status(status)
    }
}

impl Error {
    /// Render the standard error body under a caller-chosen status.
    pub fn into_response_with_status(self, status: StatusCode) -> Response {
        let body = Json(json!({
            "error": {
                "type": self.error_type(),
                "message": self.to_string()
            }
        }));

        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, Error>;
