//! Ingress-side error taxonomy.
//!
//! Errors raised before a job reaches a worker: malformed requests and
//! admission failures. Worker-side failures travel back as failed
//! [`crate::compile::CompileResult`] values and are mapped by the HTTP
//! layer; both surfaces share the same wire shape `{error, message}`.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

/// Errors surfaced directly by the HTTP ingress.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Unparseable JSON, empty file set, unsafe or duplicate paths,
    /// undecodable base64.
    #[error("{0}")]
    BadRequest(String),

    /// No `.tex` source in the request.
    #[error("no LaTeX source (.tex) file found in request")]
    NoMainFile,

    /// The admission queue had no free slot.
    #[error("too many compilation requests, please try again in a moment")]
    QueueFull {
        /// Queue position a client would have held.
        queue_position: usize,
    },

    /// No slot opened within the bounded enqueue wait.
    #[error("could not enqueue request before the wait expired")]
    EnqueueTimeout,

    /// Anything unexpected on the ingress path.
    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    /// Stable error code used in response bodies.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "BAD_REQUEST",
            Self::NoMainFile => "NO_MAIN_FILE",
            Self::QueueFull { .. } => "QUEUE_FULL",
            Self::EnqueueTimeout => "ENQUEUE_TIMEOUT",
            Self::Internal(_) => "INTERNAL",
        }
    }

    /// The HTTP status this error maps to.
    #[must_use]
    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) | Self::NoMainFile => StatusCode::BAD_REQUEST,
            Self::QueueFull { .. } | Self::EnqueueTimeout => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Wire shape of ingress errors.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody {
    error: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    queue_position: Option<usize>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let queue_position = match &self {
            Self::QueueFull { queue_position } => Some(*queue_position),
            _ => None,
        };
        let body = ErrorBody {
            error: self.code(),
            message: self.to_string(),
            queue_position,
        };
        (self.status_code(), Json(body)).into_response()
    }
}
