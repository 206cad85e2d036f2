//! HTTP-facing error types.
//!
//! [`ApiError`] is the only error that knows about status codes.  Lower
//! layers raise their own precise errors (`RangeError`, `BackendError`,
//! `PoolError`) and handlers translate them here, so handlers can simply
//! return `Err(ApiError::ObjectNotFound { .. })`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

use crate::backend::BackendError;
use crate::pool::PoolError;

/// Generate a 16-character hex request ID.
pub fn generate_request_id() -> String {
    let bytes: [u8; 8] = rand::random();
    hex::encode(bytes).to_uppercase()
}

/// Failures surfaced to HTTP clients.
#[derive(Debug, Error)]
pub enum ApiError {
    /// No file record for the requested id.
    #[error("The requested object does not exist")]
    ObjectNotFound { id: String },

    /// The Range header starts at or past the end of the object.
    #[error("The requested range is not satisfiable")]
    UnsatisfiableRange { size: u64 },

    /// The pool has no connection to serve the request.
    #[error("No backend connection is available")]
    NoBackendAvailable,

    /// Missing or wrong admin credentials.
    #[error("Unauthorized")]
    Unauthorized,

    /// A request argument is invalid.
    #[error("{message}")]
    InvalidArgument { message: String },

    /// The upload exceeds the limit of the connection class.
    #[error("File size {size} exceeds the limit of {limit} bytes")]
    EntityTooLarge { size: u64, limit: u64 },

    /// Catch-all for unexpected internal errors. The message is surfaced.
    #[error("{0}")]
    InternalError(#[from] anyhow::Error),
}

/// JSON error body.
#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct ErrorBody {
    pub error: String,
    pub code: String,
    pub request_id: String,
}

impl ApiError {
    /// Stable machine-readable code string.
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::ObjectNotFound { .. } => "ObjectNotFound",
            ApiError::UnsatisfiableRange { .. } => "UnsatisfiableRange",
            ApiError::NoBackendAvailable => "NoBackendAvailable",
            ApiError::Unauthorized => "Unauthorized",
            ApiError::InvalidArgument { .. } => "InvalidArgument",
            ApiError::EntityTooLarge { .. } => "EntityTooLarge",
            ApiError::InternalError(_) => "InternalError",
        }
    }

    /// Return the appropriate HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::ObjectNotFound { .. } => StatusCode::NOT_FOUND,
            ApiError::UnsatisfiableRange { .. } => StatusCode::RANGE_NOT_SATISFIABLE,
            ApiError::NoBackendAvailable => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::InvalidArgument { .. } => StatusCode::BAD_REQUEST,
            ApiError::EntityTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<PoolError> for ApiError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::NoBackendAvailable => ApiError::NoBackendAvailable,
            other => ApiError::InternalError(other.into()),
        }
    }
}

impl From<BackendError> for ApiError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::NotFound(id) => ApiError::ObjectNotFound { id },
            other => ApiError::InternalError(other.into()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let request_id = generate_request_id();
        let status = self.status_code();
        let date = httpdate::fmt_http_date(std::time::SystemTime::now());

        // 416 carries the object size and no body.
        if let ApiError::UnsatisfiableRange { size } = self {
            return (
                status,
                [
                    ("content-range", format!("bytes */{size}")),
                    ("x-request-id", request_id),
                    ("date", date),
                    ("server", "chunkvault".to_string()),
                ],
            )
                .into_response();
        }

        let body = ErrorBody {
            error: self.to_string(),
            code: self.code().to_string(),
            request_id: request_id.clone(),
        };
        let mut response = (status, axum::Json(body)).into_response();
        let hdrs = response.headers_mut();
        if let Ok(v) = request_id.parse() {
            hdrs.insert("x-request-id", v);
        }
        if let Ok(v) = date.parse() {
            hdrs.insert("date", v);
        }
        hdrs.insert("server", axum::http::HeaderValue::from_static("chunkvault"));
        if matches!(status, StatusCode::UNAUTHORIZED) {
            hdrs.insert(
                "www-authenticate",
                axum::http::HeaderValue::from_static("Bearer"),
            );
        }
        response
    }
}
