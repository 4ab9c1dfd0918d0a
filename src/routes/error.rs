use axum::extract::multipart::MultipartError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::models::api::ErrorBody;
use crate::models::options::OptionsError;
use crate::models::result::{Failure, FailureKind};
use crate::services::dispatcher::SubmitError;

/// Structured error returned by every webservice endpoint.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub classification: String,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, classification: impl ToString, message: impl Into<String>) -> Self {
        Self {
            status,
            classification: classification.to_string(),
            message: message.into(),
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "invalid_request", message)
    }

    pub fn io(error: std::io::Error) -> Self {
        tracing::error!(error = %error, "Webservice I/O failure");
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, FailureKind::Io, error.to_string())
    }
}

pub fn status_for(kind: FailureKind) -> StatusCode {
    match kind {
        FailureKind::InvalidOptions => StatusCode::BAD_REQUEST,
        FailureKind::MalformedInput => StatusCode::UNPROCESSABLE_ENTITY,
        FailureKind::QueueFull | FailureKind::ResourceExhausted | FailureKind::Cancelled => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        FailureKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
        FailureKind::EngineCrash => StatusCode::BAD_GATEWAY,
        FailureKind::EngineUnavailable | FailureKind::Io => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<Failure> for ApiError {
    fn from(failure: Failure) -> Self {
        Self::new(status_for(failure.kind), failure.kind, failure.message)
    }
}

impl From<OptionsError> for ApiError {
    fn from(error: OptionsError) -> Self {
        Self::new(StatusCode::BAD_REQUEST, FailureKind::InvalidOptions, error.to_string())
    }
}

impl From<SubmitError> for ApiError {
    fn from(error: SubmitError) -> Self {
        let kind = match error {
            SubmitError::QueueFull => FailureKind::QueueFull,
            SubmitError::Closed => FailureKind::EngineUnavailable,
        };
        Self::new(status_for(kind), kind, error.to_string())
    }
}

impl From<MultipartError> for ApiError {
    fn from(error: MultipartError) -> Self {
        Self::new(error.status(), "invalid_request", error.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            classification: self.classification,
            message: self.message,
        };
        (self.status, Json(body)).into_response()
    }
}
