use std::time::Duration;

use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

#[derive(Debug)]
pub enum ApiError {
    /// A required body field is absent.
    MissingField(String),
    /// A body field has the wrong type.
    InvalidField(String),
    /// Unparseable body or wrong content type.
    InvalidRequest(String),
    GenerationFailed(String),
    Timeout(Duration),
}

impl ApiError {
    pub fn from_rejection(rejection: JsonRejection) -> Self {
        match rejection {
            JsonRejection::JsonDataError(e) => {
                let message = e.body_text();
                if message.contains("missing field") {
                    ApiError::MissingField(message)
                } else {
                    ApiError::InvalidField(message)
                }
            }
            other => ApiError::InvalidRequest(other.body_text()),
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Serialize)]
struct ErrorBody {
    message: String,
    r#type: &'static str,
    code: Option<&'static str>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_type, code, message) = match self {
            ApiError::MissingField(msg) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                "invalid_request_error",
                Some("missing_field"),
                msg,
            ),
            ApiError::InvalidField(msg) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                "invalid_request_error",
                Some("invalid_type"),
                msg,
            ),
            ApiError::InvalidRequest(msg) => {
                (StatusCode::BAD_REQUEST, "invalid_request_error", None, msg)
            }
            ApiError::GenerationFailed(msg) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "server_error", None, msg)
            }
            ApiError::Timeout(limit) => (
                StatusCode::GATEWAY_TIMEOUT,
                "timeout",
                Some("generation_timeout"),
                format!("generation did not finish within {}s", limit.as_secs()),
            ),
        };

        let body = ErrorResponse {
            error: ErrorBody {
                message,
                r#type: error_type,
                code,
            },
        };

        (status, axum::Json(body)).into_response()
    }
}
