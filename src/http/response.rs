//! JSON rejection responses.

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

/// Standard error envelope shared with the rest of the API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub success: bool,
    pub message: String,
}

impl ErrorBody {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

/// The client ran out of tokens.
#[derive(Debug, Clone, Copy)]
pub struct RateLimited {
    pub retry_after_secs: u64,
}

impl IntoResponse for RateLimited {
    fn into_response(self) -> Response {
        let body = ErrorBody::new(format!(
            "Rate limit exceeded. Please try again in {} seconds",
            self.retry_after_secs
        ));
        (
            StatusCode::TOO_MANY_REQUESTS,
            [(header::RETRY_AFTER, self.retry_after_secs.to_string())],
            Json(body),
        )
            .into_response()
    }
}

/// The client is on the deny list. No retry guidance is given.
#[derive(Debug, Clone, Copy)]
pub struct AccessDenied;

impl IntoResponse for AccessDenied {
    fn into_response(self) -> Response {
        (StatusCode::FORBIDDEN, Json(ErrorBody::new("Access denied"))).into_response()
    }
}
