//! HTTP rendering of gate decisions.

use crate::security::GateError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde_json::json;

impl GateError {
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::RateLimited { .. } | Self::Locked { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::InvalidCredentials | Self::Unauthenticated | Self::SessionExpired => {
                StatusCode::UNAUTHORIZED
            }
            Self::Csrf | Self::Forbidden => StatusCode::FORBIDDEN,
            Self::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for GateError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match self {
            Self::BadRequest(message) => json!({ "message": message }),
            Self::RateLimited { remaining_seconds } => json!({
                "message": format!(
                    "Too many requests from your network. Please wait {remaining_seconds} seconds and try again."
                ),
                "remainingSeconds": remaining_seconds,
            }),
            Self::Locked { remaining_seconds } => json!({
                "message": format!(
                    "Account temporarily locked due to too many failed attempts. Please try again in {} minutes.",
                    remaining_seconds.div_ceil(60)
                ),
                "remainingSeconds": remaining_seconds,
            }),
            Self::InvalidCredentials => json!({ "message": "Invalid credentials" }),
            Self::Unauthenticated => json!({ "message": "Authentication required" }),
            Self::SessionExpired => json!({ "message": "Refresh token is missing or expired" }),
            Self::Csrf => json!({ "message": "CSRF validation failed" }),
            Self::Forbidden => json!({ "message": "Access denied" }),
            Self::Internal { correlation_id } => json!({
                "message": "Internal server error",
                "correlationId": correlation_id.to_string(),
            }),
        };
        (status, Json(body)).into_response()
    }
}
