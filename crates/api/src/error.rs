//! HTTP error envelope.
//!
//! Every error leaves the API as `{"error": {"code", "message"}}`. The
//! status mapping is part of the external contract: insufficient balance
//! is a 409 so callers can distinguish it from validation failures, and
//! transient storage trouble is a 503 so senders and the queue retry.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use qalam_points::PointsError;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "unauthorized", message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "bad_request", message)
    }
}

impl From<PointsError> for ApiError {
    fn from(e: PointsError) -> Self {
        let (status, code) = match &e {
            PointsError::InsufficientBalance { .. } => {
                (StatusCode::CONFLICT, "insufficient_balance")
            }
            PointsError::InvalidAmount(_) => (StatusCode::BAD_REQUEST, "invalid_amount"),
            PointsError::SignatureInvalid => (StatusCode::UNAUTHORIZED, "signature_invalid"),
            PointsError::StaleTimestamp => (StatusCode::UNAUTHORIZED, "stale_timestamp"),
            PointsError::InvalidPayload(_) => (StatusCode::BAD_REQUEST, "invalid_payload"),
            PointsError::UnknownProduct(_) => (StatusCode::BAD_REQUEST, "unknown_product"),
            PointsError::UserNotResolved(_) => (StatusCode::NOT_FOUND, "user_not_resolved"),
            PointsError::SchemaTooOld { .. } => (StatusCode::BAD_REQUEST, "schema_too_old"),
            PointsError::NotFound { .. } => (StatusCode::NOT_FOUND, "not_found"),
            PointsError::TransientStorage(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, "transient_storage")
            }
            PointsError::Storage(_) => (StatusCode::INTERNAL_SERVER_ERROR, "storage_error"),
        };

        // Storage detail stays in the logs, not in the response body.
        let message = match &e {
            PointsError::Storage(_) => {
                tracing::error!(error = %e, "Storage error surfaced to HTTP layer");
                "internal storage error".to_string()
            }
            PointsError::TransientStorage(_) => {
                tracing::warn!(error = %e, "Transient storage error surfaced to HTTP layer");
                "temporarily unavailable, retry".to_string()
            }
            other => other.to_string(),
        };

        Self {
            status,
            code,
            message,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(serde_json::json!({
            "error": {
                "code": self.code,
                "message": self.message,
            }
        }));
        (self.status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_matches_contract() {
        let e = ApiError::from(PointsError::InsufficientBalance {
            needed: 10,
            available: 5,
        });
        assert_eq!(e.status, StatusCode::CONFLICT);
        assert_eq!(e.code, "insufficient_balance");

        let e = ApiError::from(PointsError::SignatureInvalid);
        assert_eq!(e.status, StatusCode::UNAUTHORIZED);

        let e = ApiError::from(PointsError::StaleTimestamp);
        assert_eq!(e.status, StatusCode::UNAUTHORIZED);

        let e = ApiError::from(PointsError::InvalidPayload("bad".into()));
        assert_eq!(e.status, StatusCode::BAD_REQUEST);

        let e = ApiError::from(PointsError::TransientStorage("deadlock".into()));
        assert_eq!(e.status, StatusCode::SERVICE_UNAVAILABLE);

        let e = ApiError::from(PointsError::not_found("wallet", "u_1"));
        assert_eq!(e.status, StatusCode::NOT_FOUND);
    }

    #[test]
    fn storage_detail_is_redacted() {
        let e = ApiError::from(PointsError::Storage(
            "connection to 10.0.0.5:5432 refused".into(),
        ));
        assert_eq!(e.message, "internal storage error");
        assert!(!e.message.contains("10.0.0.5"));
    }
}
