//! Internal bearer-token authentication for Axum
//!
//! Every route except the webhook receiver and the health check sits behind a
//! single shared token. Webhook deliveries authenticate with their own HMAC
//! signature instead, so the internal token never leaves our infrastructure.

use axum::{
    extract::{Request, State},
    http::{header::AUTHORIZATION, HeaderMap},
    middleware::Next,
    response::{IntoResponse, Response},
};
use subtle::ConstantTimeEq;

use crate::{error::ApiError, state::AppState};

/// Middleware that requires the internal service token
pub async fn require_internal_token(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();

    let Some(token) = extract_bearer_token(&request) else {
        tracing::warn!(path = %path, "Rejected request without bearer token");
        return ApiError::unauthorized("missing bearer token").into_response();
    };

    if !token_matches(&token, &state.config.internal_api_token) {
        tracing::warn!(path = %path, "Rejected request with invalid internal token");
        return ApiError::unauthorized("invalid internal token").into_response();
    }

    next.run(request).await
}

fn extract_bearer_token(request: &Request) -> Option<String> {
    request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(|t| t.trim().to_string())
}

/// Constant-time token comparison
fn token_matches(provided: &str, expected: &str) -> bool {
    bool::from(provided.as_bytes().ct_eq(expected.as_bytes()))
}

/// Extract the client IP from proxy headers
///
/// X-Forwarded-For may contain a chain; the first entry is the original
/// client. Falls back to X-Real-IP.
pub fn extract_client_ip(headers: &HeaderMap) -> Option<String> {
    if let Some(xff) = headers.get("X-Forwarded-For") {
        if let Ok(xff_str) = xff.to_str() {
            return xff_str.split(',').next().map(|s| s.trim().to_string());
        }
    }
    if let Some(real_ip) = headers.get("X-Real-IP") {
        if let Ok(ip) = real_ip.to_str() {
            return Some(ip.to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn token_comparison_requires_exact_match() {
        assert!(token_matches("sekrit-internal-token", "sekrit-internal-token"));
        assert!(!token_matches("sekrit-internal-token", "sekrit-internal-tokeN"));
        assert!(!token_matches("short", "sekrit-internal-token"));
        assert!(!token_matches("", "sekrit-internal-token"));
    }

    #[test]
    fn bearer_extraction_strips_prefix_and_whitespace() {
        let request = Request::builder()
            .header(AUTHORIZATION, "Bearer  abc123 ")
            .body(axum::body::Body::empty())
            .unwrap();
        assert_eq!(extract_bearer_token(&request).as_deref(), Some("abc123"));

        let no_prefix = Request::builder()
            .header(AUTHORIZATION, "abc123")
            .body(axum::body::Body::empty())
            .unwrap();
        assert_eq!(extract_bearer_token(&no_prefix), None);

        let missing = Request::builder().body(axum::body::Body::empty()).unwrap();
        assert_eq!(extract_bearer_token(&missing), None);
    }

    #[test]
    fn client_ip_prefers_forwarded_for_chain_head() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "X-Forwarded-For",
            HeaderValue::from_static("203.0.113.7, 10.0.0.1, 10.0.0.2"),
        );
        headers.insert("X-Real-IP", HeaderValue::from_static("10.0.0.1"));
        assert_eq!(extract_client_ip(&headers).as_deref(), Some("203.0.113.7"));
    }

    #[test]
    fn client_ip_falls_back_to_real_ip() {
        let mut headers = HeaderMap::new();
        headers.insert("X-Real-IP", HeaderValue::from_static("198.51.100.4"));
        assert_eq!(extract_client_ip(&headers).as_deref(), Some("198.51.100.4"));

        let empty = HeaderMap::new();
        assert_eq!(extract_client_ip(&empty), None);
    }
}
