//! PayNow webhook receiver
//!
//! Authenticated by the HMAC signature on each delivery, not the internal
//! bearer token. The raw body bytes must reach the verifier untouched, so
//! this handler takes `Bytes` instead of a typed extractor.

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use qalam_points::IngestOutcome;

use crate::{auth::extract_client_ip, error::ApiError, state::AppState};

const SIGNATURE_HEADER: &str = "paynow-signature";
const TIMESTAMP_HEADER: &str = "paynow-timestamp";

pub async fn receive_paynow(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let timestamp = header_str(&headers, TIMESTAMP_HEADER);
    let signature = header_str(&headers, SIGNATURE_HEADER);
    let client_ip = extract_client_ip(&headers);

    match state
        .points
        .webhooks
        .ingest(&body, timestamp, signature, client_ip.as_deref())
        .await
    {
        Ok(outcome) => ingest_response(outcome),
        Err(e) => ApiError::from(e).into_response(),
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Map an ingest outcome to its HTTP response
///
/// Terminal failures return 200: the delivery was received and settled, and
/// PayNow must not retry it.
pub(crate) fn ingest_response(outcome: IngestOutcome) -> Response {
    match outcome {
        IngestOutcome::Processed(result) => (
            StatusCode::OK,
            Json(json!({ "status": "processed", "result": result })),
        )
            .into_response(),
        IngestOutcome::Accepted => (
            StatusCode::ACCEPTED,
            Json(json!({ "status": "accepted" })),
        )
            .into_response(),
        IngestOutcome::AlreadyProcessed => (
            StatusCode::OK,
            Json(json!({ "status": "already_processed" })),
        )
            .into_response(),
        IngestOutcome::TerminalFailure { reason } => (
            StatusCode::OK,
            Json(json!({ "status": "failed_terminal", "reason": reason })),
        )
            .into_response(),
    }
}
