//! Queue push endpoint
//!
//! Receives push deliveries from the message queue when webhook processing
//! runs in queued mode. A non-2xx response makes the queue redeliver, so
//! transient errors surface as 503 and everything settled returns 200.

use axum::{
    extract::State,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use qalam_points::{PushDisposition, PushEnvelope};

use crate::{error::ApiError, state::AppState};

pub async fn handle_push(
    State(state): State<AppState>,
    Json(envelope): Json<PushEnvelope>,
) -> Response {
    match state.points.queue.handle_push(envelope).await {
        Ok(disposition) => push_response(disposition),
        Err(e) => ApiError::from(e).into_response(),
    }
}

fn push_response(disposition: PushDisposition) -> Response {
    match disposition {
        PushDisposition::Processed(result) => {
            Json(json!({ "status": "processed", "result": result })).into_response()
        }
        PushDisposition::Duplicate => Json(json!({ "status": "duplicate" })).into_response(),
        PushDisposition::Dropped { reason } => {
            Json(json!({ "status": "dropped", "reason": reason })).into_response()
        }
    }
}
