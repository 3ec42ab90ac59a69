//! Admin routes: risk holds, webhook inspection, reconciliation

use axum::{
    extract::{Path, Query, State},
    response::Response,
    Json,
};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use qalam_points::{
    PointsError, ReconciliationSummary, ReplaySummary, RiskResolution, SubscriptionRow,
    WebhookEventRow,
};

use crate::{
    error::{ApiError, ApiResult},
    routes::webhooks::ingest_response,
    state::AppState,
};

#[derive(Debug, Deserialize)]
pub struct HoldsQuery {
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct ResolveRequest {
    pub decision: String,
    pub resolved_by: String,
}

#[derive(Debug, Deserialize)]
pub struct WebhookListQuery {
    pub status: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct ReplayFailedQuery {
    pub max: Option<i64>,
}

pub async fn list_risk_holds(
    State(state): State<AppState>,
    Query(query): Query<HoldsQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let holds = state
        .points
        .risk
        .list_open_holds(query.limit.unwrap_or(50))
        .await?;
    Ok(Json(json!({
        "count": holds.len(),
        "holds": holds,
    })))
}

pub async fn resolve_risk_hold(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<ResolveRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let Some(resolution) = RiskResolution::parse(&request.decision) else {
        return Err(ApiError::bad_request(
            "decision must be 'posted' or 'reversed'",
        ));
    };
    if request.resolved_by.trim().is_empty() {
        return Err(ApiError::bad_request("resolved_by must not be empty"));
    }
    let outcome = state
        .points
        .risk
        .resolve(id, resolution, &request.resolved_by)
        .await?;
    Ok(Json(json!({
        "event": outcome.event,
        "credit": outcome.credit,
    })))
}

pub async fn list_webhook_events(
    State(state): State<AppState>,
    Query(query): Query<WebhookListQuery>,
) -> ApiResult<Json<Vec<WebhookEventRow>>> {
    let events = state
        .points
        .webhooks
        .list_webhook_events(
            query.status.as_deref(),
            query.limit.unwrap_or(50),
            query.offset.unwrap_or(0),
        )
        .await?;
    Ok(Json(events))
}

pub async fn replay_webhook(
    State(state): State<AppState>,
    Path(event_id): Path<String>,
) -> Result<Response, ApiError> {
    let outcome = state.points.webhooks.replay_webhook(&event_id).await?;
    Ok(ingest_response(outcome))
}

pub async fn replay_failed_webhooks(
    State(state): State<AppState>,
    Query(query): Query<ReplayFailedQuery>,
) -> ApiResult<Json<ReplaySummary>> {
    let summary = state
        .points
        .webhooks
        .replay_all_failed(query.max.unwrap_or(100))
        .await?;
    Ok(Json(summary))
}

pub async fn get_subscription(
    State(state): State<AppState>,
    Path(provider_subscription_id): Path<String>,
) -> ApiResult<Json<SubscriptionRow>> {
    let row = state
        .points
        .subscriptions
        .get_by_provider_id(&provider_subscription_id)
        .await?
        .ok_or_else(|| PointsError::not_found("subscription", &provider_subscription_id))?;
    Ok(Json(row))
}

/// Trigger a reconciliation sweep outside the nightly schedule
pub async fn run_reconciliation(
    State(state): State<AppState>,
) -> ApiResult<Json<ReconciliationSummary>> {
    let summary = state.points.reconciliation.run_sweep().await?;
    Ok(Json(summary))
}
