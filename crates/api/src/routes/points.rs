//! Points balance, ledger, and spend routes
//!
//! Called by our own backend services on behalf of users. The caller is
//! trusted to have authenticated the user already, so `user_id` comes
//! straight from the path.

use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::Deserialize;
use serde_json::json;
use time::OffsetDateTime;
use uuid::Uuid;

use qalam_points::{
    CreditOutcome, CreditParams, LedgerKind, SpendOutcome, SpendParams, SpendPreview,
    WalletBalance,
};

use crate::{
    error::{ApiError, ApiResult},
    state::AppState,
};

#[derive(Debug, Deserialize)]
pub struct LedgerQuery {
    pub limit: Option<i64>,
    pub start_after: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct SpendRequest {
    pub cost: i64,
    pub action_id: String,
    pub action: String,
}

#[derive(Debug, Deserialize)]
pub struct PreviewRequest {
    pub cost: i64,
}

#[derive(Debug, Deserialize)]
pub struct CreditRequest {
    pub amount: i64,
    pub action_id: String,
    pub reason: Option<String>,
    pub created_by: String,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub expires_at: Option<OffsetDateTime>,
}

pub async fn get_balance(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> ApiResult<Json<WalletBalance>> {
    let balance = state.points.ledger.get_wallet_balance(&user_id).await?;
    Ok(Json(balance))
}

pub async fn get_ledger(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Query(query): Query<LedgerQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let entries = state
        .points
        .ledger
        .get_ledger_entries(&user_id, query.limit.unwrap_or(50), query.start_after)
        .await?;
    let next_cursor = entries.last().map(|e| e.id);
    Ok(Json(json!({
        "entries": entries,
        "next_cursor": next_cursor,
    })))
}

pub async fn spend(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Json(request): Json<SpendRequest>,
) -> ApiResult<Json<SpendOutcome>> {
    if request.action_id.trim().is_empty() {
        return Err(ApiError::bad_request("action_id must not be empty"));
    }
    let outcome = state
        .points
        .ledger
        .spend(SpendParams {
            user_id,
            cost: request.cost,
            action_id: request.action_id,
            action: request.action,
            created_by: "api:internal".to_string(),
        })
        .await?;
    Ok(Json(outcome))
}

pub async fn preview_spend(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Json(request): Json<PreviewRequest>,
) -> ApiResult<Json<SpendPreview>> {
    let preview = state
        .points
        .ledger
        .preview_spend(&user_id, request.cost)
        .await?;
    Ok(Json(preview))
}

/// Manual credit grant
///
/// Operator-initiated, so it skips the risk gate that sits in front of
/// webhook credits.
pub async fn create_credit(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Json(request): Json<CreditRequest>,
) -> ApiResult<Json<CreditOutcome>> {
    if request.action_id.trim().is_empty() {
        return Err(ApiError::bad_request("action_id must not be empty"));
    }
    if request.created_by.trim().is_empty() {
        return Err(ApiError::bad_request("created_by must not be empty"));
    }
    let outcome = state
        .points
        .ledger
        .credit(CreditParams {
            user_id,
            kind: LedgerKind::AdminAdjustment,
            amount: request.amount,
            source: json!({
                "reason": request.reason,
                "granted_by": request.created_by,
            }),
            action_id: request.action_id,
            expires_at: request.expires_at,
            created_by: request.created_by,
        })
        .await?;
    Ok(Json(outcome))
}
