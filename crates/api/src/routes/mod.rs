//! HTTP route definitions
//!
//! Two surfaces share the router: a public one (health check plus the
//! signature-authenticated webhook receiver) and an internal one (points,
//! queue push, admin) behind the shared bearer token.

pub mod admin;
pub mod points;
pub mod queue;
pub mod webhooks;

use axum::{
    extract::State,
    middleware,
    routing::{get, post},
    Json, Router,
};
use serde_json::json;

use crate::{auth::require_internal_token, state::AppState};

/// Build the full application router
pub fn create_router(state: AppState) -> Router {
    let internal = Router::new()
        .route("/v1/points/{user_id}/balance", get(points::get_balance))
        .route("/v1/points/{user_id}/ledger", get(points::get_ledger))
        .route("/v1/points/{user_id}/spend", post(points::spend))
        .route(
            "/v1/points/{user_id}/spend/preview",
            post(points::preview_spend),
        )
        .route("/v1/points/{user_id}/credits", post(points::create_credit))
        .route("/queue/paynow", post(queue::handle_push))
        .route("/admin/risk/holds", get(admin::list_risk_holds))
        .route(
            "/admin/risk/holds/{id}/resolve",
            post(admin::resolve_risk_hold),
        )
        .route("/admin/webhooks", get(admin::list_webhook_events))
        .route(
            "/admin/webhooks/{event_id}/replay",
            post(admin::replay_webhook),
        )
        .route(
            "/admin/webhooks/replay-failed",
            post(admin::replay_failed_webhooks),
        )
        .route(
            "/admin/subscriptions/{provider_subscription_id}",
            get(admin::get_subscription),
        )
        .route("/admin/reconciliation/run", post(admin::run_reconciliation))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            require_internal_token,
        ));

    let public = Router::new()
        .route("/health", get(health_check))
        .route("/webhooks/paynow", post(webhooks::receive_paynow));

    public.merge(internal).with_state(state)
}

/// Health check with a lightweight database probe
async fn health_check(State(state): State<AppState>) -> Json<serde_json::Value> {
    let database = sqlx::query("SELECT 1").execute(&state.pool).await.is_ok();
    Json(json!({
        "status": if database { "ok" } else { "degraded" },
        "database": database,
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
