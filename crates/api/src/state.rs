//! Application state

use std::sync::Arc;

use sqlx::PgPool;

use qalam_points::PointsService;
use qalam_shared::{PointsConfig, VelocityStore};

use crate::config::ApiConfig;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: ApiConfig,
    pub points_config: Arc<PointsConfig>,
    pub points: Arc<PointsService>,
}

impl AppState {
    pub fn new(
        pool: PgPool,
        config: ApiConfig,
        points_config: Arc<PointsConfig>,
        velocity: VelocityStore,
    ) -> Self {
        let points = Arc::new(PointsService::new(
            pool.clone(),
            points_config.clone(),
            velocity,
        ));

        if points_config.risk_holds_enabled {
            tracing::info!(
                hold_threshold = points_config.velocity.hold_threshold,
                "Risk holds enabled"
            );
        } else {
            tracing::warn!("Risk holds disabled - webhook credits post without velocity checks");
        }

        if points_config.webhook_inline_processing {
            tracing::info!("Webhook processing mode: inline (credited before the HTTP response)");
        } else {
            tracing::info!("Webhook processing mode: queued (recorded, processed via push queue)");
        }

        tracing::info!(
            products = points_config.product_points.len(),
            plans = points_config.subscription_plans.len(),
            "Product catalog loaded"
        );

        Self {
            pool,
            config,
            points_config,
            points,
        }
    }
}
