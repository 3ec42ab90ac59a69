//! Qalam Points API Server
//!
//! Serves the PayNow webhook receiver, the internal points API, the queue
//! push endpoint, and the admin surface.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::http::{header, Method};
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use qalam_api::{routes::create_router, ApiConfig, AppState};
use qalam_shared::{create_migration_pool, create_pool, run_migrations, PointsConfig, VelocityStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,qalam_api=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Qalam Points API v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = ApiConfig::from_env()?;
    let points_config = Arc::new(PointsConfig::from_env()?);
    tracing::info!("Configuration loaded");

    // Create database pool (pooler URL for regular queries)
    tracing::info!("Connecting to database...");
    let pool = create_pool(&config.database_url).await?;
    tracing::info!("Database connection established");

    // Run migrations on the direct URL (bypasses PgBouncer, which doesn't
    // support the prepared statements migrations use)
    tracing::info!("Running database migrations...");
    let migration_url = config
        .database_direct_url
        .as_ref()
        .unwrap_or(&config.database_url);
    let migration_pool = create_migration_pool(migration_url).await?;
    run_migrations(&migration_pool).await?;
    migration_pool.close().await;
    tracing::info!("Migrations complete");

    // Velocity counters back the risk engine; without Redis they fall back
    // to per-instance memory, which undercounts behind a load balancer.
    let velocity = match config.redis_url.as_deref() {
        Some(url) => {
            let store = VelocityStore::connect_redis(url).await?;
            tracing::info!("Velocity counters backed by Redis");
            store
        }
        None => {
            tracing::warn!(
                "REDIS_URL not set - velocity counters are in-memory and per-instance"
            );
            VelocityStore::new_in_memory()
        }
    };

    let state = AppState::new(pool, config.clone(), points_config, velocity);

    // CORS: explicit origin allowlist, defaults to localhost for development
    let allowed_origins: Vec<axum::http::HeaderValue> = std::env::var("ALLOWED_ORIGINS")
        .unwrap_or_else(|_| "http://localhost:3000,http://127.0.0.1:3000".to_string())
        .split(',')
        .filter_map(|s| s.trim().parse().ok())
        .collect();

    tracing::info!(
        allowed_origins = ?allowed_origins,
        "CORS configured with {} allowed origins",
        allowed_origins.len()
    );

    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::list(allowed_origins))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE, header::ACCEPT]);

    let app = create_router(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = config.bind_address.parse()?;
    tracing::info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
