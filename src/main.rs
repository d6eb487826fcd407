use axum::{
    routing::{get, post, put},
    Router,
};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use railway_core::cache::TopologyCache;
use railway_core::config::CoreConfig;
use railway_core::metrics::{metrics_handler, AppMetrics};
use railway_core::pubsub::{PubSubPort, RedisPubSub};
use railway_core::services::DetectionScheduler;
use railway_core::storage::{PgStorage, StoragePort};
use railway_core::websocket::{self, ConnectionHub};
use railway_core::{api, AppState};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Arc::new(CoreConfig::from_env()?);
    config.validate()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.logging.level.clone())),
        )
        .init();

    info!("🚆 Starting railway traffic management core");

    let metrics = Arc::new(AppMetrics::new()?);
    info!("📊 Metrics system initialized");

    let storage: Arc<dyn StoragePort> = Arc::new(PgStorage::connect(&config.database).await?);
    info!("✅ Database connected");

    let pubsub: Option<Arc<dyn PubSubPort>> = if config.redis.enabled {
        match RedisPubSub::connect(&config.redis.url).await {
            Ok(client) => Some(Arc::new(client)),
            Err(e) => {
                warn!("Redis unavailable, running without cross-instance pub/sub: {e}");
                None
            }
        }
    } else {
        None
    };

    let cache = Arc::new(TopologyCache::new(
        storage.clone(),
        config.detection.cache_ttl_minutes,
        metrics.clone(),
    ));

    let hub = Arc::new(ConnectionHub::new(metrics.clone()));
    info!("🔌 Fan-out hub initialized");

    let scheduler = Arc::new(DetectionScheduler::new(
        &config.detection,
        storage.clone(),
        cache.clone(),
        hub.clone(),
        pubsub.clone(),
        metrics.clone(),
    ));

    // Cross-instance bridge: re-broadcast pub/sub traffic to local clients.
    if let Some(pubsub) = pubsub.clone() {
        let bridge_hub = hub.clone();
        tokio::spawn(async move {
            websocket::run_bridge(bridge_hub, pubsub).await;
        });
        info!("🌉 Cross-instance bridge started");
    }

    scheduler.clone().start();
    info!("🔁 Conflict detection scheduler started");

    let uptime_metrics = metrics.clone();
    let started_at = std::time::Instant::now();
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(std::time::Duration::from_secs(15));
        loop {
            tick.tick().await;
            uptime_metrics
                .system_uptime_seconds
                .set(started_at.elapsed().as_secs_f64());
        }
    });

    let state = AppState {
        config: config.clone(),
        metrics,
        cache,
        hub,
        scheduler: scheduler.clone(),
    };

    let mut app = Router::new()
        .route("/health", get(api::health_check))
        // Detection control surface
        .route("/api/v1/detection/status", get(api::get_detection_status))
        .route("/api/v1/detection/start", post(api::start_detection))
        .route("/api/v1/detection/stop", post(api::stop_detection))
        .route("/api/v1/detection/run-once", post(api::run_detection_once))
        .route("/api/v1/detection/interval", put(api::set_detection_interval))
        .route("/api/v1/detection/cache/refresh", post(api::force_cache_refresh))
        // Hub introspection
        .route("/api/v1/connections/stats", get(api::get_connection_stats))
        // WebSocket endpoint
        .route("/ws", get(websocket::websocket_handler))
        // Metrics endpoint
        .route("/metrics", get(metrics_handler))
        .layer(TraceLayer::new_for_http());

    if config.server.cors_enabled {
        app = app.layer(CorsLayer::permissive());
    }
    let app = app.with_state(state);

    let bind_address = config.server_bind_address();
    info!("🚀 Server starting on {bind_address}");
    info!("🔌 WebSocket endpoint: ws://{bind_address}/ws");

    let listener = tokio::net::TcpListener::bind(&bind_address).await?;
    if let Err(e) = axum::serve(listener, app).await {
        error!("Server error: {e}");
    }

    scheduler.stop().await;
    Ok(())
}
