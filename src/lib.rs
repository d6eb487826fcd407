pub mod models;
pub mod config;
pub mod storage;
pub mod cache;
pub mod services;
pub mod pubsub;
pub mod websocket;
pub mod metrics;
pub mod api;

use std::sync::Arc;

/// Handles to the composed core, shared with the control surface.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<config::CoreConfig>,
    pub metrics: Arc<metrics::AppMetrics>,
    pub cache: Arc<cache::TopologyCache>,
    pub hub: Arc<websocket::ConnectionHub>,
    pub scheduler: Arc<services::DetectionScheduler>,
}
