use prometheus::{Encoder, Gauge, Histogram, HistogramOpts, IntCounter, IntGauge, Opts, Registry, TextEncoder};
use anyhow::Result;
use axum::http::StatusCode;

/// Application metrics collection
#[derive(Debug, Clone)]
pub struct AppMetrics {
    // Detection pipeline
    pub detection_cycles_total: IntCounter,
    pub detection_cycle_failures_total: IntCounter,
    pub detection_cycle_duration: Histogram,
    pub conflicts_detected_total: IntCounter,
    pub predictions_total: IntCounter,
    pub alerts_sent_total: IntCounter,

    // Cache
    pub cache_refresh_errors_total: IntCounter,
    pub cached_trains: IntGauge,
    pub cached_sections: IntGauge,

    // Fan-out hub
    pub websocket_connections_active: IntGauge,
    pub websocket_messages_sent: IntCounter,
    pub websocket_messages_received: IntCounter,
    pub websocket_send_failures_total: IntCounter,

    // System
    pub system_uptime_seconds: Gauge,

    pub registry: Registry,
}

impl AppMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let detection_cycles_total = IntCounter::with_opts(
            Opts::new("detection_cycles_total", "Completed conflict detection cycles")
        )?;
        let detection_cycle_failures_total = IntCounter::with_opts(
            Opts::new("detection_cycle_failures_total", "Failed conflict detection cycles")
        )?;
        let detection_cycle_duration = Histogram::with_opts(
            HistogramOpts::new("detection_cycle_duration_seconds", "Duration of one detection cycle")
        )?;
        let conflicts_detected_total = IntCounter::with_opts(
            Opts::new("conflicts_detected_total", "Total number of conflicts detected")
        )?;
        let predictions_total = IntCounter::with_opts(
            Opts::new("predictions_total", "Total number of train predictions computed")
        )?;
        let alerts_sent_total = IntCounter::with_opts(
            Opts::new("alerts_sent_total", "Conflict alerts pushed to clients")
        )?;

        let cache_refresh_errors_total = IntCounter::with_opts(
            Opts::new("cache_refresh_errors_total", "Topology cache reload failures")
        )?;
        let cached_trains = IntGauge::with_opts(
            Opts::new("cached_trains", "Active trains in the topology cache")
        )?;
        let cached_sections = IntGauge::with_opts(
            Opts::new("cached_sections", "Active sections in the topology cache")
        )?;

        let websocket_connections_active = IntGauge::with_opts(
            Opts::new("websocket_connections_active", "Currently connected client sessions")
        )?;
        let websocket_messages_sent = IntCounter::with_opts(
            Opts::new("websocket_messages_sent", "Messages delivered to client sessions")
        )?;
        let websocket_messages_received = IntCounter::with_opts(
            Opts::new("websocket_messages_received", "Messages received from client sessions")
        )?;
        let websocket_send_failures_total = IntCounter::with_opts(
            Opts::new("websocket_send_failures_total", "Client sends that failed and dropped the session")
        )?;

        let system_uptime_seconds = Gauge::with_opts(
            Opts::new("system_uptime_seconds", "Process uptime in seconds")
        )?;

        registry.register(Box::new(detection_cycles_total.clone()))?;
        registry.register(Box::new(detection_cycle_failures_total.clone()))?;
        registry.register(Box::new(detection_cycle_duration.clone()))?;
        registry.register(Box::new(conflicts_detected_total.clone()))?;
        registry.register(Box::new(predictions_total.clone()))?;
        registry.register(Box::new(alerts_sent_total.clone()))?;
        registry.register(Box::new(cache_refresh_errors_total.clone()))?;
        registry.register(Box::new(cached_trains.clone()))?;
        registry.register(Box::new(cached_sections.clone()))?;
        registry.register(Box::new(websocket_connections_active.clone()))?;
        registry.register(Box::new(websocket_messages_sent.clone()))?;
        registry.register(Box::new(websocket_messages_received.clone()))?;
        registry.register(Box::new(websocket_send_failures_total.clone()))?;
        registry.register(Box::new(system_uptime_seconds.clone()))?;

        Ok(Self {
            detection_cycles_total,
            detection_cycle_failures_total,
            detection_cycle_duration,
            conflicts_detected_total,
            predictions_total,
            alerts_sent_total,
            cache_refresh_errors_total,
            cached_trains,
            cached_sections,
            websocket_connections_active,
            websocket_messages_sent,
            websocket_messages_received,
            websocket_send_failures_total,
            system_uptime_seconds,
            registry,
        })
    }

    pub fn render(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

/// Prometheus scrape endpoint.
pub async fn metrics_handler(
    axum::extract::State(state): axum::extract::State<crate::AppState>,
) -> Result<String, StatusCode> {
    state
        .metrics
        .render()
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}
