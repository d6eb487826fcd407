use super::*;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::cache::TopologyCache;
use crate::config::{
    DetectionConfig, MAX_DETECTION_INTERVAL_SECONDS, MIN_DETECTION_INTERVAL_SECONDS,
};
use crate::metrics::AppMetrics;
use crate::pubsub::PubSubPort;
use crate::storage::StoragePort;
use crate::websocket::ConnectionHub;

/// Periodic driver of the detection pipeline: refresh cache, predict,
/// detect, persist, alert, repeat. Survives transient failures and stops
/// itself after too many in a row.
pub struct DetectionScheduler {
    storage: Arc<dyn StoragePort>,
    cache: Arc<TopologyCache>,
    engine: PredictionEngine,
    detector: ConflictDetector,
    hub: Arc<ConnectionHub>,
    pubsub: Option<Arc<dyn PubSubPort>>,
    metrics: Arc<AppMetrics>,

    interval_seconds: AtomicU64,
    max_consecutive_failures: u32,

    state: std::sync::Mutex<SchedulerState>,
    stats: std::sync::Mutex<SchedulerStats>,
}

enum SchedulerState {
    Stopped,
    Running {
        cancel: CancellationToken,
        task: JoinHandle<()>,
    },
}

#[derive(Debug, Clone)]
struct SchedulerStats {
    runs_completed: u64,
    runs_failed: u64,
    total_conflicts_detected: u64,
    alerts_sent: u64,
    average_detection_time: f64,
    consecutive_failures: u32,
    last_run_time: Option<DateTime<Utc>>,
    uptime_start: DateTime<Utc>,
}

impl Default for SchedulerStats {
    fn default() -> Self {
        Self {
            runs_completed: 0,
            runs_failed: 0,
            total_conflicts_detected: 0,
            alerts_sent: 0,
            average_detection_time: 0.0,
            consecutive_failures: 0,
            last_run_time: None,
            uptime_start: Utc::now(),
        }
    }
}

/// Status snapshot for the control surface and the system_status broadcast.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub is_running: bool,
    pub detection_interval_seconds: u64,
    pub uptime_seconds: f64,
    pub runs_completed: u64,
    pub runs_failed: u64,
    pub total_conflicts_detected: u64,
    pub alerts_sent: u64,
    pub average_detection_time: f64,
    pub consecutive_failures: u32,
    pub max_consecutive_failures: u32,
    pub last_run_time: Option<DateTime<Utc>>,
    pub detector_metrics: crate::services::detector::DetectorMetricsSnapshot,
}

/// Result of one manually triggered cycle.
#[derive(Debug, Clone, Serialize)]
pub struct CycleResult {
    pub success: bool,
    pub conflicts_detected: usize,
    pub conflicts_stored: usize,
    pub alerts_sent: u64,
    pub detection_time_seconds: f64,
    pub conflicts: Vec<DetectedConflict>,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl DetectionScheduler {
    pub fn new(
        config: &DetectionConfig,
        storage: Arc<dyn StoragePort>,
        cache: Arc<TopologyCache>,
        hub: Arc<ConnectionHub>,
        pubsub: Option<Arc<dyn PubSubPort>>,
        metrics: Arc<AppMetrics>,
    ) -> Self {
        Self {
            storage,
            cache,
            engine: PredictionEngine::new(config),
            detector: ConflictDetector::new(config),
            hub,
            pubsub,
            metrics,
            interval_seconds: AtomicU64::new(config.detection_interval_seconds),
            max_consecutive_failures: config.max_consecutive_failures,
            state: std::sync::Mutex::new(SchedulerState::Stopped),
            stats: std::sync::Mutex::new(SchedulerStats::default()),
        }
    }

    /// Starts the background detection loop. A second call while running is
    /// a no-op with a warning.
    pub fn start(self: Arc<Self>) {
        let mut state = self.state.lock().unwrap();
        if matches!(*state, SchedulerState::Running { .. }) {
            warn!("Conflict detection scheduler is already running");
            return;
        }

        self.stats.lock().unwrap().uptime_start = Utc::now();
        let cancel = CancellationToken::new();
        let scheduler = self.clone();
        let loop_token = cancel.clone();
        let task = tokio::spawn(async move {
            scheduler.detection_loop(loop_token).await;
        });

        *state = SchedulerState::Running { cancel, task };
        info!(
            "Conflict detection scheduler started (interval: {}s)",
            self.interval_seconds.load(Ordering::Relaxed)
        );
    }

    /// Stops the loop and waits for any in-flight cycle to wind down.
    pub async fn stop(&self) {
        let previous = {
            let mut state = self.state.lock().unwrap();
            std::mem::replace(&mut *state, SchedulerState::Stopped)
        };

        if let SchedulerState::Running { cancel, task } = previous {
            info!("Stopping conflict detection scheduler...");
            cancel.cancel();
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    warn!("Scheduler task ended abnormally: {e}");
                }
            }
            info!("Conflict detection scheduler stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(*self.state.lock().unwrap(), SchedulerState::Running { .. })
    }

    /// Adjusts the cadence, bounded to [10, 300] seconds. Takes effect at
    /// the next sleep.
    pub fn set_interval(&self, seconds: u64) -> ServiceResult<()> {
        if !(MIN_DETECTION_INTERVAL_SECONDS..=MAX_DETECTION_INTERVAL_SECONDS).contains(&seconds) {
            return Err(ServiceError::Validation(format!(
                "Detection interval must be between {MIN_DETECTION_INTERVAL_SECONDS} and {MAX_DETECTION_INTERVAL_SECONDS} seconds"
            )));
        }
        let old = self.interval_seconds.swap(seconds, Ordering::Relaxed);
        info!("Detection interval updated from {old}s to {seconds}s");
        Ok(())
    }

    pub fn interval_seconds(&self) -> u64 {
        self.interval_seconds.load(Ordering::Relaxed)
    }

    pub fn status(&self) -> SchedulerStatus {
        let stats = self.stats.lock().unwrap().clone();
        SchedulerStatus {
            is_running: self.is_running(),
            detection_interval_seconds: self.interval_seconds(),
            uptime_seconds: (Utc::now() - stats.uptime_start).num_milliseconds() as f64 / 1000.0,
            runs_completed: stats.runs_completed,
            runs_failed: stats.runs_failed,
            total_conflicts_detected: stats.total_conflicts_detected,
            alerts_sent: stats.alerts_sent,
            average_detection_time: stats.average_detection_time,
            consecutive_failures: stats.consecutive_failures,
            max_consecutive_failures: self.max_consecutive_failures,
            last_run_time: stats.last_run_time,
            detector_metrics: self.detector.metrics_snapshot(),
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.stats.lock().unwrap().consecutive_failures
    }

    async fn detection_loop(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            let started = std::time::Instant::now();

            match self.run_detection_cycle().await {
                Ok(outcome) => {
                    let elapsed = started.elapsed().as_secs_f64();
                    self.record_success(elapsed, &outcome);
                    debug!(
                        "Detection cycle completed in {elapsed:.2}s, found {} conflicts",
                        outcome.conflicts.len()
                    );
                }
                Err(e) => {
                    error!("Error in conflict detection cycle: {e:?}");
                    let failures = self.record_failure();
                    if failures >= self.max_consecutive_failures {
                        tracing::error!(
                            consecutive_failures = failures,
                            "Stopping scheduler after repeated cycle failures"
                        );
                        let mut state = self.state.lock().unwrap();
                        *state = SchedulerState::Stopped;
                        return;
                    }
                }
            }

            let interval = std::time::Duration::from_secs(self.interval_seconds());
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }

    /// One pass of the pipeline on the shared state. Exposed for the
    /// control surface via `run_once`.
    async fn run_detection_cycle(&self) -> ServiceResult<CycleOutcome> {
        let now = Utc::now();
        let snapshot = self.cache.ensure_fresh().await?;
        self.metrics.cached_trains.set(snapshot.train_count() as i64);
        self.metrics.cached_sections.set(snapshot.section_count() as i64);

        let mut session = self.storage.session().await?;

        let predictions = self
            .engine
            .predict_all(session.as_mut(), snapshot.as_ref(), now)
            .await?;
        self.metrics.predictions_total.inc_by(predictions.len() as u64);

        let conflicts = self.detector.detect(snapshot.as_ref(), &predictions, now);
        self.metrics
            .conflicts_detected_total
            .inc_by(conflicts.len() as u64);

        let stored_ids = if conflicts.is_empty() {
            // Nothing staged; release the transaction.
            session.rollback().await.ok();
            Vec::new()
        } else {
            let ids = self
                .detector
                .store_conflicts(session.as_mut(), &conflicts, now)
                .await;
            info!("Stored {} conflicts", ids.len());
            ids
        };

        let alerts_sent = self
            .detector
            .send_alerts(
                self.hub.as_ref(),
                self.pubsub.as_deref(),
                &conflicts,
            )
            .await;
        self.metrics.alerts_sent_total.inc_by(alerts_sent);

        self.broadcast_system_status().await;

        Ok(CycleOutcome {
            conflicts,
            stored_ids,
            alerts_sent,
        })
    }

    /// Runs exactly one cycle outside the loop. Leaves the running-state
    /// machine and the loop statistics alone.
    pub async fn run_once(&self) -> CycleResult {
        info!("Running manual conflict detection...");
        let started = std::time::Instant::now();

        match self.run_detection_cycle().await {
            Ok(outcome) => CycleResult {
                success: true,
                conflicts_detected: outcome.conflicts.len(),
                conflicts_stored: outcome.stored_ids.len(),
                alerts_sent: outcome.alerts_sent,
                detection_time_seconds: started.elapsed().as_secs_f64(),
                conflicts: outcome.conflicts,
                error: None,
                timestamp: Utc::now(),
            },
            Err(e) => {
                error!("Error in manual detection: {e:?}");
                CycleResult {
                    success: false,
                    conflicts_detected: 0,
                    conflicts_stored: 0,
                    alerts_sent: 0,
                    detection_time_seconds: started.elapsed().as_secs_f64(),
                    conflicts: Vec::new(),
                    error: Some(e.to_string()),
                    timestamp: Utc::now(),
                }
            }
        }
    }

    /// Detection without persistence or alerting, for tests and on-demand
    /// inspection.
    pub async fn detect_once(&self) -> ServiceResult<Vec<DetectedConflict>> {
        let now = Utc::now();
        let snapshot = self.cache.ensure_fresh().await?;
        let mut session = self.storage.session().await?;
        let predictions = self
            .engine
            .predict_all(session.as_mut(), snapshot.as_ref(), now)
            .await?;
        session.rollback().await.ok();
        Ok(self.detector.detect(snapshot.as_ref(), &predictions, now))
    }

    async fn broadcast_system_status(&self) {
        let status = self.status();
        let payload = json!({
            "conflict_detection": status,
            "timestamp": Utc::now().to_rfc3339(),
        });
        self.hub.broadcast_system_status(payload.clone()).await;
        if let Some(pubsub) = &self.pubsub {
            if let Err(e) = pubsub.publish(crate::pubsub::channels::SYSTEM, &payload).await {
                debug!("Failed to publish system status: {e}");
            }
        }
    }

    fn record_success(&self, detection_time: f64, outcome: &CycleOutcome) {
        self.metrics.detection_cycles_total.inc();
        self.metrics.detection_cycle_duration.observe(detection_time);

        let mut stats = self.stats.lock().unwrap();
        stats.runs_completed += 1;
        stats.total_conflicts_detected += outcome.conflicts.len() as u64;
        stats.alerts_sent += outcome.alerts_sent;
        let runs = stats.runs_completed as f64;
        stats.average_detection_time =
            (stats.average_detection_time * (runs - 1.0) + detection_time) / runs;
        stats.consecutive_failures = 0;
        stats.last_run_time = Some(Utc::now());
    }

    fn record_failure(&self) -> u32 {
        self.metrics.detection_cycle_failures_total.inc();

        let mut stats = self.stats.lock().unwrap();
        stats.runs_failed += 1;
        stats.consecutive_failures += 1;
        stats.last_run_time = Some(Utc::now());
        stats.consecutive_failures
    }
}

struct CycleOutcome {
    conflicts: Vec<DetectedConflict>,
    stored_ids: Vec<i64>,
    alerts_sent: u64,
}
