use super::*;
use chrono::{DateTime, Utc};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::cache::CacheSnapshot;
use crate::config::DetectionConfig;
use crate::pubsub::{self, PubSubPort};
use crate::storage::StorageSession;
use crate::websocket::ConnectionHub;

/// Scans one cycle's predictions for the four conflict classes, scores and
/// deduplicates them, and drives persistence and alert fan-out.
pub struct ConflictDetector {
    safety_buffer_minutes: f64,
    alert_severity_threshold: u8,
    alert_time_threshold_minutes: f64,
    metrics: DetectorMetrics,
}

/// Running counters surfaced in the scheduler status snapshot.
#[derive(Debug, Default)]
pub struct DetectorMetrics {
    pub conflicts_detected: AtomicU64,
    pub predictions_scanned: AtomicU64,
    last_detection_time_ms: Mutex<f64>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct DetectorMetricsSnapshot {
    pub conflicts_detected: u64,
    pub predictions_scanned: u64,
    pub last_detection_time_ms: f64,
}

impl ConflictDetector {
    pub fn new(config: &DetectionConfig) -> Self {
        Self {
            safety_buffer_minutes: config.safety_buffer_minutes,
            alert_severity_threshold: config.alert_severity_threshold,
            alert_time_threshold_minutes: config.alert_time_threshold_minutes,
            metrics: DetectorMetrics::default(),
        }
    }

    pub fn metrics_snapshot(&self) -> DetectorMetricsSnapshot {
        DetectorMetricsSnapshot {
            conflicts_detected: self.metrics.conflicts_detected.load(Ordering::Relaxed),
            predictions_scanned: self.metrics.predictions_scanned.load(Ordering::Relaxed),
            last_detection_time_ms: *self.metrics.last_detection_time_ms.lock().unwrap(),
        }
    }

    /// Main detection pass: pure over the snapshot and prediction set.
    /// Returns conflicts deduplicated and sorted by severity, highest first.
    pub fn detect(
        &self,
        snapshot: &CacheSnapshot,
        predictions: &[TrainPrediction],
        now: DateTime<Utc>,
    ) -> Vec<DetectedConflict> {
        let started = std::time::Instant::now();
        self.metrics
            .predictions_scanned
            .fetch_add(predictions.len() as u64, Ordering::Relaxed);

        if predictions.len() < 2 {
            debug!("fewer than 2 predictions, skipping conflict detection");
            return Vec::new();
        }

        let by_section = group_by_section(predictions);

        let mut conflicts = Vec::new();
        conflicts.extend(self.detect_spatial(snapshot, &by_section, now));
        conflicts.extend(self.detect_temporal(snapshot, &by_section, now));
        conflicts.extend(self.detect_priority(snapshot, &by_section, now));
        conflicts.extend(self.detect_junction(snapshot, &by_section, now));

        let mut unique = dedup_conflicts(conflicts);
        // Stable sort keeps insertion order among equal severities.
        unique.sort_by(|a, b| b.severity_score.cmp(&a.severity_score));

        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        *self.metrics.last_detection_time_ms.lock().unwrap() = elapsed_ms;
        self.metrics
            .conflicts_detected
            .fetch_add(unique.len() as u64, Ordering::Relaxed);
        info!("Detected {} conflicts in {:.2}ms", unique.len(), elapsed_ms);

        unique
    }

    /// Two trains occupying a capacity-1 section with overlapping windows.
    fn detect_spatial(
        &self,
        snapshot: &CacheSnapshot,
        by_section: &HashMap<i64, Vec<&TrainPrediction>>,
        now: DateTime<Utc>,
    ) -> Vec<DetectedConflict> {
        let mut conflicts = Vec::new();

        for (&section_id, preds) in by_section {
            if preds.len() < 2 {
                continue;
            }
            let Some(section) = snapshot.section(section_id) else {
                continue;
            };
            if !section.is_single_track() {
                continue;
            }

            for i in 0..preds.len() - 1 {
                for j in i + 1..preds.len() {
                    let (first, second) = (preds[i], preds[j]);
                    let overlap = first.overlap_minutes(second);
                    if overlap <= 0.0 {
                        continue;
                    }

                    let time_to_impact = minutes_between(now, first.arrival_time);
                    let severity = self.score(
                        snapshot,
                        ConflictType::SpatialCollision,
                        &[first.train_id, second.train_id],
                        time_to_impact,
                        1,
                    );

                    conflicts.push(DetectedConflict {
                        conflict_type: ConflictType::SpatialCollision,
                        severity_score: severity,
                        trains_involved: vec![first.train_id, second.train_id],
                        sections_involved: vec![section_id],
                        time_to_impact,
                        predicted_impact_time: first.arrival_time,
                        description: format!(
                            "Spatial collision risk: trains {} and {} both occupy single-track section {} for {:.1} min",
                            first.train_id, second.train_id, section.section_code, overlap
                        ),
                        resolution_suggestions: spatial_resolutions(first, second),
                        metadata: json!({
                            "overlap_minutes": overlap,
                            "section_capacity": section.capacity,
                            "train1_speed": first.speed_kmh,
                            "train2_speed": second.speed_kmh,
                        }),
                    });
                }
            }
        }

        conflicts
    }

    /// Successive arrivals into a section closer than the safety buffer.
    fn detect_temporal(
        &self,
        snapshot: &CacheSnapshot,
        by_section: &HashMap<i64, Vec<&TrainPrediction>>,
        now: DateTime<Utc>,
    ) -> Vec<DetectedConflict> {
        let mut conflicts = Vec::new();

        for (&section_id, preds) in by_section {
            if preds.len() < 2 {
                continue;
            }
            let Some(section) = snapshot.section(section_id) else {
                continue;
            };

            for pair in preds.windows(2) {
                let (leading, trailing) = (pair[0], pair[1]);
                let gap = minutes_between(leading.exit_time, trailing.arrival_time);
                if gap <= 0.0 || gap >= self.safety_buffer_minutes {
                    continue;
                }

                let time_to_impact = minutes_between(now, leading.arrival_time);
                let severity = self.score(
                    snapshot,
                    ConflictType::TemporalConflict,
                    &[leading.train_id, trailing.train_id],
                    time_to_impact,
                    1,
                );
                let needed_delay = self.safety_buffer_minutes - gap + 0.5;

                conflicts.push(DetectedConflict {
                    conflict_type: ConflictType::TemporalConflict,
                    severity_score: severity,
                    trains_involved: vec![leading.train_id, trailing.train_id],
                    sections_involved: vec![section_id],
                    time_to_impact,
                    predicted_impact_time: leading.arrival_time,
                    description: format!(
                        "Temporal conflict: {:.1} min gap between trains {} and {} in section {} (buffer {:.1} min)",
                        gap, leading.train_id, trailing.train_id, section.section_code, self.safety_buffer_minutes
                    ),
                    resolution_suggestions: vec![
                        format!("Delay train {} by {:.1} minutes", trailing.train_id, needed_delay),
                        format!("Increase speed of train {} to exit the section earlier", leading.train_id),
                        format!("Set a holding signal for train {}", trailing.train_id),
                    ],
                    metadata: json!({
                        "gap_minutes": gap,
                        "required_buffer": self.safety_buffer_minutes,
                    }),
                });
            }
        }

        conflicts
    }

    /// An express train stuck behind a freight train of lower priority.
    fn detect_priority(
        &self,
        snapshot: &CacheSnapshot,
        by_section: &HashMap<i64, Vec<&TrainPrediction>>,
        now: DateTime<Utc>,
    ) -> Vec<DetectedConflict> {
        let mut conflicts = Vec::new();

        for (&section_id, preds) in by_section {
            if preds.len() < 2 {
                continue;
            }

            for pair in preds.windows(2) {
                let (leading, trailing) = (pair[0], pair[1]);
                let (Some(blocker), Some(blocked)) = (
                    snapshot.train(leading.train_id),
                    snapshot.train(trailing.train_id),
                ) else {
                    continue;
                };

                if blocker.kind != TrainType::Freight
                    || blocked.kind != TrainType::Express
                    || blocked.priority <= blocker.priority
                {
                    continue;
                }

                let time_to_impact = minutes_between(now, trailing.arrival_time);
                let severity = self.score(
                    snapshot,
                    ConflictType::PriorityConflict,
                    &[leading.train_id, trailing.train_id],
                    time_to_impact,
                    1,
                );

                conflicts.push(DetectedConflict {
                    conflict_type: ConflictType::PriorityConflict,
                    severity_score: severity,
                    trains_involved: vec![leading.train_id, trailing.train_id],
                    sections_involved: vec![section_id],
                    time_to_impact,
                    predicted_impact_time: trailing.arrival_time,
                    description: format!(
                        "Priority conflict: express train {} blocked by freight train {} in section {}",
                        blocked.id, blocker.id, section_id
                    ),
                    resolution_suggestions: vec![
                        format!("Hold freight train {} at the previous station", blocker.id),
                        format!("Create an express bypass for train {}", blocked.id),
                        format!("Reroute freight train {} to an alternate track", blocker.id),
                    ],
                    metadata: json!({
                        "blocking_train_priority": blocker.priority,
                        "blocked_train_priority": blocked.priority,
                        "speed_difference": blocked.max_speed_kmh as i64 - blocker.max_speed_kmh as i64,
                    }),
                });
            }
        }

        conflicts
    }

    /// More trains converging on a junction than it can hold at once.
    fn detect_junction(
        &self,
        snapshot: &CacheSnapshot,
        by_section: &HashMap<i64, Vec<&TrainPrediction>>,
        now: DateTime<Utc>,
    ) -> Vec<DetectedConflict> {
        let mut conflicts = Vec::new();

        for (&section_id, preds) in by_section {
            let Some(junction) = snapshot.section(section_id) else {
                continue;
            };
            if !junction.is_junction() || preds.len() < 2 {
                continue;
            }

            // Groups anchored at a later arrival are subsets of an earlier
            // group when all windows overlap; suppress those to avoid a
            // cascade of alerts for one converging wave.
            let mut covered: Vec<HashSet<i64>> = Vec::new();

            for i in 0..preds.len() - 1 {
                let anchor = preds[i];
                let mut group = vec![anchor];
                for pred in &preds[i + 1..] {
                    if anchor.overlap_minutes(pred) > 0.0 {
                        group.push(*pred);
                    }
                }

                if group.len() <= junction.capacity as usize {
                    continue;
                }

                let train_ids: HashSet<i64> = group.iter().map(|p| p.train_id).collect();
                if covered.iter().any(|set| train_ids.is_subset(set)) {
                    continue;
                }

                let trains: Vec<i64> = group.iter().map(|p| p.train_id).collect();
                let overflow = group.len() - junction.capacity as usize;
                let time_to_impact = minutes_between(now, anchor.arrival_time);
                let severity = self.score(
                    snapshot,
                    ConflictType::JunctionConflict,
                    &trains,
                    time_to_impact,
                    1,
                );

                conflicts.push(DetectedConflict {
                    conflict_type: ConflictType::JunctionConflict,
                    severity_score: severity,
                    trains_involved: trains,
                    sections_involved: vec![section_id],
                    time_to_impact,
                    predicted_impact_time: anchor.arrival_time,
                    description: format!(
                        "Junction conflict: {} trains converging on junction {} (capacity {})",
                        group.len(),
                        junction.section_code,
                        junction.capacity
                    ),
                    resolution_suggestions: vec![
                        "Sequence the junction crossing with 2-minute intervals".to_string(),
                        format!("Hold {overflow} trains at the approach signals"),
                        "Prioritize by service class: express > local > freight".to_string(),
                        "Apply temporary speed restrictions on the approaches".to_string(),
                    ],
                    metadata: json!({
                        "junction_capacity": junction.capacity,
                        "trains_count": group.len(),
                        "overflow": overflow,
                    }),
                });

                covered.push(train_ids);
            }
        }

        conflicts
    }

    fn score(
        &self,
        snapshot: &CacheSnapshot,
        kind: ConflictType,
        trains: &[i64],
        time_to_impact: f64,
        section_count: usize,
    ) -> u8 {
        let involved: Vec<&Train> = trains.iter().filter_map(|id| snapshot.train(*id)).collect();
        severity_score(kind, &involved, time_to_impact, section_count, trains.len())
    }

    /// Persists the cycle's conflicts, updating the open row when the same
    /// conflict was already on file. Commits atomically; a failure rolls
    /// everything back and reports no stored ids.
    pub async fn store_conflicts(
        &self,
        session: &mut dyn StorageSession,
        conflicts: &[DetectedConflict],
        now: DateTime<Utc>,
    ) -> Vec<i64> {
        let mut stored_ids = Vec::with_capacity(conflicts.len());

        let result: anyhow::Result<()> = async {
            for conflict in conflicts {
                let (trains, sections, kind) = conflict.dedup_key();
                match session.find_open_conflict(&trains, &sections, kind).await? {
                    Some(existing) => {
                        session
                            .update_conflict(existing.id, conflict.severity(), &conflict.description)
                            .await?;
                        stored_ids.push(existing.id);
                    }
                    None => {
                        let record = ConflictRecord {
                            conflict_type: kind,
                            severity: conflict.severity(),
                            trains_involved: trains,
                            sections_involved: sections,
                            detection_time: now,
                            estimated_impact_minutes: conflict.time_to_impact as i32,
                            description: conflict.description.clone(),
                            auto_resolved: false,
                        };
                        let id = session.insert_conflict(&record).await?;
                        stored_ids.push(id);
                    }
                }
            }
            session.commit().await
        }
        .await;

        match result {
            Ok(()) => stored_ids,
            Err(e) => {
                error!("Error storing conflicts, rolling back: {e:?}");
                if let Err(rollback_err) = session.rollback().await {
                    warn!("Rollback after failed store also failed: {rollback_err:?}");
                }
                Vec::new()
            }
        }
    }

    /// Pushes alerts for severe, imminent conflicts to local clients and
    /// onto the cross-instance channel. Best-effort: failures are logged
    /// and never abort the cycle.
    pub async fn send_alerts(
        &self,
        hub: &ConnectionHub,
        pubsub: Option<&dyn PubSubPort>,
        conflicts: &[DetectedConflict],
    ) -> u64 {
        let mut alerts_sent = 0;

        for conflict in conflicts {
            if conflict.severity_score < self.alert_severity_threshold
                || conflict.time_to_impact > self.alert_time_threshold_minutes
            {
                continue;
            }

            let payload = alert_payload(conflict);
            hub.broadcast_conflict_alert(payload.clone()).await;

            if let Some(pubsub) = pubsub {
                if let Err(e) = pubsub.publish(pubsub::channels::CONFLICTS, &payload).await {
                    warn!("Failed to publish conflict alert: {e}");
                }
            }

            warn!("High-severity conflict alert sent: {}", conflict.description);
            alerts_sent += 1;
        }

        alerts_sent
    }

    pub fn alert_severity_threshold(&self) -> u8 {
        self.alert_severity_threshold
    }

    pub fn alert_time_threshold_minutes(&self) -> f64 {
        self.alert_time_threshold_minutes
    }
}

fn group_by_section(predictions: &[TrainPrediction]) -> HashMap<i64, Vec<&TrainPrediction>> {
    let mut by_section: HashMap<i64, Vec<&TrainPrediction>> = HashMap::new();
    for pred in predictions {
        by_section.entry(pred.section_id).or_default().push(pred);
    }
    for preds in by_section.values_mut() {
        preds.sort_by_key(|p| p.arrival_time);
    }
    by_section
}

fn dedup_conflicts(conflicts: Vec<DetectedConflict>) -> Vec<DetectedConflict> {
    let mut seen = HashSet::new();
    conflicts
        .into_iter()
        .filter(|conflict| seen.insert(conflict.dedup_key()))
        .collect()
}

fn spatial_resolutions(first: &TrainPrediction, second: &TrainPrediction) -> Vec<String> {
    let mut suggestions = Vec::with_capacity(3);
    if first.speed_kmh > second.speed_kmh {
        suggestions.push(format!(
            "Reduce speed of train {} to let train {} clear the section",
            first.train_id, second.train_id
        ));
    } else {
        suggestions.push(format!(
            "Increase speed of train {} to shrink the conflict window",
            second.train_id
        ));
    }
    suggestions.push(format!("Delay train {} by 3-5 minutes", second.train_id));
    suggestions.push(format!(
        "Consider an alternative route for train {}",
        second.train_id
    ));
    suggestions
}

/// Weighted severity score, normalized into 1..=10.
///
/// Weights: time 0.30, priority 0.20, passenger load 0.25, network 0.15,
/// safety 0.10. The raw sum typically lands in ~1..4 and is mapped through
/// `raw / 4 * 9 + 1`.
pub fn severity_score(
    kind: ConflictType,
    trains: &[&Train],
    time_to_impact: f64,
    section_count: usize,
    train_count: usize,
) -> u8 {
    let time_factor = if time_to_impact <= 1.0 {
        3.0
    } else if time_to_impact <= 5.0 {
        2.5
    } else if time_to_impact <= 15.0 {
        2.0
    } else {
        1.0
    };

    let mut priority_factor = 0.0;
    let mut passenger_impact = 0.0;
    for train in trains {
        priority_factor += train.priority as f64 * 0.2;
        passenger_impact += train.current_load as f64;
    }

    let network_factor = section_count as f64 * 0.5 + train_count as f64 * 0.3;

    let safety_factor = match kind {
        ConflictType::SpatialCollision => 3.0,
        ConflictType::JunctionConflict => 2.5,
        ConflictType::TemporalConflict => 2.0,
        ConflictType::PriorityConflict => 1.5,
    };

    let raw_score = time_factor * 0.30
        + priority_factor * 0.20
        + (passenger_impact / 100.0) * 0.25
        + network_factor * 0.15
        + safety_factor * 0.10;

    let scaled = (raw_score / 4.0) * 9.0 + 1.0;
    scaled.round().clamp(1.0, 10.0) as u8
}

/// Wire payload of a `conflict_alert`. The synthetic id stays stable for a
/// given participant set so clients can coalesce repeats until the stored
/// id arrives through other surfaces.
fn alert_payload(conflict: &DetectedConflict) -> serde_json::Value {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    let (trains, sections, _) = conflict.dedup_key();
    let mut hasher = DefaultHasher::new();
    trains.hash(&mut hasher);
    sections.hash(&mut hasher);
    conflict.conflict_type.as_str().hash(&mut hasher);

    json!({
        "conflict_id": format!("temp_{:016x}", hasher.finish()),
        "type": conflict.conflict_type.as_str(),
        "severity": conflict.severity_score,
        "trains_involved": conflict.trains_involved,
        "sections_involved": conflict.sections_involved,
        "time_to_impact": conflict.time_to_impact,
        "description": conflict.description,
        "resolution_suggestions": conflict.resolution_suggestions,
    })
}
