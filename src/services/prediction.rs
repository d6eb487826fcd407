use super::*;
use chrono::{DateTime, Duration, Utc};
use futures_util::stream::{self, StreamExt};

use crate::cache::CacheSnapshot;
use crate::config::DetectionConfig;
use crate::storage::StorageSession;

/// Floor on per-section traverse time. Keeps tuples time-ordered when the
/// effective speed collapses to zero.
const MIN_TRAVERSE_MINUTES: f64 = 0.1;

/// Resting trains are simulated at this fraction of the section limit.
const RESTING_SPEED_FACTOR: f64 = 0.7;

const BASE_CONFIDENCE: f64 = 0.9;
const CONFIDENCE_DECAY_PER_STEP: f64 = 0.05;
const MIN_CONFIDENCE: f64 = 0.5;

/// Geometry of a section as the simulation needs it.
#[derive(Debug, Clone, Copy)]
pub struct SectionRef {
    pub id: i64,
    pub length_meters: f64,
    pub max_speed_kmh: f64,
}

impl From<&crate::models::Section> for SectionRef {
    fn from(section: &crate::models::Section) -> Self {
        Self {
            id: section.id,
            length_meters: section.length_meters,
            max_speed_kmh: section.max_speed_kmh as f64,
        }
    }
}

/// Simulates forward occupancy for every active train with a fresh position
/// sample. Route and position reads go through the cycle's storage session;
/// the per-train simulation itself fans out over a bounded set of tasks.
pub struct PredictionEngine {
    horizon_minutes: i64,
    position_staleness_minutes: i64,
    max_parallel: usize,
}

struct TrainPathInput {
    train: Train,
    position: Position,
    current: SectionRef,
    route: Vec<SectionRef>,
}

impl PredictionEngine {
    pub fn new(config: &DetectionConfig) -> Self {
        Self {
            horizon_minutes: config.prediction_horizon_minutes,
            position_staleness_minutes: config.position_staleness_minutes,
            max_parallel: config.max_parallel_operations,
        }
    }

    /// One cycle's worth of predictions for the whole fleet.
    pub async fn predict_all(
        &self,
        session: &mut dyn StorageSession,
        snapshot: &CacheSnapshot,
        now: DateTime<Utc>,
    ) -> ServiceResult<Vec<TrainPrediction>> {
        let staleness_threshold = now - Duration::minutes(self.position_staleness_minutes);
        let positions = session.latest_positions(staleness_threshold).await?;

        let mut inputs = Vec::with_capacity(positions.len());
        for position in positions {
            let Some(train) = snapshot.train(position.train_id) else {
                continue;
            };
            if !train.is_active() {
                continue;
            }
            // The latest sample, not the train row, decides where the train is.
            let Some(current) = snapshot.section(position.section_id) else {
                debug!(
                    train_id = train.id,
                    section_id = position.section_id,
                    "position references a section missing from the cache"
                );
                continue;
            };

            let route = match session.active_schedule(train.id).await {
                Ok(Some(schedule)) => schedule
                    .sections_after(position.section_id)
                    .iter()
                    .map_while(|id| snapshot.section(*id).map(SectionRef::from))
                    .collect(),
                Ok(None) => Vec::new(),
                Err(e) => {
                    warn!(train_id = train.id, "schedule lookup failed, predicting current section only: {e:?}");
                    Vec::new()
                }
            };

            inputs.push(TrainPathInput {
                train: train.clone(),
                position,
                current: SectionRef::from(current),
                route,
            });
        }

        let horizon_end = now + Duration::minutes(self.horizon_minutes);
        let predictions: Vec<Vec<TrainPrediction>> = stream::iter(inputs.into_iter().map(|input| {
            async move {
                predict_train_path(
                    &input.train,
                    &input.position,
                    input.current,
                    &input.route,
                    now,
                    horizon_end,
                )
            }
        }))
        .buffer_unordered(self.max_parallel.max(1))
        .collect()
        .await;

        Ok(predictions.into_iter().flatten().collect())
    }
}

/// Pure forward simulation for one train. The current section is emitted at
/// high confidence; each further section decays confidence and advances the
/// simulated clock by the traverse time at the effective speed.
pub fn predict_train_path(
    train: &Train,
    position: &Position,
    current: SectionRef,
    route: &[SectionRef],
    now: DateTime<Utc>,
    horizon_end: DateTime<Utc>,
) -> Vec<TrainPrediction> {
    let mut predictions = Vec::with_capacity(route.len() + 1);

    let current_speed = position.speed_kmh;
    let effective = effective_speed(current_speed, train.max_speed_kmh as f64, current.max_speed_kmh);
    let remaining = (current.length_meters - position.distance_from_start.unwrap_or(0.0)).max(0.0);
    let exit_time = now + minutes(traverse_minutes(remaining, effective));

    predictions.push(TrainPrediction {
        train_id: train.id,
        section_id: current.id,
        arrival_time: now,
        exit_time,
        speed_kmh: effective,
        confidence: BASE_CONFIDENCE,
    });

    let mut sim = exit_time;
    for (step, section) in route.iter().enumerate() {
        if sim > horizon_end {
            break;
        }
        let effective = effective_speed(current_speed, train.max_speed_kmh as f64, section.max_speed_kmh);
        let exit = sim + minutes(traverse_minutes(section.length_meters, effective));

        predictions.push(TrainPrediction {
            train_id: train.id,
            section_id: section.id,
            arrival_time: sim,
            exit_time: exit,
            speed_kmh: effective,
            confidence: (BASE_CONFIDENCE - CONFIDENCE_DECAY_PER_STEP * (step + 1) as f64)
                .max(MIN_CONFIDENCE),
        });

        sim = exit;
    }

    predictions
}

fn effective_speed(current_speed_kmh: f64, train_max_kmh: f64, section_max_kmh: f64) -> f64 {
    let cruise = if current_speed_kmh > 0.0 {
        current_speed_kmh
    } else {
        RESTING_SPEED_FACTOR * section_max_kmh
    };
    cruise.min(train_max_kmh).min(section_max_kmh)
}

fn traverse_minutes(length_meters: f64, speed_kmh: f64) -> f64 {
    let meters_per_minute = speed_kmh * 1000.0 / 60.0;
    if meters_per_minute <= 0.0 {
        return MIN_TRAVERSE_MINUTES;
    }
    (length_meters / meters_per_minute).max(MIN_TRAVERSE_MINUTES)
}

fn minutes(value: f64) -> Duration {
    Duration::milliseconds((value * 60_000.0).round() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{OperationalStatus, TrainType};

    fn train(id: i64, max_speed: u32) -> Train {
        let now = Utc::now();
        Train {
            id,
            train_number: format!("T{id:04}"),
            kind: TrainType::Express,
            priority: 7,
            max_speed_kmh: max_speed,
            length_meters: 300.0,
            weight_tons: 500.0,
            capacity: 800,
            current_load: 400,
            current_section_id: Some(1),
            speed_kmh: 0.0,
            operational_status: OperationalStatus::Active,
            created_at: now,
            updated_at: now,
        }
    }

    fn position(train_id: i64, section_id: i64, speed: f64, distance: f64) -> Position {
        Position {
            train_id,
            timestamp: Utc::now(),
            section_id,
            speed_kmh: speed,
            distance_from_start: Some(distance),
            coordinates: None,
            altitude: None,
            heading: None,
        }
    }

    fn section_ref(id: i64, length: f64, max_speed: f64) -> SectionRef {
        SectionRef {
            id,
            length_meters: length,
            max_speed_kmh: max_speed,
        }
    }

    #[test]
    fn predictions_are_contiguous_and_ordered() {
        let now = Utc::now();
        let t = train(1, 160);
        let p = position(1, 10, 120.0, 2_000.0);
        let route = vec![
            section_ref(11, 6_000.0, 120.0),
            section_ref(12, 3_000.0, 80.0),
        ];
        let preds = predict_train_path(&t, &p, section_ref(10, 5_000.0, 120.0), &route, now, now + Duration::minutes(60));

        assert_eq!(preds.len(), 3);
        for pred in &preds {
            assert!(pred.arrival_time <= pred.exit_time);
        }
        for pair in preds.windows(2) {
            assert_eq!(pair[0].exit_time, pair[1].arrival_time);
        }
        // 3 km left at 120 km/h = 1.5 min.
        assert_eq!(preds[0].exit_time, now + Duration::milliseconds(90_000));
    }

    #[test]
    fn confidence_decays_to_floor() {
        let now = Utc::now();
        let t = train(1, 200);
        let p = position(1, 0, 100.0, 0.0);
        let route: Vec<SectionRef> = (1..=12).map(|i| section_ref(i, 1_000.0, 100.0)).collect();
        let preds = predict_train_path(&t, &p, section_ref(0, 1_000.0, 100.0), &route, now, now + Duration::minutes(60));

        assert_eq!(preds[0].confidence, 0.9);
        for pair in preds.windows(2) {
            assert!(pair[1].confidence <= pair[0].confidence);
        }
        assert_eq!(preds.last().unwrap().confidence, 0.5);
    }

    #[test]
    fn horizon_bounds_arrivals() {
        let now = Utc::now();
        let horizon_end = now + Duration::minutes(60);
        let t = train(1, 120);
        let p = position(1, 0, 30.0, 0.0);
        // Long slow sections: the route extends far beyond the horizon.
        let route: Vec<SectionRef> = (1..=30).map(|i| section_ref(i, 10_000.0, 40.0)).collect();
        let preds = predict_train_path(&t, &p, section_ref(0, 10_000.0, 40.0), &route, now, horizon_end);

        assert!(preds.len() < 31);
        for pred in &preds {
            assert!(pred.arrival_time <= horizon_end);
        }
    }

    #[test]
    fn resting_train_uses_fraction_of_section_limit() {
        let now = Utc::now();
        let t = train(1, 160);
        let p = position(1, 0, 0.0, 0.0);
        let preds = predict_train_path(&t, &p, section_ref(0, 7_000.0, 100.0), &[], now, now + Duration::minutes(60));

        assert_eq!(preds.len(), 1);
        assert!((preds[0].speed_kmh - 70.0).abs() < 1e-9);
    }

    #[test]
    fn zero_speed_zero_limit_clamps_traverse() {
        let now = Utc::now();
        let t = train(1, 160);
        let p = position(1, 0, 0.0, 0.0);
        let preds = predict_train_path(&t, &p, section_ref(0, 1_000.0, 0.0), &[], now, now + Duration::minutes(60));

        assert_eq!(preds.len(), 1);
        assert!(preds[0].arrival_time < preds[0].exit_time);
        assert_eq!(preds[0].exit_time - preds[0].arrival_time, Duration::milliseconds(6_000));
    }

    #[tokio::test]
    async fn stale_and_inactive_trains_are_skipped() {
        use crate::cache::CacheSnapshot;
        use crate::storage::{MemoryStorage, StoragePort};

        let storage = MemoryStorage::new();
        let mut fresh = train(1, 120);
        fresh.speed_kmh = 60.0;
        let mut parked = train(2, 120);
        parked.operational_status = OperationalStatus::Maintenance;
        let stale = train(3, 120);

        let section = crate::models::Section {
            id: 10,
            section_code: "SEC-10".to_string(),
            name: "Main line".to_string(),
            kind: crate::models::SectionKind::Track,
            length_meters: 5_000.0,
            max_speed_kmh: 120,
            capacity: 2,
            junction_ids: None,
            active: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };

        storage.insert_position(position(1, 10, 60.0, 0.0));
        storage.insert_position(position(2, 10, 60.0, 0.0));
        let mut old = position(3, 10, 60.0, 0.0);
        old.timestamp = Utc::now() - Duration::minutes(30);
        storage.insert_position(old);

        let snapshot = CacheSnapshot::new(
            vec![fresh, parked, stale],
            vec![section],
            Utc::now(),
        );

        let engine = PredictionEngine::new(&crate::config::DetectionConfig::default());
        let mut session = storage.session().await.unwrap();
        let preds = engine
            .predict_all(session.as_mut(), &snapshot, Utc::now())
            .await
            .unwrap();

        assert_eq!(preds.len(), 1);
        assert_eq!(preds[0].train_id, 1);
    }
}
