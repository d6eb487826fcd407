mod common;

use chrono::Utc;
use std::collections::HashSet;

use common::*;
use railway_core::cache::CacheSnapshot;
use railway_core::config::DetectionConfig;
use railway_core::models::*;
use railway_core::services::ConflictDetector;

fn detector() -> ConflictDetector {
    ConflictDetector::new(&DetectionConfig::default())
}

fn suggestions_lowercase(conflict: &DetectedConflict) -> String {
    conflict.resolution_suggestions.join(" | ").to_lowercase()
}

#[test]
fn head_on_single_track_collision() {
    let now = Utc::now();
    let snapshot = CacheSnapshot::new(
        vec![
            train(1, TrainType::Express, 8, 160, 500),
            train(2, TrainType::Express, 8, 160, 500),
        ],
        vec![section(100, SectionKind::Track, 1, 8_000.0, 120)],
        now,
    );
    let predictions = vec![
        prediction(1, 100, now, 5.0, 8.0),
        prediction(2, 100, now, 6.0, 10.0),
    ];

    let conflicts = detector().detect(&snapshot, &predictions, now);

    assert_eq!(conflicts.len(), 1);
    let conflict = &conflicts[0];
    assert_eq!(conflict.conflict_type, ConflictType::SpatialCollision);
    assert!(conflict.severity_score >= 8);
    let mut trains = conflict.trains_involved.clone();
    trains.sort_unstable();
    assert_eq!(trains, vec![1, 2]);
    assert_eq!(conflict.sections_involved, vec![100]);
    let text = suggestions_lowercase(conflict);
    assert!(text.contains("delay") || text.contains("speed"));
    assert!((conflict.metadata["overlap_minutes"].as_f64().unwrap() - 2.0).abs() < 1e-6);
}

#[test]
fn no_spatial_collision_on_double_track() {
    let now = Utc::now();
    let snapshot = CacheSnapshot::new(
        vec![
            train(1, TrainType::Local, 5, 120, 200),
            train(2, TrainType::Local, 5, 120, 200),
        ],
        vec![section(100, SectionKind::Track, 2, 8_000.0, 120)],
        now,
    );
    let predictions = vec![
        prediction(1, 100, now, 5.0, 8.0),
        prediction(2, 100, now, 6.0, 10.0),
    ];

    let conflicts = detector().detect(&snapshot, &predictions, now);
    assert!(conflicts
        .iter()
        .all(|c| c.conflict_type != ConflictType::SpatialCollision));
}

#[test]
fn touching_windows_are_not_a_collision() {
    let now = Utc::now();
    let snapshot = CacheSnapshot::new(
        vec![
            train(1, TrainType::Local, 5, 120, 200),
            train(2, TrainType::Local, 5, 120, 200),
        ],
        vec![section(100, SectionKind::Track, 1, 8_000.0, 120)],
        now,
    );
    // Second train arrives exactly when the first leaves: zero overlap,
    // but also a zero gap, so neither detector fires.
    let predictions = vec![
        prediction(1, 100, now, 2.0, 6.0),
        prediction(2, 100, now, 6.0, 10.0),
    ];

    let conflicts = detector().detect(&snapshot, &predictions, now);
    assert!(conflicts.is_empty());
}

#[test]
fn temporal_buffer_breach() {
    let now = Utc::now();
    let snapshot = CacheSnapshot::new(
        vec![
            train(1, TrainType::Local, 5, 120, 300),
            train(2, TrainType::Local, 5, 120, 300),
        ],
        vec![section(100, SectionKind::Track, 2, 8_000.0, 120)],
        now,
    );
    // A exits at t+7, B arrives at t+8: 1 minute gap against a 2 minute
    // buffer; the recommended delay is 2 - 1 + 0.5 = 1.5 minutes.
    let predictions = vec![
        prediction(1, 100, now, 2.0, 7.0),
        prediction(2, 100, now, 8.0, 12.0),
    ];

    let conflicts = detector().detect(&snapshot, &predictions, now);

    assert_eq!(conflicts.len(), 1);
    let conflict = &conflicts[0];
    assert_eq!(conflict.conflict_type, ConflictType::TemporalConflict);
    assert!(suggestions_lowercase(conflict).contains("1.5"));
    assert!((conflict.metadata["gap_minutes"].as_f64().unwrap() - 1.0).abs() < 1e-6);
}

#[test]
fn gap_outside_buffer_is_clean() {
    let now = Utc::now();
    let snapshot = CacheSnapshot::new(
        vec![
            train(1, TrainType::Local, 5, 120, 300),
            train(2, TrainType::Local, 5, 120, 300),
        ],
        vec![section(100, SectionKind::Track, 2, 8_000.0, 120)],
        now,
    );
    let predictions = vec![
        prediction(1, 100, now, 2.0, 7.0),
        prediction(2, 100, now, 9.5, 12.0),
    ];

    assert!(detector().detect(&snapshot, &predictions, now).is_empty());
}

#[test]
fn freight_blocking_express() {
    let now = Utc::now();
    let snapshot = CacheSnapshot::new(
        vec![
            train(31, TrainType::Freight, 3, 80, 0),
            train(32, TrainType::Express, 8, 160, 600),
        ],
        vec![section(102, SectionKind::Track, 2, 10_000.0, 140)],
        now,
    );
    let predictions = vec![
        prediction(31, 102, now, 1.0, 8.0),
        prediction(32, 102, now, 6.0, 9.0),
    ];

    let conflicts = detector().detect(&snapshot, &predictions, now);

    assert_eq!(conflicts.len(), 1);
    let conflict = &conflicts[0];
    assert_eq!(conflict.conflict_type, ConflictType::PriorityConflict);
    assert_eq!(conflict.metadata["blocking_train_priority"], 3);
    assert_eq!(conflict.metadata["blocked_train_priority"], 8);
    assert_eq!(conflict.metadata["speed_difference"], 80);
    let text = suggestions_lowercase(conflict);
    assert!(text.contains("hold") || text.contains("bypass"));
}

#[test]
fn equal_priority_express_is_not_blocked() {
    let now = Utc::now();
    let snapshot = CacheSnapshot::new(
        vec![
            train(31, TrainType::Freight, 8, 80, 0),
            train(32, TrainType::Express, 8, 160, 600),
        ],
        vec![section(102, SectionKind::Track, 2, 10_000.0, 140)],
        now,
    );
    let predictions = vec![
        prediction(31, 102, now, 1.0, 8.0),
        prediction(32, 102, now, 6.0, 9.0),
    ];

    assert!(detector().detect(&snapshot, &predictions, now).is_empty());
}

#[test]
fn four_way_junction_overflow() {
    let now = Utc::now();
    let snapshot = CacheSnapshot::new(
        vec![
            train(41, TrainType::Local, 5, 120, 300),
            train(42, TrainType::Local, 5, 120, 300),
            train(43, TrainType::Local, 5, 120, 300),
            train(44, TrainType::Local, 5, 120, 300),
        ],
        vec![section(101, SectionKind::Junction, 2, 500.0, 60)],
        now,
    );
    let predictions = vec![
        prediction(41, 101, now, 0.0, 10.0),
        prediction(42, 101, now, 1.0, 11.0),
        prediction(43, 101, now, 2.0, 12.0),
        prediction(44, 101, now, 3.0, 13.0),
    ];

    let conflicts = detector().detect(&snapshot, &predictions, now);
    let junction_conflicts: Vec<_> = conflicts
        .iter()
        .filter(|c| c.conflict_type == ConflictType::JunctionConflict)
        .collect();

    assert_eq!(junction_conflicts.len(), 1);
    let conflict = junction_conflicts[0];
    assert!(conflict.severity_score >= 6);
    let involved: HashSet<i64> = conflict.trains_involved.iter().copied().collect();
    assert_eq!(involved, HashSet::from([41, 42, 43, 44]));
    assert_eq!(conflict.metadata["overflow"], 2);
}

#[test]
fn junction_within_capacity_is_clean() {
    let now = Utc::now();
    let snapshot = CacheSnapshot::new(
        vec![
            train(41, TrainType::Local, 5, 120, 300),
            train(42, TrainType::Local, 5, 120, 300),
        ],
        vec![section(101, SectionKind::Junction, 2, 500.0, 60)],
        now,
    );
    let predictions = vec![
        prediction(41, 101, now, 0.0, 10.0),
        prediction(42, 101, now, 1.0, 11.0),
    ];

    assert!(detector()
        .detect(&snapshot, &predictions, now)
        .iter()
        .all(|c| c.conflict_type != ConflictType::JunctionConflict));
}

#[test]
fn results_are_deduplicated_and_sorted_by_severity() {
    let now = Utc::now();
    let snapshot = CacheSnapshot::new(
        vec![
            train(1, TrainType::Express, 9, 160, 800),
            train(2, TrainType::Express, 9, 160, 800),
            train(3, TrainType::Local, 4, 100, 50),
            train(4, TrainType::Local, 4, 100, 50),
        ],
        vec![
            section(100, SectionKind::Track, 1, 8_000.0, 120),
            section(200, SectionKind::Track, 2, 8_000.0, 120),
        ],
        now,
    );
    let predictions = vec![
        // Heavy, imminent spatial collision on section 100.
        prediction(1, 100, now, 0.5, 4.0),
        prediction(2, 100, now, 1.0, 5.0),
        // Mild temporal breach far out on section 200.
        prediction(3, 200, now, 40.0, 45.0),
        prediction(4, 200, now, 46.0, 50.0),
    ];

    let conflicts = detector().detect(&snapshot, &predictions, now);

    let mut keys = HashSet::new();
    for conflict in &conflicts {
        assert!(keys.insert(conflict.dedup_key()), "duplicate conflict key");
        assert!((1..=10).contains(&conflict.severity_score));
    }
    for pair in conflicts.windows(2) {
        assert!(pair[0].severity_score >= pair[1].severity_score);
    }
    assert_eq!(conflicts[0].conflict_type, ConflictType::SpatialCollision);
}

#[test]
fn single_prediction_cannot_conflict() {
    let now = Utc::now();
    let snapshot = CacheSnapshot::new(
        vec![train(1, TrainType::Express, 8, 160, 500)],
        vec![section(100, SectionKind::Track, 1, 8_000.0, 120)],
        now,
    );
    let predictions = vec![prediction(1, 100, now, 5.0, 8.0)];
    assert!(detector().detect(&snapshot, &predictions, now).is_empty());
}
