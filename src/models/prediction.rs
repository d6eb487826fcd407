use super::*;

/// Predicted occupancy of one section by one train. Ephemeral: owned by the
/// detection cycle that produced it and discarded afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainPrediction {
    pub train_id: i64,
    pub section_id: i64,
    pub arrival_time: DateTime<Utc>,
    pub exit_time: DateTime<Utc>,
    pub speed_kmh: f64,
    /// 0..=1, decays with prediction depth.
    pub confidence: f64,
}

impl TrainPrediction {
    /// Overlap of the two occupancy windows in minutes; 0 when disjoint.
    pub fn overlap_minutes(&self, other: &TrainPrediction) -> f64 {
        let latest_start = self.arrival_time.max(other.arrival_time);
        let earliest_end = self.exit_time.min(other.exit_time);
        if latest_start < earliest_end {
            minutes_between(latest_start, earliest_end)
        } else {
            0.0
        }
    }
}
