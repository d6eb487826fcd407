use super::*;

/// One sample from the position feed. Samples are append-only upstream;
/// the core only ever reads the freshest one per train.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub train_id: i64,
    pub timestamp: DateTime<Utc>,
    pub section_id: i64,
    pub speed_kmh: f64,
    pub distance_from_start: Option<f64>,
    pub coordinates: Option<GeoPoint>,
    pub altitude: Option<f64>,
    pub heading: Option<f64>,
}

/// Planned route for a train. Only `route_sections` matters to the core:
/// the slice after the current section is the predicted future.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainSchedule {
    pub id: i64,
    pub train_id: i64,
    pub route_sections: Vec<i64>,
    pub scheduled_times: Vec<DateTime<Utc>>,
    pub active: bool,
}

impl TrainSchedule {
    /// Sections the train still has ahead of it, given where it is now.
    /// Returns an empty slice when the current section is not on the route.
    pub fn sections_after(&self, current_section_id: i64) -> &[i64] {
        match self.route_sections.iter().position(|&id| id == current_section_id) {
            Some(idx) => &self.route_sections[idx + 1..],
            None => &[],
        }
    }
}
