use super::*;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Train {
    pub id: i64,
    pub train_number: String,
    pub kind: TrainType,
    /// 1..=10, higher is more important.
    pub priority: u8,
    pub max_speed_kmh: u32,
    pub length_meters: f64,
    pub weight_tons: f64,
    /// Passenger or cargo capacity.
    pub capacity: u32,
    pub current_load: u32,
    pub current_section_id: Option<i64>,
    pub speed_kmh: f64,
    pub operational_status: OperationalStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Train {
    pub fn is_active(&self) -> bool {
        self.operational_status == OperationalStatus::Active
    }

    pub fn update_position(&mut self, section_id: i64, speed_kmh: f64) {
        self.current_section_id = Some(section_id);
        self.speed_kmh = speed_kmh;
        self.updated_at = Utc::now();
    }
}
