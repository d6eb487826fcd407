use super::*;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Section {
    pub id: i64,
    pub section_code: String,
    pub name: String,
    pub kind: SectionKind,
    pub length_meters: f64,
    pub max_speed_kmh: u32,
    /// Maximum concurrent trains; 1 for single track.
    pub capacity: u32,
    /// Neighbor sections, when the topology source provides them.
    pub junction_ids: Option<Vec<i64>>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Section {
    pub fn is_junction(&self) -> bool {
        self.kind == SectionKind::Junction
    }

    pub fn is_single_track(&self) -> bool {
        self.capacity == 1
    }
}
