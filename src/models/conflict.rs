use super::*;
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
    SpatialCollision,
    TemporalConflict,
    PriorityConflict,
    JunctionConflict,
}

impl ConflictType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictType::SpatialCollision => "spatial_collision",
            ConflictType::TemporalConflict => "temporal_conflict",
            ConflictType::PriorityConflict => "priority_conflict",
            ConflictType::JunctionConflict => "junction_conflict",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "spatial_collision" => Some(ConflictType::SpatialCollision),
            "temporal_conflict" => Some(ConflictType::TemporalConflict),
            "priority_conflict" => Some(ConflictType::PriorityConflict),
            "junction_conflict" => Some(ConflictType::JunctionConflict),
            _ => None,
        }
    }
}

/// A conflict surfaced by one detection cycle, before persistence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectedConflict {
    pub conflict_type: ConflictType,
    /// 1..=10.
    pub severity_score: u8,
    pub trains_involved: Vec<i64>,
    pub sections_involved: Vec<i64>,
    /// Minutes from detection time; negative when already overdue.
    pub time_to_impact: f64,
    pub predicted_impact_time: DateTime<Utc>,
    pub description: String,
    pub resolution_suggestions: Vec<String>,
    pub metadata: Value,
}

impl DetectedConflict {
    /// Identity used both for in-cycle deduplication and for the open-row
    /// upsert in storage: trains and sections participate sorted so the
    /// key is independent of detection order.
    pub fn dedup_key(&self) -> (Vec<i64>, Vec<i64>, ConflictType) {
        let mut trains = self.trains_involved.clone();
        trains.sort_unstable();
        let mut sections = self.sections_involved.clone();
        sections.sort_unstable();
        (trains, sections, self.conflict_type)
    }

    pub fn severity(&self) -> ConflictSeverity {
        ConflictSeverity::from_score(self.severity_score)
    }
}

/// Insert form of a conflict row.
#[derive(Debug, Clone)]
pub struct ConflictRecord {
    pub conflict_type: ConflictType,
    pub severity: ConflictSeverity,
    pub trains_involved: Vec<i64>,
    pub sections_involved: Vec<i64>,
    pub detection_time: DateTime<Utc>,
    pub estimated_impact_minutes: i32,
    pub description: String,
    pub auto_resolved: bool,
}

/// Storage view of a conflict row. A row with `resolution_time == None`
/// is open; at most one open row exists per dedup key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedConflict {
    pub id: i64,
    pub conflict_type: ConflictType,
    pub severity: ConflictSeverity,
    pub trains_involved: Vec<i64>,
    pub sections_involved: Vec<i64>,
    pub detection_time: DateTime<Utc>,
    pub resolution_time: Option<DateTime<Utc>>,
    pub estimated_impact_minutes: Option<i32>,
    pub description: String,
    pub auto_resolved: bool,
    pub updated_at: DateTime<Utc>,
}
