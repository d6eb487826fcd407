use serde::{Deserialize, Serialize};
use chrono::{DateTime, Utc};
use geo::Point;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl From<Point> for GeoPoint {
    fn from(point: Point) -> Self {
        Self {
            latitude: point.y(),
            longitude: point.x(),
        }
    }
}

impl From<GeoPoint> for Point {
    fn from(geo_point: GeoPoint) -> Self {
        Point::new(geo_point.longitude, geo_point.latitude)
    }
}

pub mod train;
pub mod section;
pub mod position;
pub mod prediction;
pub mod conflict;

pub use train::*;
pub use section::*;
pub use position::*;
pub use prediction::*;
pub use conflict::*;

/// Train service class. The numeric `priority` field on `Train` (1..=10,
/// higher wins) is the authoritative ordering; this enum only classifies
/// the rolling stock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrainType {
    Express,
    Local,
    Freight,
    Maintenance,
}

impl TrainType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrainType::Express => "express",
            TrainType::Local => "local",
            TrainType::Freight => "freight",
            TrainType::Maintenance => "maintenance",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "express" => Some(TrainType::Express),
            "local" => Some(TrainType::Local),
            "freight" => Some(TrainType::Freight),
            "maintenance" => Some(TrainType::Maintenance),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationalStatus {
    Active,
    Maintenance,
    OutOfService,
    Emergency,
}

impl OperationalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationalStatus::Active => "active",
            OperationalStatus::Maintenance => "maintenance",
            OperationalStatus::OutOfService => "out_of_service",
            OperationalStatus::Emergency => "emergency",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(OperationalStatus::Active),
            "maintenance" => Some(OperationalStatus::Maintenance),
            "out_of_service" => Some(OperationalStatus::OutOfService),
            "emergency" => Some(OperationalStatus::Emergency),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SectionKind {
    Track,
    Station,
    Junction,
    Yard,
}

impl SectionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SectionKind::Track => "track",
            SectionKind::Station => "station",
            SectionKind::Junction => "junction",
            SectionKind::Yard => "yard",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "track" => Some(SectionKind::Track),
            "station" => Some(SectionKind::Station),
            "junction" => Some(SectionKind::Junction),
            "yard" => Some(SectionKind::Yard),
            _ => None,
        }
    }
}

/// Storage-facing severity bucket, derived from the numeric 1..=10 score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl ConflictSeverity {
    /// Bucket thresholds: low < 4, medium < 6, high < 8, critical >= 8.
    pub fn from_score(score: u8) -> Self {
        match score {
            0..=3 => ConflictSeverity::Low,
            4..=5 => ConflictSeverity::Medium,
            6..=7 => ConflictSeverity::High,
            _ => ConflictSeverity::Critical,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictSeverity::Low => "low",
            ConflictSeverity::Medium => "medium",
            ConflictSeverity::High => "high",
            ConflictSeverity::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "low" => Some(ConflictSeverity::Low),
            "medium" => Some(ConflictSeverity::Medium),
            "high" => Some(ConflictSeverity::High),
            "critical" => Some(ConflictSeverity::Critical),
            _ => None,
        }
    }
}

/// Signed distance between two instants in fractional minutes.
pub fn minutes_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    (to - from).num_milliseconds() as f64 / 60_000.0
}
