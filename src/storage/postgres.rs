use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, Row, Transaction};
use std::time::Duration;

use super::{StoragePort, StorageSession};
use crate::config::DatabaseConfig;
use crate::models::*;

/// Postgres-backed storage. Positions live in a time-partitioned table
/// upstream; the queries here only ever touch the freshest slice.
#[derive(Debug, Clone)]
pub struct PgStorage {
    pool: PgPool,
}

impl PgStorage {
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_seconds))
            .connect(&config.url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl StoragePort for PgStorage {
    async fn session(&self) -> Result<Box<dyn StorageSession>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgSession { tx: Some(tx) }))
    }
}

pub struct PgSession {
    tx: Option<Transaction<'static, Postgres>>,
}

impl PgSession {
    fn tx(&mut self) -> Result<&mut Transaction<'static, Postgres>> {
        self.tx
            .as_mut()
            .ok_or_else(|| anyhow!("storage session already finished"))
    }
}

fn train_from_row(row: &PgRow) -> Result<Train> {
    let kind: String = row.try_get("type")?;
    let status: String = row.try_get("operational_status")?;
    Ok(Train {
        id: row.try_get("id")?,
        train_number: row.try_get("train_number")?,
        kind: TrainType::parse(&kind).ok_or_else(|| anyhow!("unknown train type: {kind}"))?,
        priority: row.try_get::<i32, _>("priority")? as u8,
        max_speed_kmh: row.try_get::<i32, _>("max_speed_kmh")? as u32,
        length_meters: row.try_get("length_meters")?,
        weight_tons: row.try_get("weight_tons")?,
        capacity: row.try_get::<i32, _>("capacity")? as u32,
        current_load: row.try_get::<i32, _>("current_load")? as u32,
        current_section_id: row.try_get("current_section_id")?,
        speed_kmh: row.try_get("speed_kmh")?,
        operational_status: OperationalStatus::parse(&status)
            .ok_or_else(|| anyhow!("unknown operational status: {status}"))?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn section_from_row(row: &PgRow) -> Result<Section> {
    let kind: String = row.try_get("section_type")?;
    Ok(Section {
        id: row.try_get("id")?,
        section_code: row.try_get("section_code")?,
        name: row.try_get("name")?,
        kind: SectionKind::parse(&kind).ok_or_else(|| anyhow!("unknown section type: {kind}"))?,
        length_meters: row.try_get("length_meters")?,
        max_speed_kmh: row.try_get::<i32, _>("max_speed_kmh")? as u32,
        capacity: row.try_get::<i32, _>("capacity")? as u32,
        junction_ids: row.try_get("junction_ids")?,
        active: row.try_get("active")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn position_from_row(row: &PgRow) -> Result<Position> {
    let latitude: Option<f64> = row.try_get("latitude")?;
    let longitude: Option<f64> = row.try_get("longitude")?;
    let coordinates = match (latitude, longitude) {
        (Some(latitude), Some(longitude)) => Some(GeoPoint { latitude, longitude }),
        _ => None,
    };
    Ok(Position {
        train_id: row.try_get("train_id")?,
        timestamp: row.try_get("timestamp")?,
        section_id: row.try_get("section_id")?,
        speed_kmh: row.try_get("speed_kmh")?,
        distance_from_start: row.try_get("distance_from_start")?,
        coordinates,
        altitude: row.try_get("altitude")?,
        heading: row.try_get("direction")?,
    })
}

fn conflict_from_row(row: &PgRow) -> Result<PersistedConflict> {
    let kind: String = row.try_get("conflict_type")?;
    let severity: String = row.try_get("severity")?;
    Ok(PersistedConflict {
        id: row.try_get("id")?,
        conflict_type: ConflictType::parse(&kind)
            .ok_or_else(|| anyhow!("unknown conflict type: {kind}"))?,
        severity: ConflictSeverity::parse(&severity)
            .ok_or_else(|| anyhow!("unknown conflict severity: {severity}"))?,
        trains_involved: row.try_get("trains_involved")?,
        sections_involved: row.try_get("sections_involved")?,
        detection_time: row.try_get("detection_time")?,
        resolution_time: row.try_get("resolution_time")?,
        estimated_impact_minutes: row.try_get("estimated_impact_minutes")?,
        description: row.try_get("description")?,
        auto_resolved: row.try_get("auto_resolved")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl StorageSession for PgSession {
    async fn list_active_trains(&mut self) -> Result<Vec<Train>> {
        let tx = self.tx()?;
        let rows = sqlx::query(
            "SELECT id, train_number, type, priority, max_speed_kmh, length_meters, \
                    weight_tons, capacity, current_load, current_section_id, speed_kmh, \
                    operational_status, created_at, updated_at \
             FROM trains WHERE operational_status = 'active' ORDER BY id",
        )
        .fetch_all(&mut **tx)
        .await?;
        rows.iter().map(train_from_row).collect()
    }

    async fn list_active_sections(&mut self) -> Result<Vec<Section>> {
        let tx = self.tx()?;
        let rows = sqlx::query(
            "SELECT id, section_code, name, section_type, length_meters, max_speed_kmh, \
                    capacity, junction_ids, active, created_at, updated_at \
             FROM sections WHERE active = TRUE ORDER BY id",
        )
        .fetch_all(&mut **tx)
        .await?;
        rows.iter().map(section_from_row).collect()
    }

    async fn latest_position(&mut self, train_id: i64) -> Result<Option<Position>> {
        let tx = self.tx()?;
        let row = sqlx::query(
            "SELECT train_id, timestamp, section_id, speed_kmh, distance_from_start, \
                    ST_Y(coordinates::geometry) AS latitude, \
                    ST_X(coordinates::geometry) AS longitude, \
                    altitude, direction \
             FROM positions \
             WHERE train_id = $1 \
             ORDER BY timestamp DESC LIMIT 1",
        )
        .bind(train_id)
        .fetch_optional(&mut **tx)
        .await?;
        row.as_ref().map(position_from_row).transpose()
    }

    async fn latest_positions(&mut self, newer_than: DateTime<Utc>) -> Result<Vec<Position>> {
        let tx = self.tx()?;
        let rows = sqlx::query(
            "SELECT DISTINCT ON (train_id) \
                    train_id, timestamp, section_id, speed_kmh, distance_from_start, \
                    ST_Y(coordinates::geometry) AS latitude, \
                    ST_X(coordinates::geometry) AS longitude, \
                    altitude, direction \
             FROM positions \
             WHERE timestamp > $1 \
             ORDER BY train_id, timestamp DESC",
        )
        .bind(newer_than)
        .fetch_all(&mut **tx)
        .await?;
        rows.iter().map(position_from_row).collect()
    }

    async fn active_schedule(&mut self, train_id: i64) -> Result<Option<TrainSchedule>> {
        let tx = self.tx()?;
        let row = sqlx::query(
            "SELECT id, train_id, route_sections, scheduled_times, active \
             FROM train_schedules \
             WHERE train_id = $1 AND active = TRUE \
             ORDER BY id DESC LIMIT 1",
        )
        .bind(train_id)
        .fetch_optional(&mut **tx)
        .await?;
        match row {
            Some(row) => Ok(Some(TrainSchedule {
                id: row.try_get("id")?,
                train_id: row.try_get("train_id")?,
                route_sections: row.try_get("route_sections")?,
                scheduled_times: row.try_get("scheduled_times")?,
                active: row.try_get("active")?,
            })),
            None => Ok(None),
        }
    }

    async fn find_open_conflict(
        &mut self,
        trains: &[i64],
        sections: &[i64],
        kind: ConflictType,
    ) -> Result<Option<PersistedConflict>> {
        let tx = self.tx()?;
        let row = sqlx::query(
            "SELECT id, conflict_type, severity, trains_involved, sections_involved, \
                    detection_time, resolution_time, estimated_impact_minutes, description, \
                    auto_resolved, updated_at \
             FROM conflicts \
             WHERE trains_involved = $1 AND sections_involved = $2 \
               AND conflict_type = $3 AND resolution_time IS NULL \
             LIMIT 1",
        )
        .bind(trains.to_vec())
        .bind(sections.to_vec())
        .bind(kind.as_str())
        .fetch_optional(&mut **tx)
        .await?;
        row.as_ref().map(conflict_from_row).transpose()
    }

    async fn insert_conflict(&mut self, record: &ConflictRecord) -> Result<i64> {
        let tx = self.tx()?;
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO conflicts \
                (conflict_type, severity, trains_involved, sections_involved, detection_time, \
                 estimated_impact_minutes, description, auto_resolved, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, NOW(), NOW()) \
             RETURNING id",
        )
        .bind(record.conflict_type.as_str())
        .bind(record.severity.as_str())
        .bind(record.trains_involved.clone())
        .bind(record.sections_involved.clone())
        .bind(record.detection_time)
        .bind(record.estimated_impact_minutes)
        .bind(&record.description)
        .bind(record.auto_resolved)
        .fetch_one(&mut **tx)
        .await?;
        Ok(id)
    }

    async fn update_conflict(
        &mut self,
        id: i64,
        severity: ConflictSeverity,
        description: &str,
    ) -> Result<()> {
        let tx = self.tx()?;
        sqlx::query(
            "UPDATE conflicts SET severity = $2, description = $3, updated_at = NOW() \
             WHERE id = $1",
        )
        .bind(id)
        .bind(severity.as_str())
        .bind(description)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        match self.tx.take() {
            Some(tx) => Ok(tx.commit().await?),
            None => Err(anyhow!("storage session already finished")),
        }
    }

    async fn rollback(&mut self) -> Result<()> {
        match self.tx.take() {
            Some(tx) => Ok(tx.rollback().await?),
            None => Err(anyhow!("storage session already finished")),
        }
    }
}
