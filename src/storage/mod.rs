use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::*;

pub mod postgres;
pub mod memory;

pub use postgres::PgStorage;
pub use memory::MemoryStorage;

/// Factory for per-cycle storage sessions. A session maps to one database
/// transaction: the scheduler opens exactly one per detection cycle and the
/// session is never shared across cycles or tasks.
#[async_trait]
pub trait StoragePort: Send + Sync {
    async fn session(&self) -> Result<Box<dyn StorageSession>>;
}

/// One unit of storage work. Dropping an uncommitted session rolls its
/// writes back.
#[async_trait]
pub trait StorageSession: Send {
    async fn list_active_trains(&mut self) -> Result<Vec<Train>>;

    async fn list_active_sections(&mut self) -> Result<Vec<Section>>;

    /// Freshest position sample for one train, if any.
    async fn latest_position(&mut self, train_id: i64) -> Result<Option<Position>>;

    /// Freshest position per train, restricted to samples newer than the
    /// given threshold. Trains with no recent sample are absent.
    async fn latest_positions(&mut self, newer_than: DateTime<Utc>) -> Result<Vec<Position>>;

    async fn active_schedule(&mut self, train_id: i64) -> Result<Option<TrainSchedule>>;

    /// Open (unresolved) conflict row matching the dedup key, if any.
    /// `trains` and `sections` must be sorted ascending.
    async fn find_open_conflict(
        &mut self,
        trains: &[i64],
        sections: &[i64],
        kind: ConflictType,
    ) -> Result<Option<PersistedConflict>>;

    async fn insert_conflict(&mut self, record: &ConflictRecord) -> Result<i64>;

    async fn update_conflict(
        &mut self,
        id: i64,
        severity: ConflictSeverity,
        description: &str,
    ) -> Result<()>;

    /// Commits staged writes and exhausts the session; any later call on it
    /// returns an error.
    async fn commit(&mut self) -> Result<()>;

    /// Discards staged writes and exhausts the session.
    async fn rollback(&mut self) -> Result<()>;
}
