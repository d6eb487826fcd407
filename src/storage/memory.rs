use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};

use super::{StoragePort, StorageSession};
use crate::models::*;

/// In-memory storage backend. Serves the test suite and on-laptop runs
/// without a database; sessions stage their writes and apply them on
/// commit, mirroring the transactional behavior of the Postgres backend.
#[derive(Debug, Clone)]
pub struct MemoryStorage {
    state: Arc<Mutex<MemoryState>>,
}

#[derive(Debug, Default)]
struct MemoryState {
    trains: Vec<Train>,
    sections: Vec<Section>,
    positions: Vec<Position>,
    schedules: Vec<TrainSchedule>,
    conflicts: Vec<PersistedConflict>,
    next_conflict_id: i64,
    fail_sessions_remaining: u32,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState {
                next_conflict_id: 1,
                ..MemoryState::default()
            })),
        }
    }

    pub fn insert_train(&self, train: Train) {
        self.state.lock().unwrap().trains.push(train);
    }

    pub fn insert_section(&self, section: Section) {
        self.state.lock().unwrap().sections.push(section);
    }

    pub fn insert_position(&self, position: Position) {
        self.state.lock().unwrap().positions.push(position);
    }

    pub fn insert_schedule(&self, schedule: TrainSchedule) {
        self.state.lock().unwrap().schedules.push(schedule);
    }

    /// Makes the next `n` session acquisitions fail, for exercising the
    /// scheduler's degradation path.
    pub fn fail_next_sessions(&self, n: u32) {
        self.state.lock().unwrap().fail_sessions_remaining = n;
    }

    pub fn open_conflicts(&self) -> Vec<PersistedConflict> {
        self.state
            .lock()
            .unwrap()
            .conflicts
            .iter()
            .filter(|c| c.resolution_time.is_none())
            .cloned()
            .collect()
    }

    pub fn all_conflicts(&self) -> Vec<PersistedConflict> {
        self.state.lock().unwrap().conflicts.clone()
    }
}

#[async_trait]
impl StoragePort for MemoryStorage {
    async fn session(&self) -> Result<Box<dyn StorageSession>> {
        {
            let mut state = self.state.lock().unwrap();
            if state.fail_sessions_remaining > 0 {
                state.fail_sessions_remaining -= 1;
                return Err(anyhow!("injected storage failure"));
            }
        }
        Ok(Box::new(MemorySession {
            state: self.state.clone(),
            staged: Vec::new(),
            finished: false,
        }))
    }
}

enum StagedWrite {
    Insert(PersistedConflict),
    Update {
        id: i64,
        severity: ConflictSeverity,
        description: String,
        updated_at: DateTime<Utc>,
    },
}

pub struct MemorySession {
    state: Arc<Mutex<MemoryState>>,
    staged: Vec<StagedWrite>,
    finished: bool,
}

impl MemorySession {
    fn check_open(&self) -> Result<()> {
        if self.finished {
            Err(anyhow!("storage session already finished"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl StorageSession for MemorySession {
    async fn list_active_trains(&mut self) -> Result<Vec<Train>> {
        self.check_open()?;
        let state = self.state.lock().unwrap();
        Ok(state.trains.iter().filter(|t| t.is_active()).cloned().collect())
    }

    async fn list_active_sections(&mut self) -> Result<Vec<Section>> {
        self.check_open()?;
        let state = self.state.lock().unwrap();
        Ok(state.sections.iter().filter(|s| s.active).cloned().collect())
    }

    async fn latest_position(&mut self, train_id: i64) -> Result<Option<Position>> {
        self.check_open()?;
        let state = self.state.lock().unwrap();
        Ok(state
            .positions
            .iter()
            .filter(|p| p.train_id == train_id)
            .max_by_key(|p| p.timestamp)
            .cloned())
    }

    async fn latest_positions(&mut self, newer_than: DateTime<Utc>) -> Result<Vec<Position>> {
        self.check_open()?;
        let state = self.state.lock().unwrap();
        let mut latest: Vec<Position> = Vec::new();
        for sample in state.positions.iter().filter(|p| p.timestamp > newer_than) {
            match latest.iter_mut().find(|p| p.train_id == sample.train_id) {
                Some(existing) if existing.timestamp < sample.timestamp => {
                    *existing = sample.clone();
                }
                Some(_) => {}
                None => latest.push(sample.clone()),
            }
        }
        latest.sort_by_key(|p| p.train_id);
        Ok(latest)
    }

    async fn active_schedule(&mut self, train_id: i64) -> Result<Option<TrainSchedule>> {
        self.check_open()?;
        let state = self.state.lock().unwrap();
        Ok(state
            .schedules
            .iter()
            .rev()
            .find(|s| s.train_id == train_id && s.active)
            .cloned())
    }

    async fn find_open_conflict(
        &mut self,
        trains: &[i64],
        sections: &[i64],
        kind: ConflictType,
    ) -> Result<Option<PersistedConflict>> {
        self.check_open()?;
        let state = self.state.lock().unwrap();
        Ok(state
            .conflicts
            .iter()
            .find(|c| {
                c.resolution_time.is_none()
                    && c.conflict_type == kind
                    && c.trains_involved == trains
                    && c.sections_involved == sections
            })
            .cloned())
    }

    async fn insert_conflict(&mut self, record: &ConflictRecord) -> Result<i64> {
        self.check_open()?;
        let id = {
            let mut state = self.state.lock().unwrap();
            let id = state.next_conflict_id;
            state.next_conflict_id += 1;
            id
        };
        self.staged.push(StagedWrite::Insert(PersistedConflict {
            id,
            conflict_type: record.conflict_type,
            severity: record.severity,
            trains_involved: record.trains_involved.clone(),
            sections_involved: record.sections_involved.clone(),
            detection_time: record.detection_time,
            resolution_time: None,
            estimated_impact_minutes: Some(record.estimated_impact_minutes),
            description: record.description.clone(),
            auto_resolved: record.auto_resolved,
            updated_at: Utc::now(),
        }));
        Ok(id)
    }

    async fn update_conflict(
        &mut self,
        id: i64,
        severity: ConflictSeverity,
        description: &str,
    ) -> Result<()> {
        self.check_open()?;
        self.staged.push(StagedWrite::Update {
            id,
            severity,
            description: description.to_string(),
            updated_at: Utc::now(),
        });
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        self.check_open()?;
        self.finished = true;
        let mut state = self.state.lock().unwrap();
        for write in self.staged.drain(..) {
            match write {
                StagedWrite::Insert(conflict) => state.conflicts.push(conflict),
                StagedWrite::Update {
                    id,
                    severity,
                    description,
                    updated_at,
                } => {
                    if let Some(row) = state.conflicts.iter_mut().find(|c| c.id == id) {
                        row.severity = severity;
                        row.description = description;
                        row.updated_at = updated_at;
                    }
                }
            }
        }
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        self.check_open()?;
        self.finished = true;
        self.staged.clear();
        Ok(())
    }
}
