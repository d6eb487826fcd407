use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::metrics::AppMetrics;
use crate::models::*;
use crate::services::{ServiceError, ServiceResult};
use crate::storage::StoragePort;

/// Immutable view of the fleet and topology, shared by reference for the
/// duration of a detection cycle. A refresh builds a fresh snapshot and
/// swaps the handle; readers holding the old `Arc` are unaffected.
#[derive(Debug, Clone)]
pub struct CacheSnapshot {
    trains: HashMap<i64, Train>,
    sections: HashMap<i64, Section>,
    pub loaded_at: DateTime<Utc>,
}

impl CacheSnapshot {
    pub fn new(trains: Vec<Train>, sections: Vec<Section>, loaded_at: DateTime<Utc>) -> Self {
        Self {
            trains: trains.into_iter().map(|t| (t.id, t)).collect(),
            sections: sections.into_iter().map(|s| (s.id, s)).collect(),
            loaded_at,
        }
    }

    pub fn train(&self, id: i64) -> Option<&Train> {
        self.trains.get(&id)
    }

    pub fn section(&self, id: i64) -> Option<&Section> {
        self.sections.get(&id)
    }

    pub fn iter_active_trains(&self) -> impl Iterator<Item = &Train> {
        self.trains.values().filter(|t| t.is_active())
    }

    pub fn iter_sections(&self) -> impl Iterator<Item = &Section> {
        self.sections.values()
    }

    pub fn train_count(&self) -> usize {
        self.trains.len()
    }

    pub fn section_count(&self) -> usize {
        self.sections.len()
    }
}

/// TTL cache over the active train and section tables. Lookups during a
/// cycle never touch storage; staleness is bounded by the TTL.
pub struct TopologyCache {
    storage: Arc<dyn StoragePort>,
    metrics: Arc<AppMetrics>,
    ttl: Duration,
    current: RwLock<Option<CachedState>>,
    /// Serializes reloads so concurrent callers share one in-flight refresh.
    refresh_guard: Mutex<()>,
}

#[derive(Debug, Clone)]
struct CachedState {
    snapshot: Arc<CacheSnapshot>,
    expires_at: DateTime<Utc>,
}

impl TopologyCache {
    pub fn new(storage: Arc<dyn StoragePort>, ttl_minutes: i64, metrics: Arc<AppMetrics>) -> Self {
        Self {
            storage,
            metrics,
            ttl: Duration::minutes(ttl_minutes),
            current: RwLock::new(None),
            refresh_guard: Mutex::new(()),
        }
    }

    /// Returns a snapshot no older than the TTL, reloading if needed.
    /// A failed reload falls back to the previous snapshot: stale data
    /// beats no data for conflict detection.
    pub async fn ensure_fresh(&self) -> ServiceResult<Arc<CacheSnapshot>> {
        let now = Utc::now();
        if let Some(state) = self.current.read().await.as_ref() {
            if now <= state.expires_at {
                return Ok(state.snapshot.clone());
            }
        }

        let _guard = self.refresh_guard.lock().await;
        // Another caller may have refreshed while this one waited.
        if let Some(state) = self.current.read().await.as_ref() {
            if Utc::now() <= state.expires_at {
                return Ok(state.snapshot.clone());
            }
        }

        match self.reload().await {
            Ok(snapshot) => {
                let snapshot = Arc::new(snapshot);
                let mut current = self.current.write().await;
                *current = Some(CachedState {
                    snapshot: snapshot.clone(),
                    expires_at: Utc::now() + self.ttl,
                });
                debug!(
                    trains = snapshot.train_count(),
                    sections = snapshot.section_count(),
                    "topology cache refreshed"
                );
                Ok(snapshot)
            }
            Err(e) => {
                self.metrics.cache_refresh_errors_total.inc();
                let current = self.current.read().await;
                match current.as_ref() {
                    Some(state) => {
                        warn!("Cache reload failed, serving stale snapshot: {e:?}");
                        Ok(state.snapshot.clone())
                    }
                    None => Err(ServiceError::Storage(e)),
                }
            }
        }
    }

    /// Current snapshot without freshness guarantees, if one was ever loaded.
    pub async fn snapshot(&self) -> Option<Arc<CacheSnapshot>> {
        self.current.read().await.as_ref().map(|s| s.snapshot.clone())
    }

    /// Invalidates immediately; the next `ensure_fresh` reloads.
    pub async fn force_refresh(&self) {
        let mut current = self.current.write().await;
        if let Some(state) = current.as_mut() {
            state.expires_at = Utc::now() - Duration::seconds(1);
        }
    }

    async fn reload(&self) -> anyhow::Result<CacheSnapshot> {
        let mut session = self.storage.session().await?;
        let trains = session.list_active_trains().await?;
        let sections = session.list_active_sections().await?;
        session.rollback().await?;
        Ok(CacheSnapshot::new(trains, sections, Utc::now()))
    }
}
